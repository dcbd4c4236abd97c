//! Consensus parameter definitions.

use crate::deployments::{BitDeployment, MAX_VERSION_BITS_DEPLOYMENTS};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// A historical block allowed to overwrite an earlier unspent duplicate
/// transaction, exempt from the duplicate-coinbase rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Bip30Exception {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    /// Upper bound on valid proof-of-work targets, little-endian.
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty: bool,
    pub pow_no_retargeting: bool,
    /// Blocks with a supermajority version are enforced from this share.
    pub majority_enforce_block_upgrade: i32,
    /// Blocks below the supermajority version are rejected from this share.
    pub majority_reject_block_outdated: i32,
    /// Window of recent blocks the supermajority counts span.
    pub majority_window: i32,
    /// Height from which coinbase transactions must commit the block height.
    pub bip34_height: i32,
    /// Historical overwrites grandfathered out of the duplicate check.
    pub bip30_exceptions: [Bip30Exception; 2],
    pub vdeployments: [BitDeployment; MAX_VERSION_BITS_DEPLOYMENTS],
    /// Blocks of the confirmation window that must signal to lock in.
    pub rule_change_activation_threshold: u32,
    /// Version-bits confirmation window, also the retarget period.
    pub miner_confirmation_window: u32,
    pub checkpoints: Vec<Checkpoint>,
}

impl ChainParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        let byte =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
        *byte_out = byte;
    }
    bytes.reverse();
    Ok(bytes)
}

fn hash_or_zero(hex: &str) -> Hash256 {
    hash256_from_hex(hex).unwrap_or([0u8; 32])
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
    }
}

fn mainnet_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        hash_genesis_block: hash_or_zero(
            "000007acc6970b812948d14ea5a0a13db0fdd07d5047c7e69101fa8b361e05a4",
        ),
        genesis_time: 1_496_467_978,
        genesis_bits: 0x1e0f_ffff,
        pow_limit: {
            let mut limit = [0xffu8; 32];
            limit[31] = 0x00;
            limit[30] = 0x0f;
            limit
        },
        pow_target_spacing: 55,
        pow_target_timespan: 2 * 60 * 60,
        pow_allow_min_difficulty: false,
        pow_no_retargeting: false,
        majority_enforce_block_upgrade: 750,
        majority_reject_block_outdated: 950,
        majority_window: 1000,
        bip34_height: 1,
        bip30_exceptions: [
            Bip30Exception {
                height: 91_842,
                hash: hash_or_zero(
                    "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
                ),
            },
            Bip30Exception {
                height: 91_880,
                hash: hash_or_zero(
                    "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
                ),
            },
        ],
        vdeployments: [
            BitDeployment {
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            BitDeployment {
                bit: 0,
                start_time: 1_486_252_800,
                timeout: 1_549_328_400,
            },
            BitDeployment {
                bit: 1,
                start_time: 1_486_252_800,
                timeout: 1_549_328_400,
            },
        ],
        rule_change_activation_threshold: 1916,
        miner_confirmation_window: 2016,
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash_or_zero(
                "000007acc6970b812948d14ea5a0a13db0fdd07d5047c7e69101fa8b361e05a4",
            ),
        }],
    }
}

fn testnet_params() -> ChainParams {
    let mut params = mainnet_params();
    params.network = Network::Testnet;
    params.hash_genesis_block = hash_or_zero(
        "00000c27b7d9b1b1b8a7c7d9e82e7dff6f40e3476c2bf9077400a1e7bb41de4f",
    );
    params.genesis_time = 1_496_467_979;
    params.majority_enforce_block_upgrade = 51;
    params.majority_reject_block_outdated = 75;
    params.majority_window = 100;
    params.rule_change_activation_threshold = 1512;
    params.checkpoints = vec![Checkpoint {
        height: 0,
        hash: params.hash_genesis_block,
    }];
    params
}

fn regtest_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        hash_genesis_block: [0u8; 32],
        genesis_time: 1_296_688_602,
        genesis_bits: 0x207f_ffff,
        pow_limit: {
            let mut limit = [0xffu8; 32];
            limit[31] = 0x7f;
            limit
        },
        pow_target_spacing: 55,
        pow_target_timespan: 2 * 60 * 60,
        pow_allow_min_difficulty: true,
        pow_no_retargeting: true,
        majority_enforce_block_upgrade: 750,
        majority_reject_block_outdated: 950,
        majority_window: 1000,
        bip34_height: 100_000_000,
        bip30_exceptions: [
            Bip30Exception {
                height: -1,
                hash: [0u8; 32],
            },
            Bip30Exception {
                height: -1,
                hash: [0u8; 32],
            },
        ],
        vdeployments: [
            BitDeployment {
                bit: 28,
                start_time: 0,
                timeout: BitDeployment::ALWAYS_ACTIVE,
            },
            BitDeployment {
                bit: 0,
                start_time: BitDeployment::ALWAYS_ACTIVE,
                timeout: BitDeployment::ALWAYS_ACTIVE,
            },
            BitDeployment {
                bit: 1,
                start_time: BitDeployment::ALWAYS_ACTIVE,
                timeout: BitDeployment::ALWAYS_ACTIVE,
            },
        ],
        rule_change_activation_threshold: 108,
        miner_confirmation_window: 144,
        checkpoints: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips_into_internal_order() {
        let hash = hash256_from_hex(
            "000007acc6970b812948d14ea5a0a13db0fdd07d5047c7e69101fa8b361e05a4",
        )
        .expect("valid hex");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0xa4);
    }

    #[test]
    fn regtest_has_trivial_difficulty() {
        let params = chain_params(Network::Regtest);
        assert!(params.pow_no_retargeting);
        assert_eq!(params.difficulty_adjustment_interval(), 130);
    }
}
