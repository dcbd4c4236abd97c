//! Version-bits deployment tallying and supermajority version counts.

use std::collections::HashMap;

use smartd_consensus::deployments::{
    is_version_bits, version_bit_set, BitDeployment, DeploymentPos, ALL_DEPLOYMENTS,
    VERSIONBITS_NUM_BITS, VERSIONBITS_TOP_BITS,
};
use smartd_consensus::{ChainParams, Hash256};

use crate::blockindex::BlockIndex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

/// Per-deployment cache of threshold states keyed by the hash of the last
/// block of the preceding period.
#[derive(Default)]
pub struct VersionBitsCache {
    states: [HashMap<Hash256, ThresholdState>; smartd_consensus::deployments::MAX_VERSION_BITS_DEPLOYMENTS],
}

impl VersionBitsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        for map in &mut self.states {
            map.clear();
        }
    }
}

/// State of `pos` for a block whose parent is `prev_hash`.
///
/// Transitions are evaluated only at retarget-period boundaries; within a
/// period every block shares the boundary's state.
pub fn deployment_state(
    index: &BlockIndex,
    params: &ChainParams,
    prev_hash: Option<Hash256>,
    pos: DeploymentPos,
    cache: &mut VersionBitsCache,
) -> ThresholdState {
    let deployment = params.vdeployments[pos.as_usize()];
    if deployment.start_time == BitDeployment::ALWAYS_ACTIVE {
        return ThresholdState::Active;
    }
    if deployment.start_time == BitDeployment::NEVER_ACTIVE {
        return ThresholdState::Failed;
    }

    let period = params.miner_confirmation_window as i32;
    let threshold = params.rule_change_activation_threshold;

    // Walk back to the last block before the period boundary.
    let mut boundary = match prev_hash {
        Some(hash) => match index.get(&hash) {
            Some(entry) => {
                let target_height = entry.height - ((entry.height + 1) % period);
                match index.ancestor_of(&hash, target_height) {
                    Some(ancestor) => Some(ancestor),
                    None => None,
                }
            }
            None => None,
        },
        None => None,
    };

    // Collect boundaries whose state is not yet cached.
    let mut to_compute: Vec<Hash256> = Vec::new();
    let mut state = loop {
        let Some(hash) = boundary else {
            break ThresholdState::Defined;
        };
        if let Some(state) = cache.states[pos.as_usize()].get(&hash) {
            break *state;
        }
        let Some(entry) = index.get(&hash) else {
            break ThresholdState::Defined;
        };
        if (entry.header.time as i64) < deployment.start_time {
            cache.states[pos.as_usize()].insert(hash, ThresholdState::Defined);
            break ThresholdState::Defined;
        }
        to_compute.push(hash);
        boundary = index
            .ancestor_of(&hash, entry.height - period)
            .filter(|_| entry.height >= period);
    };

    while let Some(hash) = to_compute.pop() {
        let median_time = index.median_time_past(&hash);
        state = match state {
            ThresholdState::Defined => {
                if median_time >= deployment.timeout && deployment.timeout > 0 {
                    ThresholdState::Failed
                } else if median_time >= deployment.start_time {
                    ThresholdState::Started
                } else {
                    ThresholdState::Defined
                }
            }
            ThresholdState::Started => {
                if median_time >= deployment.timeout && deployment.timeout > 0 {
                    ThresholdState::Failed
                } else {
                    let mut count = 0u32;
                    let mut walk = Some(hash);
                    for _ in 0..period {
                        let Some(current) = walk else { break };
                        let Some(current_entry) = index.get(&current) else {
                            break;
                        };
                        if version_bit_set(current_entry.header.version, deployment.bit) {
                            count += 1;
                        }
                        if current_entry.height == 0 {
                            break;
                        }
                        walk = Some(current_entry.prev_hash());
                    }
                    if count >= threshold {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
            }
            ThresholdState::LockedIn => ThresholdState::Active,
            ThresholdState::Active => ThresholdState::Active,
            ThresholdState::Failed => ThresholdState::Failed,
        };
        cache.states[pos.as_usize()].insert(hash, state);
    }

    state
}

pub fn deployment_active(
    index: &BlockIndex,
    params: &ChainParams,
    prev_hash: Option<Hash256>,
    pos: DeploymentPos,
    cache: &mut VersionBitsCache,
) -> bool {
    deployment_state(index, params, prev_hash, pos, cache) == ThresholdState::Active
}

/// The version a miner building on `prev_hash` should advertise: top bits
/// plus every deployment currently signalling.
pub fn compute_block_version(
    index: &BlockIndex,
    params: &ChainParams,
    prev_hash: Option<Hash256>,
    cache: &mut VersionBitsCache,
) -> i32 {
    let mut version = VERSIONBITS_TOP_BITS;
    for pos in ALL_DEPLOYMENTS {
        let state = deployment_state(index, params, prev_hash, pos, cache);
        if matches!(state, ThresholdState::Started | ThresholdState::LockedIn) {
            version |= 1 << params.vdeployments[pos.as_usize()].bit;
        }
    }
    version as i32
}

/// Counts signalling on bits no known deployment claims; a high count
/// means the network is soft-forking past this node.
pub fn unknown_bits_signalling(
    index: &BlockIndex,
    params: &ChainParams,
    tip_hash: &Hash256,
    window: usize,
) -> u32 {
    let mut known_mask = 0u32;
    for pos in ALL_DEPLOYMENTS {
        known_mask |= 1 << params.vdeployments[pos.as_usize()].bit;
    }

    let mut count = 0u32;
    let mut walk = Some(*tip_hash);
    for _ in 0..window {
        let Some(hash) = walk else { break };
        let Some(entry) = index.get(&hash) else { break };
        let version = entry.header.version as u32;
        if is_version_bits(entry.header.version)
            && (version & !VERSIONBITS_NUM_MASK_TOP & !known_mask) != 0
        {
            count += 1;
        }
        if entry.height == 0 {
            break;
        }
        walk = Some(entry.prev_hash());
    }
    count
}

const VERSIONBITS_NUM_MASK_TOP: u32 = !((1u32 << VERSIONBITS_NUM_BITS) - 1);

/// Supermajority gate for pre-versionbits upgrades: at least `required` of
/// the last `window` blocks starting at `start_hash` carry a version of at
/// least `min_version`.
pub fn is_super_majority(
    min_version: i32,
    index: &BlockIndex,
    start_hash: Option<Hash256>,
    required: i32,
    window: i32,
) -> bool {
    let mut found = 0i32;
    let mut walk = start_hash;
    for _ in 0..window {
        let Some(hash) = walk else { break };
        let Some(entry) = index.get(&hash) else { break };
        if entry.header.version >= min_version {
            found += 1;
        }
        if found >= required {
            return true;
        }
        if entry.height == 0 {
            break;
        }
        walk = Some(entry.prev_hash());
    }
    found >= required
}
