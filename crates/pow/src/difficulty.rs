//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use primitive_types::U256;
use smartd_consensus::{ChainParams, Hash256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

/// A header's height, time, and difficulty bits, the slice of index state
/// the retarget function needs.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Expected number of hash attempts the block's target represents,
/// `~target / (target + 1) + 1` in 256-bit arithmetic.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The difficulty bits required of the block extending `chain`, an
/// ascending, contiguous window of recent headers ending at the tip.
///
/// Difficulty holds steady within a retarget interval and adjusts once per
/// interval by the ratio of actual to expected timespan, clamped to 4x in
/// either direction.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    params: &ChainParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    if chain.is_empty() {
        return Ok(pow_limit_bits);
    }
    ensure_contiguous(chain)?;

    let last = chain.last().expect("checked not empty");
    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    let interval = params.difficulty_adjustment_interval();
    let next_height = last.height + 1;
    if next_height % interval != 0 {
        return Ok(last.bits);
    }

    // First header of the closing interval; fall back to the window start
    // when fewer headers were supplied.
    let span = (interval - 1).min(chain.len() as i64 - 1) as usize;
    let first = &chain[chain.len() - 1 - span];

    let mut actual_timespan = last.time - first.time;
    let target_timespan = params.pow_target_timespan;
    if actual_timespan < target_timespan / 4 {
        actual_timespan = target_timespan / 4;
    }
    if actual_timespan > target_timespan * 4 {
        actual_timespan = target_timespan * 4;
    }

    let mut new_target = compact_to_u256(last.bits)?;
    new_target = new_target.saturating_mul(U256::from(actual_timespan as u64));
    new_target /= U256::from(target_timespan as u64);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if new_target > pow_limit {
        new_target = pow_limit;
    }
    Ok(u256_to_compact(new_target))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartd_consensus::params::{chain_params, Network};

    #[test]
    fn compact_round_trip() {
        for bits in [0x1d00_ffffu32, 0x1e0f_ffff, 0x207f_ffff, 0x0312_3456] {
            let value = compact_to_u256(bits).expect("compact");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn negative_compact_rejected() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
    }

    #[test]
    fn proof_grows_as_target_shrinks() {
        let easy = block_proof(0x207f_ffff).expect("proof");
        let hard = block_proof(0x1d00_ffff).expect("proof");
        assert!(hard > easy);
    }

    #[test]
    fn mid_interval_keeps_bits() {
        let params = chain_params(Network::Mainnet);
        let chain = [
            HeaderInfo {
                height: 9,
                time: 1_000,
                bits: 0x1e0f_ffff,
            },
            HeaderInfo {
                height: 10,
                time: 1_055,
                bits: 0x1e0f_ffff,
            },
        ];
        assert_eq!(
            get_next_work_required(&chain, &params).expect("bits"),
            0x1e0f_ffff
        );
    }

    #[test]
    fn slow_blocks_ease_difficulty_at_boundary() {
        let mut params = chain_params(Network::Mainnet);
        params.pow_target_timespan = 550;
        params.pow_target_spacing = 55;
        let interval = params.difficulty_adjustment_interval();
        let bits = 0x1d00_ffff;
        let chain: Vec<HeaderInfo> = (0..interval)
            .map(|i| HeaderInfo {
                height: i,
                // Twice the expected spacing.
                time: 1_000 + i * 110,
                bits,
            })
            .collect();
        let next = get_next_work_required(&chain, &params).expect("bits");
        let old_target = compact_to_u256(bits).expect("target");
        let new_target = compact_to_u256(next).expect("target");
        assert!(new_target > old_target);
    }

    #[test]
    fn non_contiguous_window_rejected() {
        let params = chain_params(Network::Mainnet);
        let chain = [
            HeaderInfo {
                height: 3,
                time: 0,
                bits: 0x1e0f_ffff,
            },
            HeaderInfo {
                height: 5,
                time: 55,
                bits: 0x1e0f_ffff,
            },
        ];
        assert!(matches!(
            get_next_work_required(&chain, &params),
            Err(DifficultyError::NonContiguous)
        ));
    }
}
