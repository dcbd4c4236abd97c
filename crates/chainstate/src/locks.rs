//! Relative lock-time (sequence lock) evaluation.

use smartd_consensus::constants::{
    LOCKTIME_VERIFY_SEQUENCE, SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_GRANULARITY,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use smartd_primitives::transaction::Transaction;

/// The earliest block a transaction's relative locks admit: a height and a
/// median-time-past, both of which the including block must strictly
/// exceed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockPoints {
    pub height: i32,
    pub time: i64,
}

impl LockPoints {
    /// A lock that never binds.
    pub fn free() -> Self {
        Self {
            height: -1,
            time: -1,
        }
    }
}

/// Computes the sequence-lock point of `tx`.
///
/// `prev_heights[i]` is the chain height of input `i`'s origin (the
/// spending height itself for unconfirmed parents), and
/// `median_time_at(h)` must return the median time past of the block at
/// height `h` on the evaluation chain.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    flags: u32,
    prev_heights: &[i32],
    median_time_at: impl Fn(i32) -> i64,
) -> LockPoints {
    debug_assert_eq!(tx.vin.len(), prev_heights.len());

    let mut lock = LockPoints::free();
    // Sequence numbers only carry lock semantics from version 2 on.
    let enforce = tx.version >= 2 && (flags & LOCKTIME_VERIFY_SEQUENCE) != 0;
    if !enforce {
        return lock;
    }

    for (input, &origin_height) in tx.vin.iter().zip(prev_heights) {
        let sequence = input.sequence;
        if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let value = (sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            // Time-based: counted in 512s units from the origin block's
            // prior median time.
            let origin_mtp = median_time_at((origin_height - 1).max(0));
            let min_time = origin_mtp + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1;
            lock.time = lock.time.max(min_time);
        } else {
            let min_height = origin_height + value as i32 - 1;
            lock.height = lock.height.max(min_height);
        }
    }
    lock
}

/// Whether a block at `height` whose predecessor's median time past is
/// `median_time_past` satisfies `lock`.
pub fn evaluate_sequence_locks(height: i32, median_time_past: i64, lock: &LockPoints) -> bool {
    lock.height < height && lock.time < median_time_past
}
