//! The validation gauntlet a loose transaction traverses before joining
//! the pool.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use smartd_chainstate::coins::Coin;
use smartd_chainstate::locks::{calculate_sequence_locks, evaluate_sequence_locks};
use smartd_chainstate::state::{ChainState, MEMPOOL_COIN_HEIGHT};
use smartd_chainstate::validation::{check_transaction, is_final_tx};
use smartd_consensus::constants::{
    COINBASE_MATURITY, LOCKTIME_MEDIAN_TIME_PAST, MAX_BIP125_RBF_SEQUENCE,
    MAX_STANDARD_TX_SIGOPS_COST, MAX_STANDARD_TX_SIZE,
};
use smartd_consensus::money::money_range;
use smartd_consensus::Hash256;
use smartd_primitives::hash::hash256_to_hex;
use smartd_primitives::outpoint::OutPoint;
use smartd_primitives::transaction::Transaction;
use smartd_script::interpreter::{
    verify_script, MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
};
use smartd_script::sigops::p2sh_sigops;
use smartd_script::standard::{are_inputs_standard, is_standard_output};
use smartd_storage::KeyValueStore;

use crate::pool::{Mempool, MempoolEntry};

/// Largest version a standard transaction may carry.
const MAX_STANDARD_TX_VERSION: i32 = 2;
/// Replacements may evict at most this many existing transactions.
const MAX_REPLACEMENT_CANDIDATES: usize = 100;
/// Fees beyond this multiple of the relay minimum look like a mistake.
const ABSURD_FEE_MULTIPLE: i64 = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    InvalidTransaction,
    NonStandard,
    AlreadyKnown,
    MissingInputs,
    Conflict,
    InsufficientFee,
    AbsurdFee,
    TooLongChain,
    InvalidScript,
    Internal,
}

#[derive(Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub reason: String,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for MempoolError {}

#[derive(Clone, Copy, Debug)]
pub struct AcceptOptions {
    /// Apply the free-transaction rate limiter.
    pub limit_free: bool,
    /// Permit fees past the absurd-fee guard.
    pub allow_absurd_fee: bool,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        Self {
            limit_free: true,
            allow_absurd_fee: false,
        }
    }
}

/// Runs the full admission pipeline; on success the transaction is in the
/// pool and anything it replaced is gone.
pub fn accept_to_memory_pool<S: KeyValueStore>(
    chain: &mut ChainState<S>,
    pool: &mut Mempool,
    tx: Transaction,
    options: AcceptOptions,
) -> Result<Hash256, MempoolError> {
    let txid = tx.txid();
    let config = chain.config().clone();

    // 1. Coinbases only exist inside blocks.
    if tx.is_coinbase() {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "coinbase",
        ));
    }

    // 2. Context-free checks.
    check_transaction(&tx)
        .map_err(|state| MempoolError::new(MempoolErrorKind::InvalidTransaction, state.to_string()))?;

    let raw = tx.consensus_encode();

    // 3. Standardness of the shape and outputs.
    if config.require_standard {
        if tx.version > MAX_STANDARD_TX_VERSION || tx.version < 1 {
            return Err(MempoolError::new(MempoolErrorKind::NonStandard, "version"));
        }
        if raw.len() as u32 > MAX_STANDARD_TX_SIZE {
            return Err(MempoolError::new(MempoolErrorKind::NonStandard, "tx-size"));
        }
        for output in &tx.vout {
            if !is_standard_output(&output.script_pubkey) {
                return Err(MempoolError::new(
                    MempoolErrorKind::NonStandard,
                    "scriptpubkey",
                ));
            }
        }
    }

    // 4. Final for the next block under BIP113 semantics.
    let next_height = chain.tip_height() + 1;
    let locktime_flags = chain.next_block_locktime_flags();
    let cutoff = if locktime_flags & LOCKTIME_MEDIAN_TIME_PAST != 0 {
        chain.tip_median_time_past()
    } else {
        now_secs() as i64
    };
    if !is_final_tx(&tx, next_height, cutoff) {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "non-final",
        ));
    }

    // 5. Not a duplicate, not recently refused.
    if pool.contains(&txid) {
        return Err(MempoolError::new(
            MempoolErrorKind::AlreadyKnown,
            "txn-already-in-mempool",
        ));
    }
    if pool.was_recently_rejected(&txid) {
        return Err(MempoolError::new(
            MempoolErrorKind::AlreadyKnown,
            "txn-recently-rejected",
        ));
    }

    // 6. Conflicts admit the transaction only through replacement; an
    // instant lock on any input outranks both parties.
    if let Some(locked_to) = chain.conflicting_instant_lock(&tx) {
        return Err(MempoolError::new(
            MempoolErrorKind::Conflict,
            format!("tx-lock-conflict with {}", hash256_to_hex(&locked_to)),
        ));
    }
    let mut conflicts: HashSet<Hash256> = HashSet::new();
    for input in &tx.vin {
        if let Some(conflict) = pool.spender(&input.prevout) {
            conflicts.insert(conflict);
        }
    }
    for conflict in &conflicts {
        let Some(existing) = pool.get(conflict) else {
            continue;
        };
        let replaceable = existing
            .tx
            .vin
            .iter()
            .all(|input| input.sequence <= MAX_BIP125_RBF_SEQUENCE);
        if !replaceable {
            return Err(MempoolError::new(
                MempoolErrorKind::Conflict,
                "txn-mempool-conflict",
            ));
        }
    }

    // 7. Every input must resolve against the chain view layered over the
    // pool; in-pool outputs borrow as if confirmed.
    let mut spent_coins: Vec<Coin> = Vec::with_capacity(tx.vin.len());
    let mut prev_heights: Vec<i32> = Vec::with_capacity(tx.vin.len());
    let mut parents: HashSet<Hash256> = HashSet::new();
    let mut missing: Vec<OutPoint> = Vec::new();
    let mut spends_coinbase = false;
    for input in &tx.vin {
        let coin = chain
            .coin(&input.prevout)
            .map_err(|state| MempoolError::new(MempoolErrorKind::Internal, state.to_string()))?;
        match coin {
            Some(coin) => {
                spends_coinbase |= coin.is_coinbase;
                prev_heights.push(coin.height as i32);
                spent_coins.push(coin);
            }
            None => match pool.output_of(&input.prevout) {
                Some(output) => {
                    parents.insert(input.prevout.hash);
                    prev_heights.push(next_height);
                    spent_coins.push(Coin {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height: MEMPOOL_COIN_HEIGHT,
                        is_coinbase: false,
                    });
                }
                None => missing.push(input.prevout.clone()),
            },
        }
    }
    if !missing.is_empty() {
        missing.sort();
        return Err(MempoolError::new(
            MempoolErrorKind::MissingInputs,
            format!(
                "missing inputs, first {}:{}",
                hash256_to_hex(&missing[0].hash),
                missing[0].index
            ),
        ));
    }

    // Contextual value rules, including coinbase maturity at next height.
    let mut value_in = 0i64;
    for coin in &spent_coins {
        if coin.is_coinbase {
            let depth = next_height as i64 - coin.height as i64;
            if depth < COINBASE_MATURITY as i64 {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    "bad-txns-premature-spend-of-coinbase",
                ));
            }
        }
        value_in = value_in.saturating_add(coin.value);
    }
    let value_out: i64 = tx.vout.iter().map(|output| output.value).sum();
    if value_in < value_out {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "bad-txns-in-belowout",
        ));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "bad-txns-fee-outofrange",
        ));
    }

    // 8. Sequence locks must already admit the next block.
    let lock_points = calculate_sequence_locks(&tx, locktime_flags, &prev_heights, |height| {
        chain.median_time_past_at(height)
    });
    let tip_mtp = chain.tip_median_time_past();
    if !evaluate_sequence_locks(next_height, tip_mtp, &lock_points) {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "non-BIP68-final",
        ));
    }

    // 9. Input standardness.
    if config.require_standard {
        for (input, coin) in tx.vin.iter().zip(&spent_coins) {
            if !are_inputs_standard(&input.script_sig, &coin.script_pubkey) {
                return Err(MempoolError::new(
                    MempoolErrorKind::NonStandard,
                    "bad-txns-nonstandard-inputs",
                ));
            }
        }
    }

    // 10. Sigops budget for a standard transaction.
    let mut sigops_cost = smartd_chainstate::validation::transaction_legacy_sigops(&tx);
    for (input, coin) in tx.vin.iter().zip(&spent_coins) {
        sigops_cost =
            sigops_cost.saturating_add(p2sh_sigops(&coin.script_pubkey, &input.script_sig));
    }
    if sigops_cost > MAX_STANDARD_TX_SIGOPS_COST {
        return Err(MempoolError::new(
            MempoolErrorKind::NonStandard,
            "bad-txns-too-many-sigops",
        ));
    }

    // 11. Fee floor: relay minimum or the pool's eviction floor. A
    // replacement gets no shortcut here; beating its conflicts is an
    // additional bar, not a substitute.
    let min_relay_fee = min_fee_for_size(config.min_relay_fee_per_kb, raw.len());
    let floor_rate = pool.min_fee_rate(config.min_relay_fee_per_kb);
    let floor_fee = min_fee_for_size(floor_rate, raw.len());
    if fee < floor_fee {
        if !options.limit_free {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                "mempool min fee not met",
            ));
        }
        // 12. Free transactions pass through a decaying rate limiter.
        if fee < min_relay_fee && !pool.allow_free(raw.len(), config.limit_free_relay_kb) {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                "rate limited free transaction",
            ));
        }
        if floor_rate > config.min_relay_fee_per_kb {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                "mempool min fee not met",
            ));
        }
    }

    // 13. Fees that dwarf the relay floor are a mistake, not generosity.
    if !options.allow_absurd_fee && fee > min_relay_fee.saturating_mul(ABSURD_FEE_MULTIPLE).max(1)
    {
        return Err(MempoolError::new(
            MempoolErrorKind::AbsurdFee,
            format!("absurdly high fee {fee}"),
        ));
    }

    // 14. Package limits.
    let parent_list: Vec<Hash256> = parents.iter().copied().collect();
    let ancestors = pool.ancestors_of(&parent_list);
    if ancestors.len() + 1 > config.limit_ancestor_count {
        return Err(MempoolError::new(
            MempoolErrorKind::TooLongChain,
            "too-long-mempool-chain",
        ));
    }
    if pool.ancestor_size(&ancestors) + raw.len() > config.limit_ancestor_size {
        return Err(MempoolError::new(
            MempoolErrorKind::TooLongChain,
            "exceeds ancestor size limit",
        ));
    }
    for ancestor in &ancestors {
        let descendants = pool.descendants_of(ancestor);
        if descendants.len() + 1 > config.limit_descendant_count {
            return Err(MempoolError::new(
                MempoolErrorKind::TooLongChain,
                "too many descendants",
            ));
        }
        if pool.descendant_size(&descendants) + raw.len() > config.limit_descendant_size {
            return Err(MempoolError::new(
                MempoolErrorKind::TooLongChain,
                "exceeds descendant size limit",
            ));
        }
    }

    // Replacement policy for the conflicts collected under rule 6.
    if !conflicts.is_empty() {
        check_replacement(pool, &tx, &parents, &conflicts, fee, raw.len(), min_relay_fee)?;
    }

    // 16. Scripts, standard flags first; passing standard but failing
    // mandatory is a bug worth shouting about.
    let standard_flags = if config.require_standard {
        STANDARD_SCRIPT_VERIFY_FLAGS
    } else {
        chain.next_block_script_flags()
    };
    for (input_index, (input, coin)) in tx.vin.iter().zip(&spent_coins).enumerate() {
        verify_script(
            &input.script_sig,
            &coin.script_pubkey,
            &tx,
            input_index,
            coin.value,
            standard_flags,
        )
        .map_err(|err| MempoolError::new(MempoolErrorKind::InvalidScript, err.to_string()))?;

        if let Err(err) = verify_script(
            &input.script_sig,
            &coin.script_pubkey,
            &tx,
            input_index,
            coin.value,
            MANDATORY_SCRIPT_VERIFY_FLAGS,
        ) {
            smartd_log::log_error!(
                "BUG: {} passed standard flags but failed mandatory flags: {err}",
                hash256_to_hex(&txid)
            );
            return Err(MempoolError::new(
                MempoolErrorKind::InvalidScript,
                format!("mandatory-script-verify-flag-failed ({err})"),
            ));
        }
    }

    // Admission: evict the replaced set, insert, and keep the pool within
    // its memory budget.
    for conflict in &conflicts {
        for evicted in pool.remove_with_descendants(conflict) {
            smartd_log::log_info!(
                "replaced {} with {}",
                hash256_to_hex(&evicted.txid),
                hash256_to_hex(&txid)
            );
        }
    }

    let priority = compute_priority(&spent_coins, &prev_heights, chain.tip_height(), raw.len());
    let mut parents: Vec<Hash256> = parents.into_iter().collect();
    parents.sort();
    pool.insert(MempoolEntry {
        txid,
        tx,
        raw,
        time: now_secs(),
        height: chain.tip_height(),
        fee,
        fee_delta: 0,
        sigops_cost,
        priority,
        spends_coinbase,
        lock_points,
        parents,
    });

    pool.expire();
    for evicted in pool.trim_to_size() {
        if evicted.txid == txid {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                "mempool full",
            ));
        }
    }

    Ok(txid)
}

/// The opt-in replacement constraints: strictly better fee rate than every
/// conflicter, absolute fee covering the evicted fees plus relay cost,
/// a bounded eviction set, no new unconfirmed parents, and no spending of
/// outputs created by the replaced set.
fn check_replacement(
    pool: &Mempool,
    tx: &Transaction,
    parents: &HashSet<Hash256>,
    conflicts: &HashSet<Hash256>,
    fee: i64,
    size: usize,
    min_relay_fee: i64,
) -> Result<(), MempoolError> {
    let new_fee_rate = if size == 0 {
        0
    } else {
        fee.saturating_mul(1_000) / size as i64
    };

    let mut all_evicted: HashSet<Hash256> = HashSet::new();
    let mut old_fees = 0i64;
    let mut conflict_parents: HashSet<Hash256> = HashSet::new();
    for conflict in conflicts {
        let entry = pool
            .get(conflict)
            .ok_or_else(|| MempoolError::new(MempoolErrorKind::Internal, "conflict vanished"))?;
        if entry.fee_rate() >= new_fee_rate {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                "insufficient fee rate for replacement",
            ));
        }
        conflict_parents.extend(entry.parents.iter().copied());
        for evicted in pool.descendants_of(conflict) {
            if all_evicted.insert(evicted) {
                if let Some(evicted_entry) = pool.get(&evicted) {
                    old_fees = old_fees.saturating_add(evicted_entry.modified_fee());
                }
            }
        }
    }

    if all_evicted.len() > MAX_REPLACEMENT_CANDIDATES {
        return Err(MempoolError::new(
            MempoolErrorKind::Conflict,
            "too many potential replacements",
        ));
    }

    // Rule 15: a replacement may not spend an output the replaced set
    // created.
    for input in &tx.vin {
        if all_evicted.contains(&input.prevout.hash) {
            return Err(MempoolError::new(
                MempoolErrorKind::Conflict,
                "replacement spends replaced output",
            ));
        }
    }

    // No new unconfirmed parents beyond what the conflicters already had.
    for parent in parents {
        if !conflict_parents.contains(parent) && !conflicts.contains(parent) {
            return Err(MempoolError::new(
                MempoolErrorKind::Conflict,
                "replacement adds unconfirmed parent",
            ));
        }
    }

    if fee < old_fees.saturating_add(min_relay_fee) {
        return Err(MempoolError::new(
            MempoolErrorKind::InsufficientFee,
            format!(
                "replacement fee {fee} below evicted fees {old_fees} plus relay cost"
            ),
        ));
    }

    Ok(())
}

fn min_fee_for_size(fee_per_kb: i64, size: usize) -> i64 {
    let fee = fee_per_kb.saturating_mul(size as i64) / 1_000;
    if fee == 0 && fee_per_kb > 0 {
        fee_per_kb
    } else {
        fee
    }
}

fn compute_priority(
    spent_coins: &[Coin],
    prev_heights: &[i32],
    tip_height: i32,
    size: usize,
) -> f64 {
    if size == 0 {
        return 0.0;
    }
    let mut total = 0.0;
    for (coin, &origin) in spent_coins.iter().zip(prev_heights) {
        if coin.height == MEMPOOL_COIN_HEIGHT {
            continue;
        }
        let age = (tip_height - origin + 1).max(0) as f64;
        total += coin.value.max(0) as f64 * age;
    }
    total / size as f64
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
