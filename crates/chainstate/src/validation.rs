//! Stateless block and transaction checks, and the validation state every
//! consensus routine reports through.

use std::collections::HashSet;

use smartd_consensus::constants::{
    COINBASE_MATURITY, MAX_BLOCK_SERIALIZED_SIZE, MAX_BLOCK_BASE_SIZE,
    MAX_BLOCK_SIZE_INCREASE_MULTIPLE, MAX_COINBASE_SCRIPT_LEN, MIN_COINBASE_SCRIPT_LEN,
    LOCKTIME_THRESHOLD, max_block_sigops,
};
use smartd_consensus::money::MAX_MONEY;
use smartd_consensus::Hash256;
use smartd_primitives::block::Block;
use smartd_primitives::merkle::merkle_root;
use smartd_primitives::transaction::Transaction;
use smartd_script::sigops::legacy_sigops;

use crate::coins::Coin;

pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_OBSOLETE: u8 = 0x11;
pub const REJECT_DUPLICATE: u8 = 0x12;
pub const REJECT_NONSTANDARD: u8 = 0x40;
pub const REJECT_INSUFFICIENT_FEE: u8 = 0x42;
pub const REJECT_CHECKPOINT: u8 = 0x43;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationKind {
    /// Consensus violation; permanently bad unless corruption is possible.
    Invalid,
    /// Local failure (disk, database); never attributed to a peer.
    Error,
}

/// The outcome a failed validation routine carries: what went wrong, how
/// hard to punish the source peer, and whether the data may merely be
/// corrupt rather than consensus-invalid.
#[derive(Clone, Debug)]
pub struct ValidationState {
    pub kind: ValidationKind,
    pub reject_code: u8,
    pub reject_reason: &'static str,
    pub debug_message: String,
    pub dos_score: u32,
    pub corruption_possible: bool,
}

impl ValidationState {
    pub fn invalid(reject_code: u8, reject_reason: &'static str, dos_score: u32) -> Self {
        Self {
            kind: ValidationKind::Invalid,
            reject_code,
            reject_reason,
            debug_message: String::new(),
            dos_score,
            corruption_possible: false,
        }
    }

    pub fn dos(score: u32, reject_code: u8, reject_reason: &'static str) -> Self {
        Self::invalid(reject_code, reject_reason, score)
    }

    pub fn error(debug_message: impl Into<String>) -> Self {
        Self {
            kind: ValidationKind::Error,
            reject_code: 0,
            reject_reason: "internal-error",
            debug_message: debug_message.into(),
            dos_score: 0,
            corruption_possible: false,
        }
    }

    pub fn with_debug(mut self, message: impl Into<String>) -> Self {
        self.debug_message = message.into();
        self
    }

    pub fn corruption(mut self) -> Self {
        self.corruption_possible = true;
        self
    }

    pub fn is_invalid(&self) -> bool {
        self.kind == ValidationKind::Invalid
    }

    pub fn is_error(&self) -> bool {
        self.kind == ValidationKind::Error
    }
}

impl std::fmt::Display for ValidationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.debug_message.is_empty() {
            write!(f, "{}", self.reject_reason)
        } else {
            write!(f, "{} ({})", self.reject_reason, self.debug_message)
        }
    }
}

/// The block-size limit in effect for one block, threaded explicitly so a
/// concurrent retune cannot change it mid-validation.
#[derive(Clone, Copy, Debug)]
pub struct BlockSizeContext {
    pub max_block_size: u32,
}

impl BlockSizeContext {
    pub fn legacy() -> Self {
        Self {
            max_block_size: MAX_BLOCK_BASE_SIZE,
        }
    }

    /// The adaptive limit: a multiple of the median recent block size,
    /// never below the legacy limit and never above the serialization cap.
    pub fn adaptive(median_block_size: u32) -> Self {
        let scaled = median_block_size.saturating_mul(MAX_BLOCK_SIZE_INCREASE_MULTIPLE);
        Self {
            max_block_size: scaled
                .max(MAX_BLOCK_BASE_SIZE)
                .min(MAX_BLOCK_SERIALIZED_SIZE),
        }
    }

    pub fn max_sigops(&self) -> u32 {
        max_block_sigops(self.max_block_size)
    }
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationState> {
    if tx.vin.is_empty() {
        return Err(ValidationState::dos(10, REJECT_INVALID, "bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationState::dos(
            10,
            REJECT_INVALID,
            "bad-txns-vout-empty",
        ));
    }
    if tx.encode_without_witness().len() as u32 > MAX_BLOCK_BASE_SIZE {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-oversize"));
    }

    let mut value_out = 0i64;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                "bad-txns-vout-negative",
            ));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                "bad-txns-vout-toolarge",
            ));
        }
        value_out += output.value;
        if value_out > MAX_MONEY {
            return Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                "bad-txns-txouttotal-toolarge",
            ));
        }
    }

    let mut seen_inputs = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen_inputs.insert((input.prevout.hash, input.prevout.index)) {
            return Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                "bad-txns-inputs-duplicate",
            ));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&script_len) {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-length"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationState::dos(
            10,
            REJECT_INVALID,
            "bad-txns-prevout-null",
        ));
    }

    Ok(())
}

/// Context-free block checks. Proof of work is the caller's concern; this
/// covers structure, merkle integrity, size, sigops, and the per-tx rules.
pub fn check_block(
    block: &Block,
    size_context: &BlockSizeContext,
    txids: &[Hash256],
) -> Result<(), ValidationState> {
    if block.transactions.is_empty() {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-blk-length"));
    }
    if txids.len() != block.transactions.len() {
        return Err(ValidationState::error("txid cache length mismatch"));
    }

    let (root, mutated) = merkle_root(txids);
    if mutated {
        // A duplicated-transaction malleation hashes to the same root as
        // the honest block, so the failure must stay retryable.
        return Err(
            ValidationState::dos(100, REJECT_INVALID, "bad-txns-duplicate").corruption(),
        );
    }
    if root != block.header.merkle_root {
        return Err(
            ValidationState::dos(100, REJECT_INVALID, "bad-txnmrklroot").corruption(),
        );
    }

    let serialized_size = block.serialized_size() as u32;
    if serialized_size > size_context.max_block_size
        || serialized_size > MAX_BLOCK_SERIALIZED_SIZE
    {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-blk-length"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-missing"));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-multiple"));
        }
    }

    let mut sigops = 0u32;
    for tx in &block.transactions {
        sigops += transaction_legacy_sigops(tx);
        if sigops > size_context.max_sigops() {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-blk-sigops"));
        }
        check_transaction(tx)?;
    }

    Ok(())
}

/// Legacy sigop count over every scriptSig and scriptPubkey of `tx`.
pub fn transaction_legacy_sigops(tx: &Transaction) -> u32 {
    let input_ops: u32 = tx
        .vin
        .iter()
        .map(|input| legacy_sigops(&input.script_sig, false))
        .sum();
    let output_ops: u32 = tx
        .vout
        .iter()
        .map(|output| legacy_sigops(&output.script_pubkey, false))
        .sum();
    input_ops + output_ops
}

/// Contextual input checks against the coins a transaction consumes, in
/// input order. Returns the fee.
pub fn check_tx_inputs(
    tx: &Transaction,
    spent_coins: &[Coin],
    spend_height: i32,
) -> Result<i64, ValidationState> {
    debug_assert_eq!(tx.vin.len(), spent_coins.len());

    let mut value_in = 0i64;
    for coin in spent_coins {
        if coin.is_coinbase {
            let depth = spend_height as i64 - coin.height as i64;
            if depth < COINBASE_MATURITY as i64 {
                return Err(ValidationState::invalid(
                    REJECT_INVALID,
                    "bad-txns-premature-spend-of-coinbase",
                    0,
                ));
            }
        }
        if !(0..=MAX_MONEY).contains(&coin.value) {
            return Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                "bad-txns-inputvalues-outofrange",
            ));
        }
        value_in += coin.value;
        if value_in > MAX_MONEY {
            return Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                "bad-txns-inputvalues-outofrange",
            ));
        }
    }

    let value_out: i64 = tx.vout.iter().map(|output| output.value).sum();
    if value_in < value_out {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-in-belowout"));
    }
    let fee = value_in - value_out;
    if !(0..=MAX_MONEY).contains(&fee) {
        return Err(ValidationState::dos(
            100,
            REJECT_INVALID,
            "bad-txns-fee-outofrange",
        ));
    }
    Ok(fee)
}

/// Absolute locktime finality under BIP113 semantics: the cutoff is the
/// caller's choice of block time or median time past.
pub fn is_final_tx(tx: &Transaction, height: i32, cutoff_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = tx.lock_time as i64;
    let compare = if lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        cutoff_time
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == u32::MAX)
}

/// Whether the coinbase script commits to the block height with the
/// expected minimal push.
pub fn coinbase_height_matches(tx: &Transaction, height: i32) -> bool {
    if tx.vin.is_empty() {
        return false;
    }
    let expected = script_push_int(height as i64);
    tx.vin[0].script_sig.starts_with(&expected)
}

pub fn script_push_int(value: i64) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1NEGATE: u8 = 0x4f;
    const OP_1: u8 = 0x51;
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8 - 1)];
    }
    let data = script_num_to_vec(value);
    let mut script = Vec::with_capacity(data.len() + 1);
    script.push(data.len() as u8);
    script.extend_from_slice(&data);
    script
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let sign_bit = 0x80u8;
    if let Some(last) = result.last_mut() {
        if (*last & sign_bit) != 0 {
            result.push(if value < 0 { sign_bit } else { 0 });
        } else if value < 0 {
            *last |= sign_bit;
        }
    }
    result
}
