//! Signature hashing for transparent inputs.

use smartd_consensus::Hash256;
use smartd_primitives::encoding::{Encodable, Encoder};
use smartd_primitives::hash::sha256d;
use smartd_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }
}

#[derive(Debug)]
pub enum SighashError {
    InputIndexOutOfRange,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for SighashError {}

/// SIGHASH_SINGLE with no matching output signs the scalar one instead of
/// a transaction digest. Signature checks against it always fail, but the
/// encoding itself is not an error.
fn one_hash() -> Hash256 {
    let mut hash = [0u8; 32];
    hash[0] = 1;
    hash
}

/// Legacy signature hash over the transaction with the signed input's
/// script replaced by `script_code` and every other script emptied.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    let base = sighash_type.base_type();
    let hash_single = base == SIGHASH_SINGLE;
    let hash_none = base == SIGHASH_NONE;
    if hash_single && input_index >= tx.vout.len() {
        return Ok(one_hash());
    }

    let anyone_can_pay = sighash_type.has_anyone_can_pay();

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    let input_count = if anyone_can_pay { 1 } else { tx.vin.len() };
    encoder.write_varint(input_count as u64);
    for idx in 0..input_count {
        let actual_index = if anyone_can_pay { input_index } else { idx };
        let input = &tx.vin[actual_index];
        input.prevout.consensus_encode(&mut encoder);
        let is_signing = actual_index == input_index;
        if is_signing {
            encoder.write_var_bytes(script_code);
        } else {
            encoder.write_varint(0);
        }
        if !is_signing && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_varint(output_count as u64);
    for idx in 0..output_count {
        if hash_single && idx != input_index {
            encoder.write_i64_le(-1);
            encoder.write_varint(0);
        } else {
            tx.vout[idx].consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);

    Ok(sha256d(&encoder.into_inner()))
}

/// Digest for version-0 witness programs: the spent amount is committed
/// and the prevout/sequence/output hashes cover the whole transaction
/// regardless of which input is being signed.
pub fn signature_hash_witness_v0(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: i64,
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    let base = sighash_type.base_type();
    let anyone_can_pay = sighash_type.has_anyone_can_pay();

    let hash_prevouts = if anyone_can_pay {
        [0u8; 32]
    } else {
        let mut encoder = Encoder::new();
        for input in &tx.vin {
            input.prevout.consensus_encode(&mut encoder);
        }
        sha256d(&encoder.into_inner())
    };

    let hash_sequence = if anyone_can_pay || base == SIGHASH_SINGLE || base == SIGHASH_NONE {
        [0u8; 32]
    } else {
        let mut encoder = Encoder::new();
        for input in &tx.vin {
            encoder.write_u32_le(input.sequence);
        }
        sha256d(&encoder.into_inner())
    };

    let hash_outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        let mut encoder = Encoder::new();
        for output in &tx.vout {
            output.consensus_encode(&mut encoder);
        }
        sha256d(&encoder.into_inner())
    } else if base == SIGHASH_SINGLE && input_index < tx.vout.len() {
        let mut encoder = Encoder::new();
        tx.vout[input_index].consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    } else {
        [0u8; 32]
    };

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    encoder.write_bytes(&hash_prevouts);
    encoder.write_bytes(&hash_sequence);
    tx.vin[input_index].prevout.consensus_encode(&mut encoder);
    encoder.write_var_bytes(script_code);
    encoder.write_i64_le(amount);
    encoder.write_u32_le(tx.vin[input_index].sequence);
    encoder.write_bytes(&hash_outputs);
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);

    Ok(sha256d(&encoder.into_inner()))
}
