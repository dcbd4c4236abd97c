//! Transaction types and serialization.

use smartd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const CURRENT_TX_VERSION: i32 = 1;

/// Marker and flag bytes introducing the extended (witness) serialization.
const WITNESS_MARKER: u8 = 0x00;
const WITNESS_FLAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack for this input; empty when the input carries none.
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: i64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input and that input's prevout is null.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    /// Transaction identity: hash of the serialization without witness data.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_without_witness())
    }

    /// Full serialization: extended format when any input has a witness.
    pub fn consensus_encode(&self) -> Vec<u8> {
        if !self.has_witness() {
            return self.encode_without_witness();
        }
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_u8(WITNESS_MARKER);
        encoder.write_u8(WITNESS_FLAG);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(&mut encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(&mut encoder);
        }
        for input in &self.vin {
            encoder.write_varint(input.witness.len() as u64);
            for item in &input.witness {
                encoder.write_var_bytes(item);
            }
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn encode_without_witness(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(&mut encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(&mut encoder);
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let mut vin_count = decoder.read_varint()? as usize;
        let mut extended = false;
        if vin_count == usize::from(WITNESS_MARKER) && decoder.peek_u8()? == WITNESS_FLAG {
            decoder.read_u8()?;
            extended = true;
            vin_count = decoder.read_varint()? as usize;
        }
        let mut vin = Vec::with_capacity(vin_count.min(1024));
        for _ in 0..vin_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let vout_count = decoder.read_varint()? as usize;
        let mut vout = Vec::with_capacity(vout_count.min(1024));
        for _ in 0..vout_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        if extended {
            let mut any_witness = false;
            for input in vin.iter_mut() {
                let items = decoder.read_varint()? as usize;
                let mut witness = Vec::with_capacity(items.min(256));
                for _ in 0..items {
                    witness.push(decoder.read_var_bytes()?);
                }
                any_witness |= !witness.is_empty();
                input.witness = witness;
            }
            if !any_witness {
                return Err(DecodeError::InvalidData(
                    "extended serialization without witness data",
                ));
            }
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_tx() -> Transaction {
        Transaction {
            version: CURRENT_TX_VERSION,
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x51], 0xffff_ffff)],
            vout: vec![TxOut::new(50, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn round_trip_legacy() {
        let tx = simple_tx();
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
    }

    #[test]
    fn round_trip_extended() {
        let mut tx = simple_tx();
        tx.vin[0].witness = vec![vec![0xaa; 70], vec![0xbb; 33]];
        let bytes = tx.consensus_encode();
        assert_eq!(bytes[4], 0x00);
        assert_eq!(bytes[5], 0x01);
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
    }

    #[test]
    fn txid_excludes_witness() {
        let mut tx = simple_tx();
        let txid = tx.txid();
        tx.vin[0].witness = vec![vec![0xcc; 10]];
        assert_eq!(tx.txid(), txid);
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = simple_tx();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
    }
}
