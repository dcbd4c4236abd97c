//! Optional secondary indexes, written atomically with the block that
//! populates them.

use smartd_consensus::Hash256;
use smartd_primitives::encoding::{DecodeError, Decoder, Encoder};
use smartd_primitives::outpoint::OutPoint;
use smartd_script::standard::{extract_address_hash, ScriptType};
use smartd_storage::{Column, WriteBatch};

use crate::flatfiles::FileLocation;

pub const ADDRESS_TYPE_P2PKH: u8 = 1;
pub const ADDRESS_TYPE_P2SH: u8 = 2;

pub fn address_type_byte(kind: ScriptType) -> Option<u8> {
    match kind {
        ScriptType::P2Pkh => Some(ADDRESS_TYPE_P2PKH),
        ScriptType::P2Sh => Some(ADDRESS_TYPE_P2SH),
        _ => None,
    }
}

/// (type, hash160) of the address an output pays, when it pays one.
pub fn address_key_of(script_pubkey: &[u8]) -> Option<(u8, [u8; 20])> {
    let (kind, hash) = extract_address_hash(script_pubkey)?;
    let type_byte = address_type_byte(kind)?;
    Some((type_byte, hash))
}

// txindex: txid -> (block file location, offset of the tx in the block).

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub block: FileLocation,
    pub tx_offset: u32,
}

impl TxLocation {
    pub fn encode(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[..16].copy_from_slice(&self.block.encode());
        out[16..].copy_from_slice(&self.tx_offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let block = FileLocation::decode(&bytes[..16])?;
        let tx_offset = u32::from_le_bytes(bytes[16..].try_into().ok()?);
        Some(Self { block, tx_offset })
    }
}

pub fn put_tx_location(batch: &mut WriteBatch, txid: &Hash256, location: &TxLocation) {
    batch.put(Column::TxIndex, *txid, location.encode());
}

pub fn delete_tx_location(batch: &mut WriteBatch, txid: &Hash256) {
    batch.delete(Column::TxIndex, *txid);
}

// addressindex: per-address chronological value deltas.

pub fn address_delta_key(
    address_type: u8,
    address_hash: &[u8; 20],
    height: u32,
    tx_number: u32,
    txid: &Hash256,
    io_index: u32,
    spending: bool,
) -> [u8; 66] {
    let mut key = [0u8; 66];
    key[0] = address_type;
    key[1..21].copy_from_slice(address_hash);
    key[21..25].copy_from_slice(&height.to_be_bytes());
    key[25..29].copy_from_slice(&tx_number.to_be_bytes());
    key[29..61].copy_from_slice(txid);
    key[61..65].copy_from_slice(&io_index.to_be_bytes());
    key[65] = u8::from(spending);
    key
}

pub fn put_address_delta(batch: &mut WriteBatch, key: [u8; 66], amount: i64) {
    batch.put(Column::AddressIndex, key, amount.to_le_bytes());
}

pub fn delete_address_delta(batch: &mut WriteBatch, key: [u8; 66]) {
    batch.delete(Column::AddressIndex, key);
}

// addressunspentindex: the live outputs of an address.

pub fn address_unspent_key(
    address_type: u8,
    address_hash: &[u8; 20],
    outpoint: &OutPoint,
) -> [u8; 57] {
    let mut key = [0u8; 57];
    key[0] = address_type;
    key[1..21].copy_from_slice(address_hash);
    key[21..53].copy_from_slice(&outpoint.hash);
    key[53..].copy_from_slice(&outpoint.index.to_le_bytes());
    key
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressUnspentValue {
    pub amount: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
}

impl AddressUnspentValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.amount);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, DecodeError> {
        // Disconnect writes empty rows instead of deleting; readers must
        // treat them as tombstones.
        if bytes.is_empty() {
            return Ok(None);
        }
        let mut decoder = Decoder::new(bytes);
        let amount = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Some(Self {
            amount,
            script_pubkey,
            height,
        }))
    }
}

pub fn put_address_unspent(
    batch: &mut WriteBatch,
    key: [u8; 57],
    value: &AddressUnspentValue,
) {
    batch.put(Column::AddressUnspent, key, value.encode());
}

pub fn tombstone_address_unspent(batch: &mut WriteBatch, key: [u8; 57]) {
    batch.put(Column::AddressUnspent, key, Vec::new());
}

pub fn delete_address_unspent(batch: &mut WriteBatch, key: [u8; 57]) {
    batch.delete(Column::AddressUnspent, key);
}

// spentindex: which input consumed an output.

pub fn spent_index_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.hash);
    key[32..].copy_from_slice(&outpoint.index.to_le_bytes());
    key
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentIndexValue {
    pub spending_txid: Hash256,
    pub input_index: u32,
    pub height: u32,
    pub amount: i64,
    pub address_type: u8,
    pub address_hash: [u8; 20],
}

impl SpentIndexValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash_le(&self.spending_txid);
        encoder.write_u32_le(self.input_index);
        encoder.write_u32_le(self.height);
        encoder.write_i64_le(self.amount);
        encoder.write_u8(self.address_type);
        encoder.write_bytes(&self.address_hash);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let spending_txid = decoder.read_hash_le()?;
        let input_index = decoder.read_u32_le()?;
        let height = decoder.read_u32_le()?;
        let amount = decoder.read_i64_le()?;
        let address_type = decoder.read_u8()?;
        let address_hash = decoder.read_fixed::<20>()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            spending_txid,
            input_index,
            height,
            amount,
            address_type,
            address_hash,
        })
    }
}

pub fn put_spent_index(batch: &mut WriteBatch, outpoint: &OutPoint, value: &SpentIndexValue) {
    batch.put(Column::SpentIndex, spent_index_key(outpoint), value.encode());
}

pub fn delete_spent_index(batch: &mut WriteBatch, outpoint: &OutPoint) {
    batch.delete(Column::SpentIndex, spent_index_key(outpoint));
}

// timestampindex: block time (big-endian, so scans are chronological) to
// block hash.

pub fn timestamp_index_key(time: u32, block_hash: &Hash256) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..4].copy_from_slice(&time.to_be_bytes());
    key[4..].copy_from_slice(block_hash);
    key
}

pub fn put_timestamp_index(batch: &mut WriteBatch, time: u32, block_hash: &Hash256) {
    batch.put(Column::TimestampIndex, timestamp_index_key(time, block_hash), Vec::new());
}

pub fn delete_timestamp_index(batch: &mut WriteBatch, time: u32, block_hash: &Hash256) {
    batch.delete(Column::TimestampIndex, timestamp_index_key(time, block_hash));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_location_round_trip() {
        let location = TxLocation {
            block: FileLocation {
                file_id: 2,
                offset: 1_234,
                len: 999,
            },
            tx_offset: 81,
        };
        assert_eq!(TxLocation::decode(&location.encode()), Some(location));
    }

    #[test]
    fn address_delta_keys_sort_by_height() {
        let txid = [1u8; 32];
        let low = address_delta_key(ADDRESS_TYPE_P2PKH, &[2u8; 20], 5, 0, &txid, 0, false);
        let high = address_delta_key(ADDRESS_TYPE_P2PKH, &[2u8; 20], 300, 0, &txid, 0, false);
        assert!(low < high);
    }

    #[test]
    fn unspent_value_tombstone() {
        assert_eq!(AddressUnspentValue::decode(&[]).expect("decode"), None);
        let value = AddressUnspentValue {
            amount: 7,
            script_pubkey: vec![0x51],
            height: 3,
        };
        assert_eq!(
            AddressUnspentValue::decode(&value.encode()).expect("decode"),
            Some(value)
        );
    }

    #[test]
    fn spent_value_round_trip() {
        let value = SpentIndexValue {
            spending_txid: [9u8; 32],
            input_index: 1,
            height: 77,
            amount: 1_000,
            address_type: ADDRESS_TYPE_P2SH,
            address_hash: [4u8; 20],
        };
        assert_eq!(
            SpentIndexValue::decode(&value.encode()).expect("decode"),
            value
        );
    }

    #[test]
    fn address_extraction_covers_standard_scripts() {
        let mut p2pkh = vec![0x76, 0xa9, 0x14];
        p2pkh.extend_from_slice(&[5u8; 20]);
        p2pkh.extend_from_slice(&[0x88, 0xac]);
        assert_eq!(address_key_of(&p2pkh), Some((ADDRESS_TYPE_P2PKH, [5u8; 20])));
        assert_eq!(address_key_of(&[0x51]), None);
    }
}
