//! Per-block undo records: the spent coins a disconnect must restore.

use smartd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use smartd_primitives::outpoint::OutPoint;

use crate::coins::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;

/// A coin consumed by a connected block, remembered with enough context
/// to restore it exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentCoin {
    pub outpoint: OutPoint,
    pub coin: Coin,
}

/// Spent inputs of one non-coinbase transaction, in input order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxUndo {
    pub spent: Vec<SpentCoin>,
}

/// One record per non-coinbase transaction, in block order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub tx_undos: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_u32_le(self.tx_undos.len() as u32);
        for tx_undo in &self.tx_undos {
            encoder.write_u32_le(tx_undo.spent.len() as u32);
            for spent in &tx_undo.spent {
                spent.outpoint.consensus_encode(&mut encoder);
                encoder.write_var_bytes(&spent.coin.encode());
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let tx_count = decoder.read_u32_le()? as usize;
        let mut tx_undos = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            let spent_count = decoder.read_u32_le()? as usize;
            let mut spent = Vec::with_capacity(spent_count.min(4096));
            for _ in 0..spent_count {
                let outpoint = OutPoint::consensus_decode(&mut decoder)?;
                let coin_bytes = decoder.read_var_bytes()?;
                let coin = Coin::decode(&coin_bytes)
                    .map_err(|_| DecodeError::InvalidData("invalid coin in undo record"))?;
                spent.push(SpentCoin { outpoint, coin });
            }
            tx_undos.push(TxUndo { spent });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { tx_undos })
    }
}
