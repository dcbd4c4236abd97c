//! Per-file bookkeeping records for the block and undo stores.

use smartd_primitives::encoding::{Decoder, Encoder};

pub const META_LAST_BLOCK_FILE_KEY: &[u8] = b"files:blocks:last";
pub const META_LAST_UNDO_FILE_KEY: &[u8] = b"files:undo:last";

const BLOCK_FILE_INFO_PREFIX: &[u8] = b"b:";
const UNDO_FILE_INFO_PREFIX: &[u8] = b"u:";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileInfo {
    pub blocks: u32,
    pub size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl FileInfo {
    pub fn record_block(&mut self, height: i32, time: u32, size: u64) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || height > self.height_last {
            self.height_last = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        if self.blocks == 0 || time > self.time_last {
            self.time_last = time;
        }
        self.blocks += 1;
        self.size += size;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let blocks = decoder.read_u32_le().ok()?;
        let size = decoder.read_u64_le().ok()?;
        let height_first = decoder.read_i32_le().ok()?;
        let height_last = decoder.read_i32_le().ok()?;
        let time_first = decoder.read_u32_le().ok()?;
        let time_last = decoder.read_u32_le().ok()?;
        if !decoder.is_empty() {
            return None;
        }
        Some(Self {
            blocks,
            size,
            height_first,
            height_last,
            time_first,
            time_last,
        })
    }
}

pub fn block_file_info_key(file_id: u32) -> [u8; 6] {
    file_info_key(BLOCK_FILE_INFO_PREFIX, file_id)
}

pub fn undo_file_info_key(file_id: u32) -> [u8; 6] {
    file_info_key(UNDO_FILE_INFO_PREFIX, file_id)
}

fn file_info_key(prefix: &[u8], file_id: u32) -> [u8; 6] {
    let mut key = [0u8; 6];
    key[..2].copy_from_slice(prefix);
    key[2..].copy_from_slice(&file_id.to_le_bytes());
    key
}
