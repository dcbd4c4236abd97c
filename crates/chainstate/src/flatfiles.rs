//! Append-only block and undo file stores.
//!
//! Records are framed `[magic | length | payload]`; undo records carry a
//! trailing checksum binding them to the parent block hash.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use smartd_consensus::Hash256;
use smartd_primitives::hash::sha256d;

/// Pre-allocation granularity; files grow in these steps to limit
/// fragmentation.
pub const BLOCK_FILE_CHUNK: u64 = 16 * 1024 * 1024;
pub const UNDO_FILE_CHUNK: u64 = 1024 * 1024;

const RECORD_HEADER_LEN: u64 = 8;
const CHECKSUM_LEN: u64 = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    BadMagic,
    LengthMismatch,
    ChecksumMismatch,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flatfile location"),
            FlatFileError::BadMagic => write!(f, "flatfile record magic mismatch"),
            FlatFileError::LengthMismatch => write!(f, "flatfile length mismatch"),
            FlatFileError::ChecksumMismatch => write!(f, "undo record checksum mismatch"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    magic: [u8; 4],
    max_file_size: u64,
    chunk_size: u64,
    state: Mutex<FlatFileState>,
}

#[derive(Debug)]
struct FlatFileState {
    current_file: u32,
    current_len: u64,
}

impl FlatFileStore {
    pub fn blocks(
        dir: impl Into<PathBuf>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        Self::new(dir, "blk", magic, max_file_size, BLOCK_FILE_CHUNK)
    }

    pub fn undo(
        dir: impl Into<PathBuf>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        Self::new(dir, "rev", magic, max_file_size, UNDO_FILE_CHUNK)
    }

    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        magic: [u8; 4],
        max_file_size: u64,
        chunk_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = Self::locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            magic,
            max_file_size,
            chunk_size,
            state: Mutex::new(FlatFileState {
                current_file,
                current_len,
            }),
        })
    }

    pub fn current_file_id(&self) -> u32 {
        self.state.lock().expect("flatfile lock").current_file
    }

    /// Appends a framed record, returning where the payload landed.
    pub fn append(&self, payload: &[u8]) -> Result<FileLocation, FlatFileError> {
        self.append_record(payload, None)
    }

    /// Appends an undo record with a checksum binding it to `parent_hash`.
    pub fn append_undo(
        &self,
        parent_hash: &Hash256,
        payload: &[u8],
    ) -> Result<FileLocation, FlatFileError> {
        self.append_record(payload, Some(undo_checksum(parent_hash, payload)))
    }

    fn append_record(
        &self,
        payload: &[u8],
        checksum: Option<Hash256>,
    ) -> Result<FileLocation, FlatFileError> {
        let mut state = self.state.lock().expect("flatfile lock");
        let trailer = if checksum.is_some() { CHECKSUM_LEN } else { 0 };
        let needed = RECORD_HEADER_LEN + payload.len() as u64 + trailer;
        if state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        self.preallocate(&file, offset + needed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&self.magic)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(payload)?;
        if let Some(checksum) = checksum {
            file.write_all(&checksum)?;
        }
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len: payload.len() as u32,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        let (payload, _) = self.read_record(location, false)?;
        Ok(payload)
    }

    /// Reads an undo record and verifies its parent-hash checksum.
    pub fn read_undo(
        &self,
        location: FileLocation,
        parent_hash: &Hash256,
    ) -> Result<Vec<u8>, FlatFileError> {
        let (payload, checksum) = self.read_record(location, true)?;
        let checksum = checksum.ok_or(FlatFileError::InvalidLocation)?;
        if checksum != undo_checksum(parent_hash, &payload) {
            return Err(FlatFileError::ChecksumMismatch);
        }
        Ok(payload)
    }

    fn read_record(
        &self,
        location: FileLocation,
        with_checksum: bool,
    ) -> Result<(Vec<u8>, Option<Hash256>), FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != self.magic {
            return Err(FlatFileError::BadMagic);
        }
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let stored_len = u32::from_le_bytes(len_bytes);
        if stored_len != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut payload = vec![0u8; stored_len as usize];
        file.read_exact(&mut payload)?;
        let checksum = if with_checksum {
            let mut checksum = [0u8; 32];
            file.read_exact(&mut checksum)?;
            Some(checksum)
        } else {
            None
        };
        Ok((payload, checksum))
    }

    fn preallocate(&self, file: &File, needed: u64) -> Result<(), FlatFileError> {
        let current = file.metadata()?.len();
        if current >= needed {
            return Ok(());
        }
        let target = needed.div_ceil(self.chunk_size) * self.chunk_size;
        file.set_len(target.min(self.max_file_size.max(needed)))?;
        Ok(())
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("{}{file_id:05}.dat", self.prefix))
    }

    fn locate_active_file(
        dir: &Path,
        prefix: &str,
        max_file_size: u64,
    ) -> Result<(u32, u64), FlatFileError> {
        let mut file_id = 0u32;
        let mut last_existing: Option<(u32, u64)> = None;
        loop {
            let path = dir.join(format!("{prefix}{file_id:05}.dat"));
            if !path.exists() {
                break;
            }
            let metadata = std::fs::metadata(&path)?;
            last_existing = Some((file_id, metadata.len()));
            file_id += 1;
        }

        match last_existing {
            Some((last_id, len)) => {
                if len >= max_file_size {
                    Ok((last_id + 1, 0))
                } else {
                    Ok((last_id, len))
                }
            }
            None => Ok((0, 0)),
        }
    }
}

pub fn undo_checksum(parent_hash: &Hash256, payload: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(32 + payload.len());
    data.extend_from_slice(parent_hash);
    data.extend_from_slice(payload);
    sha256d(&data)
}
