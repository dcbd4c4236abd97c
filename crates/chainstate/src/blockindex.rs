//! In-memory block tree with work-ordered tip candidates.

use std::collections::{BTreeSet, HashMap};

use primitive_types::U256;
use smartd_consensus::constants::MEDIAN_TIME_SPAN;
use smartd_consensus::Hash256;
use smartd_primitives::block::BlockHeader;
use smartd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::flatfiles::FileLocation;

/// Validity ladder, low three bits of the status word. Each step implies
/// every step below it.
pub const BLOCK_VALID_TREE: u32 = 1;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 2;
pub const BLOCK_VALID_CHAIN: u32 = 3;
pub const BLOCK_VALID_SCRIPTS: u32 = 4;
pub const BLOCK_VALID_MASK: u32 = 0x07;

pub const BLOCK_HAVE_DATA: u32 = 1 << 3;
pub const BLOCK_HAVE_UNDO: u32 = 1 << 4;
pub const BLOCK_FAILED_VALID: u32 = 1 << 5;
pub const BLOCK_FAILED_CHILD: u32 = 1 << 6;
pub const BLOCK_OPT_WITNESS: u32 = 1 << 7;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

#[derive(Clone, Debug)]
pub struct BlockIndexEntry {
    pub header: BlockHeader,
    pub height: i32,
    pub chainwork: U256,
    pub tx_count: u32,
    /// Transactions on the chain up to and including this block; zero when
    /// an ancestor's body is still missing.
    pub chain_tx_count: u64,
    pub status: u32,
    /// Monotonic insertion order, the fork tie-break after chain work.
    pub sequence_id: u64,
    pub block_location: Option<FileLocation>,
    pub undo_location: Option<FileLocation>,
    /// Ancestor at a geometrically chosen lower height; all-zero when the
    /// entry has none.
    pub skip_hash: Hash256,
}

impl BlockIndexEntry {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_block
    }

    pub fn validity(&self) -> u32 {
        self.status & BLOCK_VALID_MASK
    }

    pub fn is_failed(&self) -> bool {
        (self.status & BLOCK_FAILED_MASK) != 0
    }

    /// True when validity has reached `up_to` and no failure bit is set.
    pub fn is_valid(&self, up_to: u32) -> bool {
        !self.is_failed() && self.validity() >= up_to
    }

    pub fn has_data(&self) -> bool {
        (self.status & BLOCK_HAVE_DATA) != 0
    }

    pub fn has_undo(&self) -> bool {
        (self.status & BLOCK_HAVE_UNDO) != 0
    }

    pub fn raise_validity(&mut self, up_to: u32) -> bool {
        if self.is_failed() || self.validity() >= up_to {
            return false;
        }
        self.status = (self.status & !BLOCK_VALID_MASK) | up_to;
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_i32_le(self.height);
        encoder.write_bytes(&self.chainwork.to_big_endian());
        encoder.write_u32_le(self.tx_count);
        encoder.write_u64_le(self.chain_tx_count);
        encoder.write_u32_le(self.status);
        encoder.write_u64_le(self.sequence_id);
        encode_location(&mut encoder, self.block_location);
        encode_location(&mut encoder, self.undo_location);
        encoder.write_hash_le(&self.skip_hash);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header_bytes = decoder.read_bytes(smartd_primitives::block::HEADER_SIZE)?;
        let header = BlockHeader::consensus_decode(&header_bytes)?;
        let height = decoder.read_i32_le()?;
        let chainwork = U256::from_big_endian(&decoder.read_fixed::<32>()?);
        let tx_count = decoder.read_u32_le()?;
        let chain_tx_count = decoder.read_u64_le()?;
        let status = decoder.read_u32_le()?;
        let sequence_id = decoder.read_u64_le()?;
        let block_location = decode_location(&mut decoder)?;
        let undo_location = decode_location(&mut decoder)?;
        let skip_hash = decoder.read_hash_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            height,
            chainwork,
            tx_count,
            chain_tx_count,
            status,
            sequence_id,
            block_location,
            undo_location,
            skip_hash,
        })
    }
}

fn encode_location(encoder: &mut Encoder, location: Option<FileLocation>) {
    match location {
        Some(location) => {
            encoder.write_u8(1);
            encoder.write_bytes(&location.encode());
        }
        None => encoder.write_u8(0),
    }
}

fn decode_location(decoder: &mut Decoder) -> Result<Option<FileLocation>, DecodeError> {
    if decoder.read_u8()? == 0 {
        return Ok(None);
    }
    let bytes = decoder.read_fixed::<16>()?;
    FileLocation::decode(&bytes)
        .ok_or(DecodeError::InvalidData("invalid file location"))
        .map(Some)
}

/// Candidate ordering: most work first, then earliest arrival, then hash
/// as the final deterministic tie-break.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CandidateKey {
    pub chainwork: [u8; 32],
    pub sequence_id: u64,
    pub hash: Hash256,
}

impl CandidateKey {
    fn new(entry: &BlockIndexEntry, hash: Hash256) -> Self {
        Self {
            chainwork: entry.chainwork.to_big_endian(),
            sequence_id: entry.sequence_id,
            hash,
        }
    }
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .chainwork
            .cmp(&self.chainwork)
            .then_with(|| self.sequence_id.cmp(&other.sequence_id))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height of the skip-list ancestor for an entry at `height`.
pub fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Arena of every known header plus the candidate set and the active
/// chain. Entries are never removed while the process lives.
#[derive(Default)]
pub struct BlockIndex {
    entries: HashMap<Hash256, BlockIndexEntry>,
    candidates: BTreeSet<CandidateKey>,
    /// Active chain hashes indexed by height.
    chain: Vec<Hash256>,
    best_header: Option<Hash256>,
    next_sequence_id: u64,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            candidates: BTreeSet::new(),
            chain: Vec::new(),
            best_header: None,
            next_sequence_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.entries.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Hash256) -> Option<&mut BlockIndexEntry> {
        self.entries.get_mut(hash)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Hash256, &BlockIndexEntry)> {
        self.entries.iter()
    }

    pub fn best_header(&self) -> Option<Hash256> {
        self.best_header
    }

    pub fn set_best_header(&mut self, hash: Hash256) {
        self.best_header = Some(hash);
    }

    /// Inserts a header whose parent is already indexed (or which is
    /// genesis), computing height, chain work, and the skip pointer.
    pub fn insert(&mut self, header: BlockHeader, proof: U256) -> Hash256 {
        let hash = header.hash();
        if self.entries.contains_key(&hash) {
            return hash;
        }
        let parent = self.entries.get(&header.prev_block);
        let (height, parent_work) = match parent {
            Some(parent) => (parent.height + 1, parent.chainwork),
            None => (0, U256::zero()),
        };
        let skip_hash = if height > 0 {
            self.ancestor_of(&header.prev_block, get_skip_height(height))
                .unwrap_or([0u8; 32])
        } else {
            [0u8; 32]
        };
        let sequence_id = self.next_sequence_id;
        self.next_sequence_id += 1;
        let entry = BlockIndexEntry {
            header,
            height,
            chainwork: parent_work + proof,
            tx_count: 0,
            chain_tx_count: 0,
            status: BLOCK_VALID_TREE,
            sequence_id,
            block_location: None,
            undo_location: None,
            skip_hash,
        };
        let beats_best = match self.best_header.and_then(|best| self.entries.get(&best)) {
            Some(best) => entry.chainwork > best.chainwork,
            None => true,
        };
        self.entries.insert(hash, entry);
        if beats_best {
            self.best_header = Some(hash);
        }
        hash
    }

    /// Restores a persisted entry without recomputing derived fields.
    pub fn insert_loaded(&mut self, hash: Hash256, entry: BlockIndexEntry) {
        self.next_sequence_id = self.next_sequence_id.max(entry.sequence_id + 1);
        let beats_best = match self.best_header.and_then(|best| self.entries.get(&best)) {
            Some(best) => entry.chainwork > best.chainwork,
            None => true,
        };
        self.entries.insert(hash, entry);
        if beats_best {
            self.best_header = Some(hash);
        }
    }

    /// Walks to the ancestor of `hash` at `target_height` using skip
    /// pointers where they help.
    pub fn ancestor_of(&self, hash: &Hash256, target_height: i32) -> Option<Hash256> {
        if target_height < 0 {
            return None;
        }
        let mut entry = self.entries.get(hash)?;
        let mut current_hash = *hash;
        if target_height > entry.height {
            return None;
        }
        while entry.height > target_height {
            let skip_height = get_skip_height(entry.height);
            let next_hash = if entry.skip_hash != [0u8; 32] && skip_height >= target_height {
                entry.skip_hash
            } else {
                entry.prev_hash()
            };
            current_hash = next_hash;
            entry = self.entries.get(&current_hash)?;
        }
        Some(current_hash)
    }

    /// Lowest common ancestor of two indexed blocks.
    pub fn last_common_ancestor(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let entry_a = self.entries.get(a)?;
        let entry_b = self.entries.get(b)?;
        let height = entry_a.height.min(entry_b.height);
        let mut walk_a = self.ancestor_of(a, height)?;
        let mut walk_b = self.ancestor_of(b, height)?;
        while walk_a != walk_b {
            let next_a = self.entries.get(&walk_a)?.prev_hash();
            let next_b = self.entries.get(&walk_b)?.prev_hash();
            walk_a = next_a;
            walk_b = next_b;
        }
        Some(walk_a)
    }

    /// Median of the previous `MEDIAN_TIME_SPAN` block times, the block at
    /// `hash` included.
    pub fn median_time_past(&self, hash: &Hash256) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = *hash;
        for _ in 0..MEDIAN_TIME_SPAN {
            let Some(entry) = self.entries.get(&current) else {
                break;
            };
            times.push(entry.header.time as i64);
            if entry.height == 0 {
                break;
            }
            current = entry.prev_hash();
        }
        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    // Candidate set maintenance. Keys embed the mutable chain work, so the
    // entry must be removed before any status or work mutation and
    // reinserted after.

    pub fn add_candidate(&mut self, hash: Hash256) {
        if let Some(entry) = self.entries.get(&hash) {
            self.candidates.insert(CandidateKey::new(entry, hash));
        }
    }

    pub fn remove_candidate(&mut self, hash: &Hash256) {
        if let Some(entry) = self.entries.get(hash) {
            self.candidates.remove(&CandidateKey::new(entry, *hash));
        }
    }

    pub fn is_candidate(&self, hash: &Hash256) -> bool {
        match self.entries.get(hash) {
            Some(entry) => self.candidates.contains(&CandidateKey::new(entry, *hash)),
            None => false,
        }
    }

    pub fn best_candidate(&self) -> Option<Hash256> {
        self.candidates.first().map(|key| key.hash)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &CandidateKey> {
        self.candidates.iter()
    }

    /// Drops candidates that can no longer beat the active tip.
    pub fn prune_candidates(&mut self, tip_work: U256, tip_hash: &Hash256) {
        let keep: Vec<CandidateKey> = self
            .candidates
            .iter()
            .filter(|key| {
                key.hash == *tip_hash || U256::from_big_endian(&key.chainwork) > tip_work
            })
            .cloned()
            .collect();
        self.candidates = keep.into_iter().collect();
    }

    // Active chain.

    pub fn tip(&self) -> Option<Hash256> {
        self.chain.last().copied()
    }

    pub fn tip_height(&self) -> i32 {
        self.chain.len() as i32 - 1
    }

    pub fn chain_hash_at(&self, height: i32) -> Option<Hash256> {
        if height < 0 {
            return None;
        }
        self.chain.get(height as usize).copied()
    }

    pub fn in_active_chain(&self, hash: &Hash256) -> bool {
        let Some(entry) = self.entries.get(hash) else {
            return false;
        };
        self.chain_hash_at(entry.height) == Some(*hash)
    }

    pub fn push_tip(&mut self, hash: Hash256) {
        self.chain.push(hash);
    }

    pub fn pop_tip(&mut self) -> Option<Hash256> {
        self.chain.pop()
    }

    /// Block locator for the active chain: dense near the tip, then
    /// exponentially sparse back to genesis.
    pub fn locator(&self) -> Vec<Hash256> {
        let mut out = Vec::new();
        let mut step = 1i32;
        let mut height = self.tip_height();
        while height >= 0 {
            if let Some(hash) = self.chain_hash_at(height) {
                out.push(hash);
            }
            if out.len() >= 10 {
                step *= 2;
            }
            if height == 0 {
                break;
            }
            height = (height - step).max(0);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartd_primitives::block::CURRENT_BLOCK_VERSION;

    fn header(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    fn build_chain(index: &mut BlockIndex, length: usize) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(length);
        let mut prev = [0u8; 32];
        for i in 0..length {
            let hash = index.insert(header(prev, 1_000 + i as u32, i as u32), U256::from(2u64));
            hashes.push(hash);
            prev = hash;
        }
        hashes
    }

    #[test]
    fn skip_heights_descend() {
        for height in 2..2_000 {
            let skip = get_skip_height(height);
            assert!(skip < height);
            assert!(skip >= 0);
        }
        assert_eq!(get_skip_height(0), 0);
        assert_eq!(get_skip_height(1), 0);
    }

    #[test]
    fn chainwork_accumulates() {
        let mut index = BlockIndex::new();
        let hashes = build_chain(&mut index, 5);
        for (i, hash) in hashes.iter().enumerate() {
            let entry = index.get(hash).expect("entry");
            assert_eq!(entry.height, i as i32);
            assert_eq!(entry.chainwork, U256::from(2u64 * (i as u64 + 1)));
        }
    }

    #[test]
    fn ancestor_lookup_uses_skips() {
        let mut index = BlockIndex::new();
        let hashes = build_chain(&mut index, 130);
        let tip = hashes[129];
        for target in [0, 1, 63, 64, 100, 129] {
            assert_eq!(
                index.ancestor_of(&tip, target),
                Some(hashes[target as usize]),
                "ancestor at height {target}"
            );
        }
        assert_eq!(index.ancestor_of(&tip, 130), None);
    }

    #[test]
    fn common_ancestor_of_forks() {
        let mut index = BlockIndex::new();
        let trunk = build_chain(&mut index, 10);
        let fork_a = index.insert(header(trunk[6], 5_000, 0xaa), U256::from(2u64));
        let fork_b = index.insert(header(trunk[6], 5_001, 0xbb), U256::from(2u64));
        let fork_b2 = index.insert(header(fork_b, 5_002, 0xbc), U256::from(2u64));
        assert_eq!(index.last_common_ancestor(&fork_a, &fork_b2), Some(trunk[6]));
        assert_eq!(index.last_common_ancestor(&trunk[9], &fork_a), Some(trunk[6]));
    }

    #[test]
    fn candidate_order_prefers_work_then_arrival() {
        let mut index = BlockIndex::new();
        let trunk = build_chain(&mut index, 3);
        // Two competing children with equal work; the first insert wins.
        let first = index.insert(header(trunk[2], 9_000, 1), U256::from(2u64));
        let second = index.insert(header(trunk[2], 9_000, 2), U256::from(2u64));
        index.add_candidate(first);
        index.add_candidate(second);
        assert_eq!(index.best_candidate(), Some(first));

        // More work beats arrival order.
        let heavy = index.insert(header(trunk[2], 9_001, 3), U256::from(100u64));
        index.add_candidate(heavy);
        assert_eq!(index.best_candidate(), Some(heavy));
    }

    #[test]
    fn median_time_past_is_median_of_eleven() {
        let mut index = BlockIndex::new();
        let hashes = build_chain(&mut index, 20);
        // Times are 1_000..1_019; MTP over the last 11 of block 19 is the
        // middle of 1_009..=1_019.
        assert_eq!(index.median_time_past(&hashes[19]), 1_014);
    }

    #[test]
    fn entry_round_trips_through_encoding() {
        let mut index = BlockIndex::new();
        let hashes = build_chain(&mut index, 2);
        let entry = index.get(&hashes[1]).expect("entry").clone();
        let decoded = BlockIndexEntry::decode(&entry.encode()).expect("decode");
        assert_eq!(decoded.height, entry.height);
        assert_eq!(decoded.chainwork, entry.chainwork);
        assert_eq!(decoded.status, entry.status);
        assert_eq!(decoded.sequence_id, entry.sequence_id);
        assert_eq!(decoded.hash(), entry.hash());
    }
}
