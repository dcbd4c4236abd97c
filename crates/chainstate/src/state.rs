use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use smartd_consensus::constants::{
    LOCKTIME_MEDIAN_TIME_PAST, LOCKTIME_VERIFY_SEQUENCE, MAX_FUTURE_BLOCK_TIME,
    MIN_BLOCKS_TO_KEEP, NUM_BLOCKS_FOR_MEDIAN_BLOCK,
};
use smartd_consensus::deployments::DeploymentPos;
use smartd_consensus::rewards::block_subsidy;
use smartd_consensus::{ChainParams, Hash256};
use smartd_pow::difficulty::{block_proof, get_next_work_required, HeaderInfo};
use smartd_pow::validation::check_proof_of_work;
use smartd_primitives::block::{Block, BlockHeader};
use smartd_primitives::hash::hash256_to_hex;
use smartd_primitives::outpoint::OutPoint;
use smartd_primitives::transaction::Transaction;
use smartd_script::interpreter::{
    verify_script, ScriptFlags, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY,
    SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, SCRIPT_VERIFY_DERSIG, SCRIPT_VERIFY_P2SH,
    SCRIPT_VERIFY_WITNESS,
};
use smartd_script::sigops::p2sh_sigops;
use smartd_script::standard::is_unspendable;
use smartd_storage::{Column, KeyValueStore, WriteBatch};

use crate::blockindex::{
    BlockIndex, BlockIndexEntry, BLOCK_FAILED_CHILD, BLOCK_FAILED_VALID, BLOCK_HAVE_DATA,
    BLOCK_HAVE_UNDO, BLOCK_OPT_WITNESS, BLOCK_VALID_SCRIPTS, BLOCK_VALID_TRANSACTIONS,
};
use crate::coins::{BlockCoins, Coin, CoinsCache, CoinsView};
use crate::config::EngineConfig;
use crate::filemeta::{
    block_file_info_key, undo_file_info_key, FileInfo, META_LAST_BLOCK_FILE_KEY,
    META_LAST_UNDO_FILE_KEY,
};
use crate::flatfiles::{FileLocation, FlatFileStore};
use crate::indexes::{
    address_delta_key, address_key_of, address_unspent_key, delete_address_delta,
    delete_spent_index, delete_timestamp_index, delete_tx_location, put_address_delta,
    put_address_unspent, put_spent_index, put_timestamp_index, put_tx_location,
    tombstone_address_unspent, AddressUnspentValue, SpentIndexValue, TxLocation,
};
use crate::locks::{calculate_sequence_locks, evaluate_sequence_locks};
use crate::notify::{
    BlockSource, ChainListener, GovernanceValidator, InstantLockOracle, NullGovernance,
    NullInstantLocks, NullListener, NullSporks, PeerLedger, Spork, SporkOracle,
};
use crate::undo::{BlockUndo, SpentCoin, TxUndo};
use crate::validation::{
    check_block, check_tx_inputs, coinbase_height_matches, is_final_tx,
    transaction_legacy_sigops, BlockSizeContext, ValidationState, REJECT_DUPLICATE,
    REJECT_INVALID, REJECT_OBSOLETE,
};
use crate::versionbits::{deployment_active, is_super_majority, VersionBitsCache};

/// Connected blocks are applied in batches of this many before the
/// activation loop yields.
const ACTIVATION_BATCH: i32 = 32;
/// Seconds between periodic flushes.
const PERIODIC_FLUSH_INTERVAL: u64 = 60 * 60;
/// Bound on the remembered script-verification successes.
const SCRIPT_CACHE_CAPACITY: usize = 200_000;
/// Bound on block bodies parked while their parent body is missing.
const MAX_ORPHAN_BLOCKS: usize = 64;

/// Block versions at or above this signal adaptive block sizing through
/// the plain version field. Other deployments signal through the same
/// field, so collisions are possible; the behavior is kept as the
/// original network shipped it.
const ADAPTIVE_BLOCK_SIZE_VERSION: i32 = 5;

const SUPERMAJORITY_VERSION_LADDER: [(i32, ScriptFlags); 2] = [
    (3, SCRIPT_VERIFY_DERSIG),
    (4, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY),
];

/// Coins created in the mempool have no chain height yet; this sentinel
/// keeps them distinguishable inside lock calculations.
pub const MEMPOOL_COIN_HEIGHT: u32 = 0x7fff_ffff;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    Always,
    Periodic,
    IfNeeded,
    None,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    Ok,
    /// Rollback completed but the coin set is not byte-identical to the
    /// pre-connect state; the caller treats it as recoverable.
    Unclean,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockAccept {
    Accepted,
    AlreadyHave,
    /// Parent body missing; the block is parked for later promotion.
    Orphaned,
    /// Unrequested block with too little work, or too far ahead.
    Ignored,
}

/// What the activator needs from the mempool; methods take plain data so
/// the pool never re-enters the chain state.
pub trait MempoolBridge {
    /// Transactions from a disconnected block, coinbase excluded. Failures
    /// are the pool's to swallow.
    fn resurrect(&mut self, txs: Vec<Transaction>);

    /// A block reached the active chain; its transactions and anything
    /// now double-spent must leave the pool.
    fn removed_for_block(&mut self, txs: &[Transaction]);

    /// The tip moved; re-filter against the new locktime context and
    /// forget recent rejections.
    fn tip_changed(&mut self, height: i32, median_time_past: i64);
}

pub struct NullMempoolBridge;

impl MempoolBridge for NullMempoolBridge {
    fn resurrect(&mut self, _txs: Vec<Transaction>) {}
    fn removed_for_block(&mut self, _txs: &[Transaction]) {}
    fn tip_changed(&mut self, _height: i32, _median_time_past: i64) {}
}

/// The whole chain engine: block index, coin views, file stores, and the
/// activation state machine. One value per process; every mutation runs
/// under the caller's lock discipline.
pub struct ChainState<S> {
    store: Arc<S>,
    params: ChainParams,
    config: EngineConfig,
    index: BlockIndex,
    coins: CoinsCache<S>,
    blocks: FlatFileStore,
    undo: FlatFileStore,
    versionbits: VersionBitsCache,
    peers: PeerLedger,
    listener: Arc<dyn ChainListener>,
    governance: Arc<dyn GovernanceValidator>,
    instant_locks: Arc<dyn InstantLockOracle>,
    sporks: Arc<dyn SporkOracle>,
    /// Blocks the governance validator refused, with the refusal time, so
    /// repeated submissions can be rate limited.
    rejected_blocks: HashMap<Hash256, u64>,
    /// Verified (txid, flags) pairs; survives reorgs so reconnects skip
    /// script checks.
    script_cache: HashSet<(Hash256, ScriptFlags)>,
    script_cache_order: VecDeque<(Hash256, ScriptFlags)>,
    orphan_blocks: HashMap<Hash256, Vec<Block>>,
    orphan_count: usize,
    block_file_info: HashMap<u32, FileInfo>,
    undo_file_info: HashMap<u32, FileInfo>,
    dirty_entries: HashSet<Hash256>,
    dirty_files: HashSet<u32>,
    dirty_undo_files: HashSet<u32>,
    shutdown: Arc<AtomicBool>,
    ibd_latch: bool,
    last_flush: u64,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(
        store: Arc<S>,
        blocks: FlatFileStore,
        undo: FlatFileStore,
        params: ChainParams,
        config: EngineConfig,
    ) -> Result<Self, ValidationState> {
        let coins = CoinsCache::new(Arc::clone(&store))
            .map_err(|err| ValidationState::error(err.to_string()))?;
        let mut state = Self {
            store,
            params,
            config,
            index: BlockIndex::new(),
            coins,
            blocks,
            undo,
            versionbits: VersionBitsCache::new(),
            peers: PeerLedger::new(),
            listener: Arc::new(NullListener),
            governance: Arc::new(NullGovernance),
            instant_locks: Arc::new(NullInstantLocks),
            sporks: Arc::new(NullSporks),
            rejected_blocks: HashMap::new(),
            script_cache: HashSet::new(),
            script_cache_order: VecDeque::new(),
            orphan_blocks: HashMap::new(),
            orphan_count: 0,
            block_file_info: HashMap::new(),
            undo_file_info: HashMap::new(),
            dirty_entries: HashSet::new(),
            dirty_files: HashSet::new(),
            dirty_undo_files: HashSet::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            ibd_latch: true,
            last_flush: now_secs(),
        };
        state.load()?;
        Ok(state)
    }

    pub fn with_listener(mut self, listener: Arc<dyn ChainListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_governance(mut self, governance: Arc<dyn GovernanceValidator>) -> Self {
        self.governance = governance;
        self
    }

    pub fn with_instant_locks(mut self, oracle: Arc<dyn InstantLockOracle>) -> Self {
        self.instant_locks = oracle;
        self
    }

    pub fn with_sporks(mut self, oracle: Arc<dyn SporkOracle>) -> Self {
        self.sporks = oracle;
        self
    }

    /// The instant-lock conflict for a transaction, when lock filtering is
    /// active: an input already locked to a different transaction id.
    pub fn conflicting_instant_lock(&self, tx: &Transaction) -> Option<Hash256> {
        if !self.sporks.is_active(Spork::InstantSendFiltering) {
            return None;
        }
        let txid = tx.txid();
        for input in &tx.vin {
            if let Some(locked_to) = self.instant_locks.locking_tx(&input.prevout) {
                if locked_to != txid {
                    return Some(locked_to);
                }
            }
        }
        None
    }

    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn peers_mut(&mut self) -> &mut PeerLedger {
        &mut self.peers
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn tip(&self) -> Option<Hash256> {
        self.index.tip()
    }

    pub fn tip_height(&self) -> i32 {
        self.index.tip_height()
    }

    pub fn tip_median_time_past(&self) -> i64 {
        match self.index.tip() {
            Some(tip) => self.index.median_time_past(&tip),
            None => 0,
        }
    }

    pub fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ValidationState> {
        self.coins
            .coin(outpoint)
            .map_err(|err| ValidationState::error(err.to_string()))
    }

    /// The block the coin view currently sits on.
    pub fn utxo_best_block(&self) -> Option<Hash256> {
        self.coins.best_block()
    }

    /// Median time past of the active-chain block at `height`.
    pub fn median_time_past_at(&self, height: i32) -> i64 {
        match self.index.chain_hash_at(height) {
            Some(hash) => self.index.median_time_past(&hash),
            None => 0,
        }
    }

    /// Whether a governance-rejected block was recently seen, for the
    /// caller's resubmission rate limiting.
    pub fn recently_rejected(&self, hash: &Hash256) -> Option<u64> {
        self.rejected_blocks.get(hash).copied()
    }

    /// Once synced, stays synced: the latch keeps services from flapping
    /// back into initial-download mode on a stale tip.
    pub fn is_initial_block_download(&mut self) -> bool {
        if !self.ibd_latch {
            return false;
        }
        let Some(tip) = self.index.tip() else {
            return true;
        };
        let tip_time = match self.index.get(&tip) {
            Some(entry) => entry.header.time as i64,
            None => 0,
        };
        if tip_time < now_secs() as i64 - 24 * 60 * 60 {
            return true;
        }
        self.ibd_latch = false;
        false
    }

    // ---- header acceptance ----

    pub fn accept_header(&mut self, header: &BlockHeader) -> Result<Hash256, ValidationState> {
        let hash = header.hash();
        if let Some(entry) = self.index.get(&hash) {
            if entry.is_failed() {
                return Err(ValidationState::dos(0, REJECT_DUPLICATE, "duplicate"));
            }
            // Idempotent re-acceptance leaves the entry untouched.
            return Ok(hash);
        }

        check_proof_of_work(header, &self.params).map_err(|err| {
            ValidationState::dos(50, REJECT_INVALID, "high-hash").with_debug(err.to_string())
        })?;

        let is_genesis =
            header.prev_block == [0u8; 32] && hash == self.params.hash_genesis_block;
        if !is_genesis {
            let Some(parent) = self.index.get(&header.prev_block) else {
                return Err(ValidationState::dos(10, REJECT_INVALID, "prev-blk-not-found"));
            };
            if parent.is_failed() {
                return Err(ValidationState::dos(100, REJECT_INVALID, "bad-prevblk"));
            }
            let parent_hash = parent.hash();

            if (header.time as i64) <= self.index.median_time_past(&parent_hash) {
                return Err(ValidationState::invalid(REJECT_INVALID, "time-too-old", 0));
            }
            if header.time as i64 > now_secs() as i64 + MAX_FUTURE_BLOCK_TIME {
                return Err(ValidationState::invalid(REJECT_INVALID, "time-too-new", 0));
            }

            let expected_bits = self.next_work_required(&parent_hash)?;
            if header.bits != expected_bits {
                return Err(ValidationState::dos(100, REJECT_INVALID, "bad-diffbits"));
            }

            for min_version in [2, 3, 4] {
                if header.version < min_version
                    && is_super_majority(
                        min_version,
                        &self.index,
                        Some(parent_hash),
                        self.params.majority_reject_block_outdated,
                        self.params.majority_window,
                    )
                {
                    return Err(ValidationState::invalid(REJECT_OBSOLETE, "bad-version", 0));
                }
            }
        }

        let proof = block_proof(header.bits).map_err(|err| {
            ValidationState::dos(100, REJECT_INVALID, "bad-diffbits").with_debug(err.to_string())
        })?;
        let previous_best = self.index.best_header();
        self.index.insert(*header, proof);
        self.dirty_entries.insert(hash);
        self.listener.accepted_block_header(&hash);
        if self.index.best_header() != previous_best {
            if let Some(entry) = self.index.get(&hash) {
                self.listener.notify_header_tip(&hash, entry.height);
            }
        }
        Ok(hash)
    }

    /// Difficulty bits required of a block extending `parent_hash`.
    pub fn next_work_required(&self, parent_hash: &Hash256) -> Result<u32, ValidationState> {
        let mut window = VecDeque::new();
        let mut walk = Some(*parent_hash);
        let span = self.params.difficulty_adjustment_interval() as usize + 1;
        for _ in 0..span {
            let Some(hash) = walk else { break };
            let Some(entry) = self.index.get(&hash) else { break };
            window.push_front(HeaderInfo {
                height: entry.height as i64,
                time: entry.header.time as i64,
                bits: entry.header.bits,
            });
            if entry.height == 0 {
                break;
            }
            walk = Some(entry.prev_hash());
        }
        let chain: Vec<HeaderInfo> = window.into_iter().collect();
        get_next_work_required(&chain, &self.params)
            .map_err(|err| ValidationState::error(err.to_string()))
    }

    // ---- block body acceptance ----

    pub fn accept_block(
        &mut self,
        block: &Block,
        source: Option<BlockSource>,
        requested: bool,
    ) -> Result<BlockAccept, ValidationState> {
        let hash = match self.accept_header(&block.header) {
            Ok(hash) => hash,
            Err(state) => {
                if state.reject_reason == "prev-blk-not-found" {
                    return Ok(self.park_orphan(block));
                }
                let hash = block.header.hash();
                if let Some(source) = source {
                    self.peers.record_source(hash, source);
                    self.peers.punish(&hash, &state);
                }
                return Err(state);
            }
        };
        if let Some(source) = source {
            self.peers.record_source(hash, source);
        }

        let entry = self
            .index
            .get(&hash)
            .ok_or_else(|| ValidationState::error("accepted header missing from index"))?
            .clone();
        if entry.has_data() {
            return Ok(BlockAccept::AlreadyHave);
        }

        let parent_ready = entry.height == 0
            || self
                .index
                .get(&block.header.prev_block)
                .map(|parent| {
                    parent.is_valid(BLOCK_VALID_TRANSACTIONS) && parent.chain_tx_count > 0
                })
                .unwrap_or(false);
        if !parent_ready {
            return Ok(self.park_orphan(block));
        }

        // Unrequested blocks must earn their disk space.
        if !requested {
            let tip_work = self
                .index
                .tip()
                .and_then(|tip| self.index.get(&tip))
                .map(|tip| tip.chainwork)
                .unwrap_or_default();
            let extends_tip = self.index.tip() == Some(block.header.prev_block)
                || self.index.tip().is_none();
            if !extends_tip && entry.chainwork <= tip_work {
                return Ok(BlockAccept::Ignored);
            }
            if entry.height > self.index.tip_height() + MIN_BLOCKS_TO_KEEP {
                return Ok(BlockAccept::Ignored);
            }
        }

        let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
        let size_context = self.block_size_context(&block.header.prev_block);
        if let Err(state) = self.check_block_in_context(block, &entry, &size_context, &txids) {
            if state.is_invalid() && !state.corruption_possible {
                self.mark_failed(&hash);
            }
            self.peers.punish(&hash, &state);
            self.listener.block_checked(&hash, Some(&state));
            return Err(state);
        }

        let serialized = block.consensus_encode();
        let location = self
            .blocks
            .append(&serialized)
            .map_err(|err| ValidationState::error(err.to_string()))?;
        self.block_file_info
            .entry(location.file_id)
            .or_default()
            .record_block(entry.height, block.header.time, serialized.len() as u64);
        self.dirty_files.insert(location.file_id);

        let parent_chain_tx = if entry.height == 0 {
            0
        } else {
            self.index
                .get(&block.header.prev_block)
                .map(|parent| parent.chain_tx_count)
                .unwrap_or(0)
        };
        let has_witness = block.transactions.iter().any(Transaction::has_witness);

        self.index.remove_candidate(&hash);
        if let Some(entry) = self.index.get_mut(&hash) {
            entry.block_location = Some(location);
            entry.tx_count = block.transactions.len() as u32;
            entry.chain_tx_count = parent_chain_tx + block.transactions.len() as u64;
            entry.status |= BLOCK_HAVE_DATA;
            if has_witness {
                entry.status |= BLOCK_OPT_WITNESS;
            }
            entry.raise_validity(BLOCK_VALID_TRANSACTIONS);
        }
        self.dirty_entries.insert(hash);
        self.index.add_candidate(hash);

        self.promote_orphans(hash);
        Ok(BlockAccept::Accepted)
    }

    fn park_orphan(&mut self, block: &Block) -> BlockAccept {
        if self.orphan_count >= MAX_ORPHAN_BLOCKS {
            return BlockAccept::Ignored;
        }
        self.orphan_count += 1;
        self.orphan_blocks
            .entry(block.header.prev_block)
            .or_default()
            .push(block.clone());
        BlockAccept::Orphaned
    }

    /// Re-accepts any parked children of a block whose body just arrived,
    /// recursively.
    fn promote_orphans(&mut self, parent: Hash256) {
        let mut queue = vec![parent];
        while let Some(parent) = queue.pop() {
            let Some(children) = self.orphan_blocks.remove(&parent) else {
                continue;
            };
            self.orphan_count = self.orphan_count.saturating_sub(children.len());
            for child in children {
                let child_hash = child.header.hash();
                match self.accept_block(&child, None, true) {
                    Ok(BlockAccept::Accepted) => queue.push(child_hash),
                    Ok(_) => {}
                    Err(state) => {
                        smartd_log::log_debug!(
                            "orphan block {} rejected on promotion: {state}",
                            hash256_to_hex(&child_hash)
                        );
                    }
                }
            }
        }
    }

    /// Contextual counterpart of the stateless block check: locktime
    /// finality and the coinbase height commitment.
    fn check_block_in_context(
        &mut self,
        block: &Block,
        entry: &BlockIndexEntry,
        size_context: &BlockSizeContext,
        txids: &[Hash256],
    ) -> Result<(), ValidationState> {
        check_block(block, size_context, txids)?;

        let parent_hash = block.header.prev_block;
        let locktime_flags = self.locktime_flags(&parent_hash);
        let cutoff = if locktime_flags & LOCKTIME_MEDIAN_TIME_PAST != 0 && entry.height > 0 {
            self.index.median_time_past(&parent_hash)
        } else {
            block.header.time as i64
        };
        for tx in &block.transactions {
            if !is_final_tx(tx, entry.height, cutoff) {
                return Err(ValidationState::dos(10, REJECT_INVALID, "bad-txns-nonfinal"));
            }
        }

        if entry.height >= self.params.bip34_height
            && !coinbase_height_matches(&block.transactions[0], entry.height)
        {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-height"));
        }

        // A block spending an output the lock oracle pinned to a different
        // transaction loses to the lock.
        for tx in &block.transactions[1..] {
            if let Some(locked_to) = self.conflicting_instant_lock(tx) {
                return Err(ValidationState::invalid(REJECT_INVALID, "conflict-tx-lock", 0)
                    .with_debug(format!("locked to {}", hash256_to_hex(&locked_to))));
            }
        }

        Ok(())
    }

    /// Effective block-size limit for a block extending `parent_hash`.
    ///
    /// Adaptive sizing keys off the raw version field once a supermajority
    /// of the window signals at least `ADAPTIVE_BLOCK_SIZE_VERSION`.
    fn block_size_context(&self, parent_hash: &Hash256) -> BlockSizeContext {
        let adaptive = is_super_majority(
            ADAPTIVE_BLOCK_SIZE_VERSION,
            &self.index,
            Some(*parent_hash),
            self.params.majority_enforce_block_upgrade,
            self.params.majority_window,
        );
        if !adaptive {
            return BlockSizeContext::legacy();
        }
        let mut sizes: Vec<u32> = Vec::with_capacity(NUM_BLOCKS_FOR_MEDIAN_BLOCK);
        let mut walk = Some(*parent_hash);
        for _ in 0..NUM_BLOCKS_FOR_MEDIAN_BLOCK {
            let Some(hash) = walk else { break };
            let Some(entry) = self.index.get(&hash) else { break };
            if let Some(location) = entry.block_location {
                sizes.push(location.len);
            }
            if entry.height == 0 {
                break;
            }
            walk = Some(entry.prev_hash());
        }
        if sizes.is_empty() {
            return BlockSizeContext::legacy();
        }
        sizes.sort_unstable();
        BlockSizeContext::adaptive(sizes[sizes.len() / 2])
    }

    // ---- soft-fork flag selection ----

    /// Script flags for a block extending `parent_hash`.
    pub fn block_script_flags(&mut self, parent_hash: &Hash256) -> ScriptFlags {
        let mut flags = SCRIPT_VERIFY_P2SH;
        for (version, flag) in SUPERMAJORITY_VERSION_LADDER {
            if is_super_majority(
                version,
                &self.index,
                Some(*parent_hash),
                self.params.majority_enforce_block_upgrade,
                self.params.majority_window,
            ) {
                flags |= flag;
            }
        }
        let prev = self.index.get(parent_hash).map(|_| *parent_hash);
        if deployment_active(
            &self.index,
            &self.params,
            prev,
            DeploymentPos::Csv,
            &mut self.versionbits,
        ) {
            flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }
        if deployment_active(
            &self.index,
            &self.params,
            prev,
            DeploymentPos::Segwit,
            &mut self.versionbits,
        ) {
            flags |= SCRIPT_VERIFY_WITNESS;
        }
        flags
    }

    /// Locktime interpretation flags for a block extending `parent_hash`.
    pub fn locktime_flags(&mut self, parent_hash: &Hash256) -> u32 {
        let prev = self.index.get(parent_hash).map(|_| *parent_hash);
        if deployment_active(
            &self.index,
            &self.params,
            prev,
            DeploymentPos::Csv,
            &mut self.versionbits,
        ) {
            LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST
        } else {
            0
        }
    }

    pub fn next_block_script_flags(&mut self) -> ScriptFlags {
        match self.index.tip() {
            Some(tip) => self.block_script_flags(&tip),
            None => SCRIPT_VERIFY_P2SH,
        }
    }

    pub fn next_block_locktime_flags(&mut self) -> u32 {
        match self.index.tip() {
            Some(tip) => self.locktime_flags(&tip),
            None => 0,
        }
    }

    fn under_assume_valid(&self, hash: &Hash256) -> bool {
        let Some(assume_valid) = self.config.assume_valid else {
            return false;
        };
        let Some(trusted) = self.index.get(&assume_valid) else {
            return false;
        };
        let Some(entry) = self.index.get(hash) else {
            return false;
        };
        if entry.height > trusted.height {
            return false;
        }
        self.index.ancestor_of(&assume_valid, entry.height) == Some(*hash)
    }

    fn script_cache_insert(&mut self, txid: Hash256, flags: ScriptFlags) {
        if self.script_cache.insert((txid, flags)) {
            self.script_cache_order.push_back((txid, flags));
            while self.script_cache.len() > SCRIPT_CACHE_CAPACITY {
                if let Some(evicted) = self.script_cache_order.pop_front() {
                    self.script_cache.remove(&evicted);
                } else {
                    break;
                }
            }
        }
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Block, ValidationState> {
        let entry = self
            .index
            .get(hash)
            .ok_or_else(|| ValidationState::error("unknown block"))?;
        let location = entry
            .block_location
            .ok_or_else(|| ValidationState::error("block has no data on disk"))?;
        let bytes = self
            .blocks
            .read(location)
            .map_err(|err| ValidationState::error(err.to_string()))?;
        Block::consensus_decode(&bytes)
            .map_err(|err| ValidationState::error(err.to_string()).corruption())
    }

    // ---- block connection ----

    fn connect_tip(&mut self, hash: Hash256) -> Result<Vec<Transaction>, ValidationState> {
        let entry = self
            .index
            .get(&hash)
            .ok_or_else(|| ValidationState::error("connect of unindexed block"))?
            .clone();
        let height = entry.height;
        let block = self.read_block(&hash)?;
        let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();

        // Defense against bad cached state: everything stateless again.
        let size_context = self.block_size_context(&block.header.prev_block);
        check_block(&block, &size_context, &txids)?;

        let parent_hash = block.header.prev_block;
        let is_genesis = height == 0;
        let expected_best = if is_genesis { None } else { Some(parent_hash) };
        if self.coins.best_block() != expected_best {
            return Err(ValidationState::error(
                "coin view does not sit on the block's parent",
            ));
        }

        if is_genesis {
            self.coins.set_best_block(hash);
            self.raise_to_scripts(&hash, None);
            self.index.push_tip(hash);
            self.write_connect_indexes(&block, &txids, height, entry.block_location, &BlockUndo::default())?;
            self.listener.block_checked(&hash, None);
            return Ok(Vec::new());
        }

        let script_flags = self.block_script_flags(&parent_hash);
        let locktime_flags = self.locktime_flags(&parent_hash);
        let skip_scripts = self.under_assume_valid(&hash);
        let prior_mtp = self.index.median_time_past(&parent_hash);

        // BIP30: no transaction may overwrite an unspent predecessor,
        // outside the grandfathered pairs. The height commitment makes
        // duplicates impossible, so the check begins at its activation.
        let grandfathered = self
            .params
            .bip30_exceptions
            .iter()
            .any(|exception| exception.height == height && exception.hash == hash);
        if height >= self.params.bip34_height && !grandfathered {
            for (tx, txid) in block.transactions.iter().zip(&txids) {
                for output_index in 0..tx.vout.len() as u32 {
                    let outpoint = OutPoint::new(*txid, output_index);
                    let existing = self
                        .coins
                        .fetch_coin(&outpoint)
                        .map_err(|err| ValidationState::error(err.to_string()))?;
                    if existing.is_some() {
                        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-BIP30"));
                    }
                }
            }
        }

        struct ScriptJob {
            tx_index: usize,
            input_index: usize,
            script_pubkey: Vec<u8>,
            amount: i64,
        }

        let mut undo = BlockUndo::default();
        let mut script_jobs: Vec<ScriptJob> = Vec::new();
        let mut total_fees = 0i64;
        let mut sigops = 0u32;
        let mut view = BlockCoins::new();

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let is_coinbase = tx_index == 0;
            sigops = sigops.saturating_add(transaction_legacy_sigops(tx));
            if sigops > size_context.max_sigops() {
                return Err(ValidationState::dos(100, REJECT_INVALID, "bad-blk-sigops"));
            }

            if !is_coinbase {
                let mut spent_coins = Vec::with_capacity(tx.vin.len());
                let mut prev_heights = Vec::with_capacity(tx.vin.len());
                for input in &tx.vin {
                    let coin = view
                        .coin(&self.coins, &input.prevout)
                        .map_err(|err| ValidationState::error(err.to_string()))?
                        .ok_or_else(|| {
                            ValidationState::dos(
                                100,
                                REJECT_INVALID,
                                "bad-txns-inputs-missingorspent",
                            )
                            .with_debug(format!(
                                "input {}:{} missing at height {height}",
                                hash256_to_hex(&input.prevout.hash),
                                input.prevout.index
                            ))
                        })?;
                    // P2SH sigops count against the block limit too.
                    if script_flags & SCRIPT_VERIFY_P2SH != 0 {
                        sigops = sigops
                            .saturating_add(p2sh_sigops(&coin.script_pubkey, &input.script_sig));
                        if sigops > size_context.max_sigops() {
                            return Err(ValidationState::dos(
                                100,
                                REJECT_INVALID,
                                "bad-blk-sigops",
                            ));
                        }
                    }
                    prev_heights.push(if coin.height == MEMPOOL_COIN_HEIGHT {
                        height
                    } else {
                        coin.height as i32
                    });
                    spent_coins.push(coin);
                }

                let fee = check_tx_inputs(tx, &spent_coins, height)?;
                total_fees = total_fees.saturating_add(fee);

                let lock = calculate_sequence_locks(tx, locktime_flags, &prev_heights, |h| {
                    match self.index.chain_hash_at(h) {
                        Some(hash) => self.index.median_time_past(&hash),
                        None => 0,
                    }
                });
                if !evaluate_sequence_locks(height, prior_mtp, &lock) {
                    return Err(ValidationState::dos(10, REJECT_INVALID, "bad-txns-nonfinal"));
                }

                let txid = &txids[tx_index];
                if !skip_scripts && !self.script_cache.contains(&(*txid, script_flags)) {
                    for input_index in 0..tx.vin.len() {
                        script_jobs.push(ScriptJob {
                            tx_index,
                            input_index,
                            script_pubkey: spent_coins[input_index].script_pubkey.clone(),
                            amount: spent_coins[input_index].value,
                        });
                    }
                }

                let mut tx_undo = TxUndo::default();
                for input in &tx.vin {
                    let coin = view
                        .spend_coin(&self.coins, &input.prevout)
                        .map_err(|err| ValidationState::error(err.to_string()))?
                        .ok_or_else(|| {
                            ValidationState::dos(
                                100,
                                REJECT_INVALID,
                                "bad-txns-inputs-missingorspent",
                            )
                        })?;
                    tx_undo.spent.push(SpentCoin {
                        outpoint: input.prevout.clone(),
                        coin,
                    });
                }
                undo.tx_undos.push(tx_undo);
            }

            let txid = txids[tx_index];
            for (output_index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                view.add_coin(
                    &self.coins,
                    &OutPoint::new(txid, output_index as u32),
                    Coin {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height: height as u32,
                        is_coinbase,
                    },
                    true,
                )
                .map_err(|err| ValidationState::error(err.to_string()))?;
            }
        }

        // Reward bound: the coinbase may claim the subsidy plus the fees
        // the block's transactions actually paid.
        let coinbase_out: i64 = block.transactions[0]
            .vout
            .iter()
            .map(|output| output.value)
            .sum();
        let reward_limit = block_subsidy(height).saturating_add(total_fees);
        if coinbase_out > reward_limit {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-amount")
                .with_debug(format!("claimed {coinbase_out}, limit {reward_limit}")));
        }

        if !self
            .governance
            .validate_block(&block.transactions[0], height, reward_limit)
        {
            self.rejected_blocks.insert(hash, now_secs());
            return Err(ValidationState::invalid(REJECT_INVALID, "bad-cb-payee", 0));
        }

        // Parallel script verification; the join surfaces the first
        // failure and discards the rest of the batch.
        if !script_jobs.is_empty() {
            let run = |job: &ScriptJob| -> Result<(), ValidationState> {
                let tx = &block.transactions[job.tx_index];
                verify_script(
                    &tx.vin[job.input_index].script_sig,
                    &job.script_pubkey,
                    tx,
                    job.input_index,
                    job.amount,
                    script_flags,
                )
                .map_err(|err| {
                    ValidationState::dos(
                        100,
                        REJECT_INVALID,
                        "mandatory-script-verify-flag-failed",
                    )
                    .with_debug(format!(
                        "tx {} input {}: {err}",
                        hash256_to_hex(&txids[job.tx_index]),
                        job.input_index
                    ))
                })
            };
            let result = if self.config.script_check_workers > 0 {
                script_jobs.par_iter().try_for_each(run)
            } else {
                script_jobs.iter().try_for_each(run)
            };
            result?;
        }

        // Everything validated. The undo record is durable before the
        // SCRIPTS bit advances, so recovery can always roll back.
        let undo_bytes = undo.encode();
        let undo_location = self
            .undo
            .append_undo(&parent_hash, &undo_bytes)
            .map_err(|err| ValidationState::error(err.to_string()))?;
        self.undo_file_info
            .entry(undo_location.file_id)
            .or_default()
            .record_block(height, block.header.time, undo_bytes.len() as u64);
        self.dirty_undo_files.insert(undo_location.file_id);

        view.commit(&mut self.coins);
        self.coins.set_best_block(hash);

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            if tx_index > 0 {
                self.script_cache_insert(txids[tx_index], script_flags);
            }
            self.listener.sync_transaction(tx, Some(&hash));
        }

        self.raise_to_scripts(&hash, Some(undo_location));
        self.index.push_tip(hash);

        self.write_connect_indexes(&block, &txids, height, entry.block_location, &undo)?;
        self.listener.block_checked(&hash, None);
        Ok(block.transactions)
    }

    fn raise_to_scripts(&mut self, hash: &Hash256, undo_location: Option<FileLocation>) {
        self.index.remove_candidate(hash);
        if let Some(entry) = self.index.get_mut(hash) {
            if let Some(location) = undo_location {
                entry.undo_location = Some(location);
                entry.status |= BLOCK_HAVE_UNDO;
            }
            entry.raise_validity(BLOCK_VALID_SCRIPTS);
        }
        self.index.add_candidate(*hash);
        self.dirty_entries.insert(*hash);
    }

    /// Secondary-index writes for a connected block, plus its index entry,
    /// committed in one batch.
    fn write_connect_indexes(
        &mut self,
        block: &Block,
        txids: &[Hash256],
        height: i32,
        block_location: Option<FileLocation>,
        undo: &BlockUndo,
    ) -> Result<(), ValidationState> {
        let mut batch = WriteBatch::new();
        let hash = block.header.hash();

        if self.config.timestamp_index {
            put_timestamp_index(&mut batch, block.header.time, &hash);
        }

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = txids[tx_index];
            if self.config.tx_index {
                if let Some(location) = block_location {
                    put_tx_location(
                        &mut batch,
                        &txid,
                        &TxLocation {
                            block: location,
                            tx_offset: tx_index as u32,
                        },
                    );
                }
            }

            if tx_index > 0 && (self.config.address_index || self.config.spent_index) {
                let tx_undo = undo
                    .tx_undos
                    .get(tx_index - 1)
                    .ok_or_else(|| ValidationState::error("undo record short for indexing"))?;
                for (input_index, spent) in tx_undo.spent.iter().enumerate() {
                    let address = address_key_of(&spent.coin.script_pubkey);
                    if self.config.spent_index {
                        let (address_type, address_hash) = address.unwrap_or((0, [0u8; 20]));
                        put_spent_index(
                            &mut batch,
                            &spent.outpoint,
                            &SpentIndexValue {
                                spending_txid: txid,
                                input_index: input_index as u32,
                                height: height as u32,
                                amount: spent.coin.value,
                                address_type,
                                address_hash,
                            },
                        );
                    }
                    if self.config.address_index {
                        if let Some((address_type, address_hash)) = address {
                            put_address_delta(
                                &mut batch,
                                address_delta_key(
                                    address_type,
                                    &address_hash,
                                    height as u32,
                                    tx_index as u32,
                                    &txid,
                                    input_index as u32,
                                    true,
                                ),
                                -spent.coin.value,
                            );
                            tombstone_address_unspent(
                                &mut batch,
                                address_unspent_key(
                                    address_type,
                                    &address_hash,
                                    &spent.outpoint,
                                ),
                            );
                        }
                    }
                }
            }

            if self.config.address_index {
                for (output_index, output) in tx.vout.iter().enumerate() {
                    if let Some((address_type, address_hash)) =
                        address_key_of(&output.script_pubkey)
                    {
                        let outpoint = OutPoint::new(txid, output_index as u32);
                        put_address_delta(
                            &mut batch,
                            address_delta_key(
                                address_type,
                                &address_hash,
                                height as u32,
                                tx_index as u32,
                                &txid,
                                output_index as u32,
                                false,
                            ),
                            output.value,
                        );
                        put_address_unspent(
                            &mut batch,
                            address_unspent_key(address_type, &address_hash, &outpoint),
                            &AddressUnspentValue {
                                amount: output.value,
                                script_pubkey: output.script_pubkey.clone(),
                                height: height as u32,
                            },
                        );
                    }
                }
            }
        }

        // The index entry rides in the same batch so a crash cannot leave
        // the secondary indexes ahead of the tree.
        if let Some(entry) = self.index.get(&hash) {
            batch.put(Column::BlockIndex, hash, entry.encode());
            self.dirty_entries.remove(&hash);
        }

        self.store
            .write_batch(&batch)
            .map_err(|err| ValidationState::error(err.to_string()))
    }

    // ---- block disconnection ----

    fn disconnect_tip(
        &mut self,
    ) -> Result<(Vec<Transaction>, DisconnectResult), ValidationState> {
        let hash = self
            .index
            .tip()
            .ok_or_else(|| ValidationState::error("disconnect with empty chain"))?;
        let entry = self
            .index
            .get(&hash)
            .ok_or_else(|| ValidationState::error("tip not indexed"))?
            .clone();
        if self.coins.best_block() != Some(hash) {
            return Err(ValidationState::error(
                "coin view does not sit on the tip being disconnected",
            ));
        }
        let parent_hash = entry.prev_hash();
        let block = self.read_block(&hash)?;
        let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();

        let undo_location = entry
            .undo_location
            .ok_or_else(|| ValidationState::error("missing undo data; resync required"))?;
        let undo_bytes = self
            .undo
            .read_undo(undo_location, &parent_hash)
            .map_err(|err| ValidationState::error(err.to_string()).corruption())?;
        let mut undo = BlockUndo::decode(&undo_bytes)
            .map_err(|err| ValidationState::error(err.to_string()).corruption())?;
        if undo.tx_undos.len() != block.transactions.len().saturating_sub(1) {
            return Err(ValidationState::error(
                "undo record count does not match block transactions",
            )
            .corruption());
        }

        let mut clean = true;
        let mut batch = WriteBatch::new();
        let mut view = BlockCoins::new();
        let height = entry.height;

        for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
            let txid = txids[tx_index];

            // Remove this transaction's outputs.
            for (output_index, output) in tx.vout.iter().enumerate() {
                let outpoint = OutPoint::new(txid, output_index as u32);
                let removed = view
                    .spend_coin(&self.coins, &outpoint)
                    .map_err(|err| ValidationState::error(err.to_string()))?;
                if removed.is_none() && !is_unspendable(&output.script_pubkey) {
                    smartd_log::log_warn!(
                        "disconnect of {} missing output {}:{output_index}",
                        hash256_to_hex(&hash),
                        hash256_to_hex(&txid)
                    );
                    clean = false;
                }
                if self.config.address_index {
                    if let Some((address_type, address_hash)) =
                        address_key_of(&output.script_pubkey)
                    {
                        delete_address_delta(
                            &mut batch,
                            address_delta_key(
                                address_type,
                                &address_hash,
                                height as u32,
                                tx_index as u32,
                                &txid,
                                output_index as u32,
                                false,
                            ),
                        );
                        // The unspent row is blanked rather than deleted;
                        // readers treat the empty value as a tombstone.
                        tombstone_address_unspent(
                            &mut batch,
                            address_unspent_key(address_type, &address_hash, &outpoint),
                        );
                    }
                }
            }
            if self.config.tx_index {
                delete_tx_location(&mut batch, &txid);
            }

            // Restore what it spent.
            if tx_index > 0 {
                let Some(tx_undo) = undo.tx_undos.pop() else {
                    return Err(
                        ValidationState::error("undo record exhausted early").corruption()
                    );
                };
                if tx_undo.spent.len() != tx.vin.len() {
                    return Err(
                        ValidationState::error("undo record input count mismatch").corruption()
                    );
                }
                for (input_index, spent) in tx_undo.spent.into_iter().enumerate().rev() {
                    let input = &tx.vin[input_index];
                    if spent.outpoint != input.prevout {
                        return Err(ValidationState::error(
                            "undo record outpoint does not match input",
                        )
                        .corruption());
                    }
                    let overwrote = view
                        .have_coin(&self.coins, &spent.outpoint)
                        .map_err(|err| ValidationState::error(err.to_string()))?;
                    if overwrote {
                        smartd_log::log_warn!(
                            "disconnect of {} overwrote unspent {}:{}",
                            hash256_to_hex(&hash),
                            hash256_to_hex(&spent.outpoint.hash),
                            spent.outpoint.index
                        );
                        clean = false;
                    }
                    if self.config.spent_index {
                        delete_spent_index(&mut batch, &spent.outpoint);
                    }
                    if self.config.address_index {
                        if let Some((address_type, address_hash)) =
                            address_key_of(&spent.coin.script_pubkey)
                        {
                            delete_address_delta(
                                &mut batch,
                                address_delta_key(
                                    address_type,
                                    &address_hash,
                                    height as u32,
                                    tx_index as u32,
                                    &txid,
                                    input_index as u32,
                                    true,
                                ),
                            );
                            put_address_unspent(
                                &mut batch,
                                address_unspent_key(
                                    address_type,
                                    &address_hash,
                                    &spent.outpoint,
                                ),
                                &AddressUnspentValue {
                                    amount: spent.coin.value,
                                    script_pubkey: spent.coin.script_pubkey.clone(),
                                    height: spent.coin.height,
                                },
                            );
                        }
                    }
                    view.add_coin(&self.coins, &spent.outpoint, spent.coin, true)
                        .map_err(|err| ValidationState::error(err.to_string()))?;
                }
            }
        }

        if self.config.timestamp_index {
            delete_timestamp_index(&mut batch, block.header.time, &hash);
        }

        view.commit(&mut self.coins);
        self.coins.set_best_block(parent_hash);
        self.index.pop_tip();

        self.store
            .write_batch(&batch)
            .map_err(|err| ValidationState::error(err.to_string()))?;

        let mut resurrect = Vec::with_capacity(block.transactions.len().saturating_sub(1));
        for tx in block.transactions.into_iter() {
            self.listener.sync_transaction(&tx, None);
            if !tx.is_coinbase() {
                resurrect.push(tx);
            }
        }

        let result = if clean {
            DisconnectResult::Ok
        } else {
            DisconnectResult::Unclean
        };
        Ok((resurrect, result))
    }

    // ---- chain activation ----

    /// Reorganizes toward the best candidate, connecting in bounded
    /// batches and honoring the shutdown signal between them. When the
    /// just-received `hint` block itself proves invalid, its validation
    /// state is the result; other invalid candidates are skipped over.
    pub fn activate_best_chain(
        &mut self,
        mempool: &mut dyn MempoolBridge,
        hint: Option<&Hash256>,
    ) -> Result<(), ValidationState> {
        let starting_tip = self.index.tip();
        let mut hint_failure: Option<ValidationState> = None;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Some(target) = self.find_most_work_chain() else {
                break;
            };
            if Some(target) == self.index.tip() {
                break;
            }

            let fork = match self.index.tip() {
                Some(tip) => self
                    .index
                    .last_common_ancestor(&tip, &target)
                    .ok_or_else(|| ValidationState::error("no common ancestor with target"))?,
                None => target,
            };

            // Phase 1: unwind to the fork point.
            while let Some(tip) = self.index.tip() {
                if tip == fork {
                    break;
                }
                let (resurrected, result) = self.disconnect_tip()?;
                if result == DisconnectResult::Unclean {
                    smartd_log::log_warn!(
                        "unclean disconnect of {}; continuing reorganization",
                        hash256_to_hex(&tip)
                    );
                }
                mempool.resurrect(resurrected);
            }

            // Phase 2: connect toward the target in bounded batches.
            let mut invalid_found = false;
            'connecting: loop {
                if self.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let tip_height = self.index.tip_height();
                let target_height = match self.index.get(&target) {
                    Some(entry) => entry.height,
                    None => break,
                };
                if target_height <= tip_height {
                    break;
                }
                let batch_end = (tip_height + ACTIVATION_BATCH).min(target_height);
                let mut batch_hashes = Vec::with_capacity(ACTIVATION_BATCH as usize);
                for height in (tip_height + 1)..=batch_end {
                    match self.index.ancestor_of(&target, height) {
                        Some(hash) => batch_hashes.push(hash),
                        None => return Err(ValidationState::error("target ancestry broken")),
                    }
                }
                for hash in batch_hashes {
                    match self.connect_tip(hash) {
                        Ok(connected) => {
                            mempool.removed_for_block(&connected);
                            if let Some(tip) = self.index.tip() {
                                if let Some(entry) = self.index.get(&tip) {
                                    let work = entry.chainwork;
                                    self.index.prune_candidates(work, &tip);
                                }
                            }
                        }
                        Err(state) if state.is_invalid() && !state.corruption_possible => {
                            self.mark_failed(&hash);
                            self.peers.punish(&hash, &state);
                            self.listener.block_checked(&hash, Some(&state));
                            smartd_log::log_warn!(
                                "invalid block {} during activation: {state}",
                                hash256_to_hex(&hash)
                            );
                            if hint == Some(&hash) {
                                hint_failure = Some(state);
                            }
                            invalid_found = true;
                            break 'connecting;
                        }
                        Err(state) => return Err(state),
                    }
                }
                self.flush(FlushMode::IfNeeded)?;
            }

            if let Some(tip) = self.index.tip() {
                if let Some(entry) = self.index.get(&tip) {
                    let height = entry.height;
                    let ibd = self.is_initial_block_download();
                    self.listener.updated_block_tip(&tip, height, ibd);
                }
            }

            if !invalid_found {
                break;
            }
            // Invalid block found: go around with the next-best candidate.
        }

        if self.index.tip() != starting_tip {
            // Any tip movement re-filters the pool and clears the
            // recent-rejects filter.
            let height = self.index.tip_height();
            let mtp = self.tip_median_time_past();
            mempool.tip_changed(height, mtp);
            self.listener.set_best_chain(&self.index.locator());
            self.flush(FlushMode::Periodic)?;
        }
        match hint_failure {
            Some(state) => Err(state),
            None => Ok(()),
        }
    }

    /// The best candidate whose path from the active chain is fully
    /// connectable: data present and no failed ancestor.
    fn find_most_work_chain(&mut self) -> Option<Hash256> {
        loop {
            let candidate = self.index.best_candidate()?;
            let tip_work = self
                .index
                .tip()
                .and_then(|tip| self.index.get(&tip))
                .map(|entry| entry.chainwork);
            let cand_entry = self.index.get(&candidate)?;
            if let Some(tip_work) = tip_work {
                if cand_entry.chainwork < tip_work {
                    return None;
                }
            }

            // Walk back toward the active chain checking the whole path.
            let mut walk = candidate;
            let mut missing_data = false;
            let mut failed_at: Option<Hash256> = None;
            loop {
                let entry = self.index.get(&walk)?;
                if self.index.in_active_chain(&walk) {
                    break;
                }
                if entry.is_failed() {
                    failed_at = Some(walk);
                    break;
                }
                if !entry.has_data() {
                    missing_data = true;
                    break;
                }
                if entry.height == 0 {
                    break;
                }
                walk = entry.prev_hash();
            }

            if let Some(failed) = failed_at {
                self.mark_failed_descendants(&failed);
                self.index.remove_candidate(&candidate);
                continue;
            }
            if missing_data {
                self.index.remove_candidate(&candidate);
                continue;
            }
            return Some(candidate);
        }
    }

    /// Marks a block invalid and propagates the failure to every indexed
    /// descendant.
    fn mark_failed(&mut self, hash: &Hash256) {
        self.index.remove_candidate(hash);
        if let Some(entry) = self.index.get_mut(hash) {
            entry.status |= BLOCK_FAILED_VALID;
        }
        self.dirty_entries.insert(*hash);
        self.mark_failed_descendants(hash);
    }

    fn mark_failed_descendants(&mut self, ancestor: &Hash256) {
        let Some(ancestor_entry) = self.index.get(ancestor) else {
            return;
        };
        let ancestor_height = ancestor_entry.height;
        let descendants: Vec<Hash256> = self
            .index
            .entries()
            .filter(|(entry_hash, entry)| {
                *entry_hash != ancestor
                    && entry.height > ancestor_height
                    && (entry.status & BLOCK_FAILED_CHILD) == 0
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in descendants {
            if self.index.ancestor_of(&hash, ancestor_height) != Some(*ancestor) {
                continue;
            }
            self.index.remove_candidate(&hash);
            if let Some(entry) = self.index.get_mut(&hash) {
                entry.status |= BLOCK_FAILED_CHILD;
            }
            self.dirty_entries.insert(hash);
        }
    }

    /// Operator override: treat `hash` as invalid and reorganize away
    /// from it.
    pub fn invalidate_block(
        &mut self,
        hash: &Hash256,
        mempool: &mut dyn MempoolBridge,
    ) -> Result<(), ValidationState> {
        while self.index.in_active_chain(hash) {
            let (resurrected, _) = self.disconnect_tip()?;
            mempool.resurrect(resurrected);
        }
        self.mark_failed(hash);
        // Everything that still validates competes for the tip again.
        let revived: Vec<Hash256> = self
            .index
            .entries()
            .filter(|(_, entry)| {
                entry.is_valid(BLOCK_VALID_TRANSACTIONS) && entry.chain_tx_count > 0
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in revived {
            self.index.add_candidate(hash);
        }
        self.activate_best_chain(mempool, None)
    }

    /// Clears failure flags from `hash` and its descendants so they can
    /// compete for the tip again.
    pub fn reconsider_block(
        &mut self,
        hash: &Hash256,
        mempool: &mut dyn MempoolBridge,
    ) -> Result<(), ValidationState> {
        let Some(target) = self.index.get(hash) else {
            return Err(ValidationState::error("unknown block"));
        };
        let target_height = target.height;
        let candidates: Vec<Hash256> = self
            .index
            .entries()
            .filter(|(entry_hash, entry)| {
                *entry_hash == hash || entry.height > target_height
            })
            .map(|(hash, _)| *hash)
            .collect();
        for clear_hash in candidates {
            if clear_hash != *hash
                && self.index.ancestor_of(&clear_hash, target_height) != Some(*hash)
            {
                continue;
            }
            self.index.remove_candidate(&clear_hash);
            if let Some(entry) = self.index.get_mut(&clear_hash) {
                entry.status &= !(BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD);
            }
            if let Some(entry) = self.index.get(&clear_hash) {
                if entry.is_valid(BLOCK_VALID_TRANSACTIONS) && entry.chain_tx_count > 0 {
                    self.index.add_candidate(clear_hash);
                }
            }
            self.dirty_entries.insert(clear_hash);
        }
        self.activate_best_chain(mempool, None)
    }

    /// Full entry point: accept the block and reorganize if it wins.
    pub fn process_new_block(
        &mut self,
        block: &Block,
        source: Option<BlockSource>,
        requested: bool,
        mempool: &mut dyn MempoolBridge,
    ) -> Result<BlockAccept, ValidationState> {
        let outcome = self.accept_block(block, source, requested)?;
        if outcome == BlockAccept::Accepted {
            let hash = block.header.hash();
            self.activate_best_chain(mempool, Some(&hash))?;
        }
        Ok(outcome)
    }

    // ---- persistence and flushing ----

    pub fn flush(&mut self, mode: FlushMode) -> Result<(), ValidationState> {
        let now = now_secs();
        let full = match mode {
            FlushMode::None => return Ok(()),
            FlushMode::Always => true,
            FlushMode::Periodic => now >= self.last_flush + PERIODIC_FLUSH_INTERVAL,
            FlushMode::IfNeeded => self.coins.memory_usage() > self.config.db_cache_bytes,
        };

        let mut batch = WriteBatch::new();
        for hash in self.dirty_entries.drain() {
            if let Some(entry) = self.index.get(&hash) {
                batch.put(Column::BlockIndex, hash, entry.encode());
            }
        }
        for file_id in self.dirty_files.drain() {
            if let Some(info) = self.block_file_info.get(&file_id) {
                batch.put(Column::FileInfo, block_file_info_key(file_id), info.encode());
            }
        }
        for file_id in self.dirty_undo_files.drain() {
            if let Some(info) = self.undo_file_info.get(&file_id) {
                batch.put(Column::FileInfo, undo_file_info_key(file_id), info.encode());
            }
        }
        batch.put(
            Column::Meta,
            META_LAST_BLOCK_FILE_KEY,
            self.blocks.current_file_id().to_le_bytes(),
        );
        batch.put(
            Column::Meta,
            META_LAST_UNDO_FILE_KEY,
            self.undo.current_file_id().to_le_bytes(),
        );

        if full {
            // The best-block marker rides in the same batch as the coin
            // deltas, keeping the pair atomic at the backend's
            // granularity.
            self.coins.flush_to_batch(&mut batch);
            self.last_flush = now;
        }

        if !batch.is_empty() {
            self.store.write_batch(&batch).map_err(|err| {
                smartd_log::log_error!("flush failed; node must halt: {err}");
                ValidationState::error(err.to_string())
            })?;
        }
        if full {
            self.listener.set_best_chain(&self.index.locator());
        }
        Ok(())
    }

    /// Startup: load the persisted index, rebuild the active chain from
    /// the coin view's best block, and requeue candidates. A coin view
    /// lagging the index heals through normal activation.
    fn load(&mut self) -> Result<(), ValidationState> {
        let rows = self
            .store
            .scan_prefix(Column::BlockIndex, &[])
            .map_err(|err| ValidationState::error(err.to_string()))?;
        for (key, value) in rows {
            if key.len() != 32 {
                return Err(ValidationState::error("corrupt block index key"));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            let entry = BlockIndexEntry::decode(&value)
                .map_err(|err| ValidationState::error(err.to_string()))?;
            self.index.insert_loaded(hash, entry);
        }

        let rows = self
            .store
            .scan_prefix(Column::FileInfo, &[])
            .map_err(|err| ValidationState::error(err.to_string()))?;
        for (key, value) in rows {
            let Some(info) = FileInfo::decode(&value) else {
                continue;
            };
            if key.len() == 6 && key[..2] == *b"b:" {
                let file_id = u32::from_le_bytes(key[2..].try_into().expect("len checked"));
                self.block_file_info.insert(file_id, info);
            } else if key.len() == 6 && key[..2] == *b"u:" {
                let file_id = u32::from_le_bytes(key[2..].try_into().expect("len checked"));
                self.undo_file_info.insert(file_id, info);
            }
        }

        // Rebuild the active chain from the durable best block.
        if let Some(best) = self.coins.best_block() {
            let mut chain = Vec::new();
            let mut walk = best;
            loop {
                let entry = self.index.get(&walk).ok_or_else(|| {
                    ValidationState::error("coin view best block missing from index")
                })?;
                chain.push(walk);
                if entry.height == 0 {
                    break;
                }
                walk = entry.prev_hash();
            }
            chain.reverse();
            for hash in chain {
                self.index.push_tip(hash);
            }
        }

        // Requeue candidates: anything whose body chain is complete.
        let eligible: Vec<Hash256> = self
            .index
            .entries()
            .filter(|(_, entry)| {
                entry.is_valid(BLOCK_VALID_TRANSACTIONS) && entry.chain_tx_count > 0
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in eligible {
            self.index.add_candidate(hash);
        }

        if self.config.check_block_index {
            self.check_block_index_invariants()?;
        }
        Ok(())
    }

    /// Paranoid whole-tree invariant check, gated by `checkblockindex`.
    pub fn check_block_index_invariants(&self) -> Result<(), ValidationState> {
        for (hash, entry) in self.index.entries() {
            if entry.height > 0 {
                let parent = self
                    .index
                    .get(&entry.prev_hash())
                    .ok_or_else(|| ValidationState::error("entry parent missing"))?;
                let proof = block_proof(entry.header.bits)
                    .map_err(|err| ValidationState::error(err.to_string()))?;
                if parent.chainwork + proof != entry.chainwork {
                    return Err(ValidationState::error("chain work mismatch"));
                }
                if parent.height + 1 != entry.height {
                    return Err(ValidationState::error("height mismatch"));
                }
            }
            if self.index.is_candidate(hash) {
                if entry.is_failed() {
                    return Err(ValidationState::error("failed block in candidate set"));
                }
                if entry.validity() < BLOCK_VALID_TRANSACTIONS {
                    return Err(ValidationState::error("candidate below TRANSACTIONS"));
                }
            }
        }
        if let (Some(tip), Some(best)) = (self.index.tip(), self.coins.best_block()) {
            if tip != best {
                return Err(ValidationState::error(
                    "active tip and coin best block diverge",
                ));
            }
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
