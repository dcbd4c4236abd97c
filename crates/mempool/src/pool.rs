//! The fee-ordered transaction pool with parent/child bookkeeping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use smartd_chainstate::locks::{evaluate_sequence_locks, LockPoints};
use smartd_chainstate::state::MempoolBridge;
use smartd_chainstate::validation::{check_transaction, is_final_tx};
use smartd_consensus::Hash256;
use smartd_primitives::hash::hash256_to_hex;
use smartd_primitives::outpoint::OutPoint;
use smartd_primitives::transaction::Transaction;

use crate::bloom::RollingBloomFilter;

/// Half-life of the eviction-floor fee rate decay.
const ROLLING_FEE_HALFLIFE_SECS: u64 = 60 * 60 * 12;
/// Floor increment applied when the pool evicts for size, sat/kB.
const ROLLING_FEE_INCREMENT: i64 = 1_000;
/// Capacity of the recent-rejects filter.
const RECENT_REJECTS_CAPACITY: usize = 120_000;

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    /// Admission time, unix seconds.
    pub time: u64,
    /// Active-chain height at admission.
    pub height: i32,
    pub fee: i64,
    pub fee_delta: i64,
    pub sigops_cost: u32,
    pub priority: f64,
    pub spends_coinbase: bool,
    pub lock_points: LockPoints,
    /// In-pool transactions this entry spends from.
    pub parents: Vec<Hash256>,
}

impl MempoolEntry {
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn modified_fee(&self) -> i64 {
        self.fee.saturating_add(self.fee_delta)
    }

    /// Satoshis per kilobyte, the eviction and replacement currency.
    pub fn fee_rate(&self) -> i64 {
        if self.raw.is_empty() {
            return 0;
        }
        self.modified_fee().saturating_mul(1_000) / self.raw.len() as i64
    }
}

pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    children: HashMap<Hash256, Vec<Hash256>>,
    total_bytes: usize,
    max_bytes: usize,
    expiry_secs: u64,
    recent_rejects: RollingBloomFilter,
    rolling_min_fee_rate: i64,
    rolling_fee_updated: u64,
    /// Exponentially decaying count of free-relay bytes.
    free_count: f64,
    free_last_seen: u64,
}

impl Mempool {
    pub fn new(max_bytes: usize, expiry_hours: u64) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            children: HashMap::new(),
            total_bytes: 0,
            max_bytes,
            expiry_secs: expiry_hours * 60 * 60,
            recent_rejects: RollingBloomFilter::new(RECENT_REJECTS_CAPACITY, 0.000_001),
            rolling_min_fee_rate: 0,
            rolling_fee_updated: now_secs(),
            free_count: 0.0,
            free_last_seen: now_secs(),
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<Hash256> = self.entries.keys().copied().collect();
        out.sort();
        out
    }

    /// Resolves an outpoint against in-pool outputs.
    pub fn output_of(&self, outpoint: &OutPoint) -> Option<&smartd_primitives::transaction::TxOut> {
        let entry = self.entries.get(&outpoint.hash)?;
        entry.tx.vout.get(outpoint.index as usize)
    }

    pub fn was_recently_rejected(&self, txid: &Hash256) -> bool {
        self.recent_rejects.contains(txid)
    }

    pub fn note_rejected(&mut self, txid: &Hash256) {
        self.recent_rejects.insert(txid);
    }

    /// In-pool ancestors of the given parent set, the transaction itself
    /// excluded.
    pub fn ancestors_of(&self, parents: &[Hash256]) -> HashSet<Hash256> {
        let mut out = HashSet::new();
        let mut queue: VecDeque<Hash256> = parents.iter().copied().collect();
        while let Some(txid) = queue.pop_front() {
            let Some(entry) = self.entries.get(&txid) else {
                continue;
            };
            if out.insert(txid) {
                queue.extend(entry.parents.iter().copied());
            }
        }
        out
    }

    /// In-pool descendants, the transaction itself included.
    pub fn descendants_of(&self, txid: &Hash256) -> HashSet<Hash256> {
        let mut out = HashSet::new();
        let mut queue = VecDeque::from([*txid]);
        while let Some(current) = queue.pop_front() {
            if !out.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                queue.extend(children.iter().copied());
            }
        }
        out
    }

    pub fn ancestor_size(&self, ancestors: &HashSet<Hash256>) -> usize {
        ancestors
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .map(MempoolEntry::size)
            .sum()
    }

    pub fn descendant_size(&self, descendants: &HashSet<Hash256>) -> usize {
        descendants
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .map(MempoolEntry::size)
            .sum()
    }

    /// The dynamic admission floor: the configured relay rate or the
    /// decayed eviction floor, whichever is higher.
    pub fn min_fee_rate(&mut self, configured_min_relay: i64) -> i64 {
        let now = now_secs();
        if self.rolling_min_fee_rate > 0 {
            let elapsed = now.saturating_sub(self.rolling_fee_updated);
            let halvings = elapsed / ROLLING_FEE_HALFLIFE_SECS;
            if halvings > 0 {
                self.rolling_min_fee_rate >>= halvings.min(62) as u32;
                self.rolling_fee_updated = now;
                if self.rolling_min_fee_rate < ROLLING_FEE_INCREMENT / 2 {
                    self.rolling_min_fee_rate = 0;
                }
            }
        }
        configured_min_relay.max(self.rolling_min_fee_rate)
    }

    /// Exponentially decaying free-relay budget (window ~10 minutes).
    pub fn allow_free(&mut self, size: usize, limit_kb_per_minute: u64) -> bool {
        let now = now_secs();
        let elapsed = now.saturating_sub(self.free_last_seen) as f64;
        // decay by 1 - e^(-1/600) per second
        self.free_count *= (-(elapsed) / 600.0).exp();
        self.free_last_seen = now;
        let limit = limit_kb_per_minute as f64 * 10.0 * 1_000.0;
        if self.free_count + size as f64 > limit {
            return false;
        }
        self.free_count += size as f64;
        true
    }

    pub fn insert(&mut self, entry: MempoolEntry) {
        let txid = entry.txid;
        for outpoint in entry.tx.vin.iter().map(|input| input.prevout.clone()) {
            self.spent.insert(outpoint, txid);
        }
        for parent in &entry.parents {
            let children = self.children.entry(*parent).or_default();
            if !children.contains(&txid) {
                children.push(txid);
            }
        }
        self.total_bytes += entry.size();
        self.entries.insert(txid, entry);
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size());
        for input in &entry.tx.vin {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        for parent in &entry.parents {
            if let Some(children) = self.children.get_mut(parent) {
                children.retain(|child| child != txid);
                if children.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
        self.children.remove(txid);
        Some(entry)
    }

    /// Removes a transaction and everything that spends from it.
    pub fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        for descendant in self.descendants_of(txid) {
            if let Some(entry) = self.remove(&descendant) {
                removed.push(entry);
            }
        }
        removed
    }

    /// Drops entries older than the configured expiry, with descendants.
    pub fn expire(&mut self) -> usize {
        if self.expiry_secs == 0 {
            return 0;
        }
        let cutoff = now_secs().saturating_sub(self.expiry_secs);
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.time <= cutoff)
            .map(|entry| entry.txid)
            .collect();
        let mut removed = 0;
        for txid in stale {
            removed += self.remove_with_descendants(&txid).len();
        }
        removed
    }

    /// Evicts lowest-fee-rate packages until the pool fits, raising the
    /// rolling admission floor past what was evicted.
    pub fn trim_to_size(&mut self) -> Vec<MempoolEntry> {
        let mut evicted = Vec::new();
        while self.max_bytes > 0 && self.total_bytes > self.max_bytes {
            let Some(worst) = self
                .entries
                .values()
                .min_by_key(|entry| (entry.fee_rate(), entry.time, entry.txid))
                .map(|entry| (entry.txid, entry.fee_rate()))
            else {
                break;
            };
            let (txid, fee_rate) = worst;
            let floor = fee_rate.saturating_add(ROLLING_FEE_INCREMENT);
            if floor > self.rolling_min_fee_rate {
                self.rolling_min_fee_rate = floor;
                self.rolling_fee_updated = now_secs();
            }
            evicted.extend(self.remove_with_descendants(&txid));
        }
        evicted
    }

    /// Lenient reinsertion of disconnected-block transactions: anything
    /// that no longer fits is silently dropped.
    fn resurrect_transactions(&mut self, txs: Vec<Transaction>, height: i32) {
        for tx in txs {
            if tx.is_coinbase() {
                continue;
            }
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                continue;
            }
            if check_transaction(&tx).is_err() {
                continue;
            }
            if tx
                .vin
                .iter()
                .any(|input| self.spent.contains_key(&input.prevout))
            {
                continue;
            }
            let parents: Vec<Hash256> = tx
                .vin
                .iter()
                .map(|input| input.prevout.hash)
                .filter(|parent| self.entries.contains_key(parent))
                .collect();
            let raw = tx.consensus_encode();
            let entry = MempoolEntry {
                txid,
                raw,
                time: now_secs(),
                height,
                fee: 0,
                fee_delta: 0,
                sigops_cost: 0,
                priority: 0.0,
                spends_coinbase: false,
                lock_points: LockPoints::free(),
                parents,
                tx,
            };
            self.insert(entry);
        }
    }

    /// Drops entries (and their descendants) that are no longer valid in
    /// the next block after a tip change.
    fn refilter(&mut self, tip_height: i32, tip_mtp: i64) {
        let next_height = tip_height + 1;
        let doomed: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| {
                !is_final_tx(&entry.tx, next_height, tip_mtp)
                    || !evaluate_sequence_locks(next_height, tip_mtp, &entry.lock_points)
            })
            .map(|entry| entry.txid)
            .collect();
        for txid in doomed {
            for entry in self.remove_with_descendants(&txid) {
                smartd_log::log_debug!(
                    "reorg dropped {} from mempool",
                    hash256_to_hex(&entry.txid)
                );
            }
        }
        self.recent_rejects.reset();
    }
}

impl MempoolBridge for Mempool {
    fn resurrect(&mut self, txs: Vec<Transaction>) {
        self.resurrect_transactions(txs, 0);
    }

    fn removed_for_block(&mut self, txs: &[Transaction]) {
        for tx in txs {
            let txid = tx.txid();
            self.remove(&txid);
            // Children that spent other outputs of an evicted conflict
            // follow it out of the pool.
            for input in &tx.vin {
                if let Some(conflict) = self.spender(&input.prevout) {
                    if conflict != txid {
                        self.remove_with_descendants(&conflict);
                    }
                }
            }
        }
    }

    fn tip_changed(&mut self, height: i32, median_time_past: i64) {
        self.refilter(height, median_time_past);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartd_primitives::transaction::{TxIn, TxOut};

    fn tx_spending(prevs: &[(Hash256, u32)], value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: prevs
                .iter()
                .map(|(hash, index)| {
                    TxIn::new(OutPoint::new(*hash, *index), vec![0x01, 0x02], 0xffff_fffd)
                })
                .collect(),
            vout: vec![TxOut::new(value, vec![0x51])],
            lock_time: 0,
        }
    }

    fn entry_for(tx: Transaction, fee: i64, parents: Vec<Hash256>) -> MempoolEntry {
        let raw = tx.consensus_encode();
        MempoolEntry {
            txid: tx.txid(),
            raw,
            time: now_secs(),
            height: 1,
            fee,
            fee_delta: 0,
            sigops_cost: 1,
            priority: 0.0,
            spends_coinbase: false,
            lock_points: LockPoints::free(),
            parents,
            tx,
        }
    }

    #[test]
    fn child_is_listed_as_descendant_of_parent() {
        let mut pool = Mempool::new(1 << 20, 72);
        let parent_tx = tx_spending(&[([1u8; 32], 0)], 100);
        let parent_txid = parent_tx.txid();
        pool.insert(entry_for(parent_tx, 1_000, Vec::new()));

        let child_tx = tx_spending(&[(parent_txid, 0)], 90);
        let child_txid = child_tx.txid();
        pool.insert(entry_for(child_tx, 500, vec![parent_txid]));

        let descendants = pool.descendants_of(&parent_txid);
        assert!(descendants.contains(&parent_txid));
        assert!(descendants.contains(&child_txid));
        assert_eq!(
            pool.ancestors_of(&[parent_txid]),
            HashSet::from([parent_txid])
        );
    }

    #[test]
    fn removal_takes_descendants_along() {
        let mut pool = Mempool::new(1 << 20, 72);
        let parent_tx = tx_spending(&[([2u8; 32], 0)], 100);
        let parent_txid = parent_tx.txid();
        pool.insert(entry_for(parent_tx, 1_000, Vec::new()));
        let child_tx = tx_spending(&[(parent_txid, 0)], 90);
        pool.insert(entry_for(child_tx, 500, vec![parent_txid]));

        let removed = pool.remove_with_descendants(&parent_txid);
        assert_eq!(removed.len(), 2);
        assert!(pool.is_empty());
        assert_eq!(pool.bytes(), 0);
    }

    #[test]
    fn trim_evicts_cheapest_and_raises_floor() {
        let mut pool = Mempool::new(400, 72);
        let cheap = tx_spending(&[([3u8; 32], 0)], 10);
        let cheap_txid = cheap.txid();
        pool.insert(entry_for(cheap, 100, Vec::new()));
        let rich = tx_spending(&[([4u8; 32], 0)], 10);
        let rich_txid = rich.txid();
        pool.insert(entry_for(rich, 100_000, Vec::new()));

        let evicted = pool.trim_to_size();
        assert!(evicted.iter().any(|entry| entry.txid == cheap_txid));
        assert!(pool.contains(&rich_txid));
        assert!(pool.min_fee_rate(0) > 0);
    }

    #[test]
    fn resurrect_is_lenient_about_conflicts() {
        let mut pool = Mempool::new(1 << 20, 72);
        let tx_a = tx_spending(&[([5u8; 32], 0)], 10);
        pool.insert(entry_for(tx_a.clone(), 100, Vec::new()));
        // Conflicting spend of the same outpoint is silently skipped.
        let mut tx_b = tx_spending(&[([5u8; 32], 0)], 11);
        tx_b.lock_time = 1;
        pool.resurrect(vec![tx_b]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn refilter_drops_unfinal_transactions() {
        let mut pool = Mempool::new(1 << 20, 72);
        let mut tx = tx_spending(&[([6u8; 32], 0)], 10);
        tx.lock_time = 1_000;
        tx.vin[0].sequence = 0;
        pool.insert(entry_for(tx, 100, Vec::new()));
        // Tip at 1_050: final, stays.
        pool.tip_changed(1_050, 0);
        assert_eq!(pool.len(), 1);
        // Reorg back below the locktime: dropped.
        pool.tip_changed(500, 0);
        assert!(pool.is_empty());
    }
}
