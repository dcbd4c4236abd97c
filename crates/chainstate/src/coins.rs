//! Layered UTXO views over the coin database.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;

use smartd_consensus::Hash256;
use smartd_primitives::encoding::{DecodeError, Decoder, Encoder};
use smartd_primitives::outpoint::OutPoint;
use smartd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;
pub const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

/// An unspent output. Spent-ness is modeled as absence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_bool(self.is_coinbase);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_bool()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn outpoint(&self) -> OutPoint {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.0[..32]);
        let index = u32::from_le_bytes(self.0[32..].try_into().expect("key length"));
        OutPoint { hash, index }
    }
}

/// Read access to some version of the UTXO set.
pub trait CoinsView {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.coin(outpoint)?.is_some())
    }
}

/// The durable coin set: one record per unspent output plus
/// the best-block marker written in the same batch as coin mutations.
pub struct CoinsViewDb<S> {
    store: Arc<S>,
}

impl<S> CoinsViewDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CoinsViewDb<S> {
    pub fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? else {
            return Ok(None);
        };
        if bytes.len() != 32 {
            return Err(StoreError::Backend(
                "invalid best block marker".to_string(),
            ));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Some(hash))
    }
}

impl<S: KeyValueStore> CoinsView for CoinsViewDb<S> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let key = OutPointKey::new(outpoint);
        match self.store.get(Column::Coin, key.as_bytes())? {
            Some(bytes) => Ok(Some(
                Coin::decode(&bytes).map_err(|err| StoreError::Backend(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    coin: Option<Coin>,
    /// Differs from the backing view and must be written on flush.
    dirty: bool,
    /// The backing view has no unspent version of this coin, so a spend
    /// can simply drop the entry.
    fresh: bool,
}

/// The top-level in-memory overlay. All block connection and
/// disconnection flows through one of these; `flush_to_batch` folds the
/// accumulated deltas and the best-block marker into a single write batch.
pub struct CoinsCache<S> {
    db: CoinsViewDb<S>,
    entries: HashMap<OutPointKey, CacheEntry>,
    best_block: Option<Hash256>,
    cached_coin_bytes: usize,
}

impl<S: KeyValueStore> CoinsCache<S> {
    pub fn new(store: Arc<S>) -> Result<Self, StoreError> {
        let db = CoinsViewDb::new(store);
        let best_block = db.best_block()?;
        Ok(Self {
            db,
            entries: HashMap::new(),
            best_block,
            cached_coin_bytes: 0,
        })
    }

    pub fn best_block(&self) -> Option<Hash256> {
        self.best_block
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    /// Rough memory footprint used by the cache-size flush trigger.
    pub fn memory_usage(&self) -> usize {
        self.entries.len() * (OUTPOINT_KEY_LEN + 48) + self.cached_coin_bytes
    }

    pub fn cached_entries(&self) -> usize {
        self.entries.len()
    }

    /// Reads through to the database and memoizes the result.
    pub fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let key = OutPointKey::new(outpoint);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.coin.clone());
        }
        let coin = self.db.coin(outpoint)?;
        if let Some(coin) = &coin {
            self.cached_coin_bytes += coin.script_pubkey.len();
        }
        self.entries.insert(
            key,
            CacheEntry {
                coin: coin.clone(),
                dirty: false,
                fresh: false,
            },
        );
        Ok(coin)
    }

    pub fn add_coin(
        &mut self,
        outpoint: &OutPoint,
        coin: Coin,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let key = OutPointKey::new(outpoint);
        // Fresh means the database holds no unspent version, so a later
        // spend can drop the entry instead of scheduling a delete.
        let (existing_unspent, fresh) = match self.entries.get(&key) {
            Some(entry) => match &entry.coin {
                Some(_) => (true, entry.fresh),
                None => (false, !entry.dirty),
            },
            None => {
                let db_coin = self.db.coin(outpoint)?;
                (db_coin.is_some(), db_coin.is_none())
            }
        };
        if existing_unspent && !overwrite {
            return Err(StoreError::Backend(
                "attempt to overwrite unspent coin".to_string(),
            ));
        }
        self.cached_coin_bytes += coin.script_pubkey.len();
        self.entries.insert(
            key,
            CacheEntry {
                coin: Some(coin),
                dirty: true,
                fresh,
            },
        );
        Ok(())
    }

    /// Removes a coin, returning it for the undo record. Absent coins
    /// return `None` without mutating the cache.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let Some(coin) = self.fetch_coin(outpoint)? else {
            return Ok(None);
        };
        let key = OutPointKey::new(outpoint);
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().fresh {
                    slot.remove();
                } else {
                    let entry = slot.get_mut();
                    entry.coin = None;
                    entry.dirty = true;
                }
            }
            Entry::Vacant(_) => unreachable!("fetch_coin populates the slot"),
        }
        Ok(Some(coin))
    }

    /// Drops a clean cache entry; dirty entries stay until flushed.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        let key = OutPointKey::new(outpoint);
        if let Some(entry) = self.entries.get(&key) {
            if !entry.dirty {
                if let Some(coin) = &entry.coin {
                    self.cached_coin_bytes =
                        self.cached_coin_bytes.saturating_sub(coin.script_pubkey.len());
                }
                self.entries.remove(&key);
            }
        }
    }

    /// Folds every dirty entry plus the best-block marker into `batch`
    /// and clears the overlay.
    pub fn flush_to_batch(&mut self, batch: &mut WriteBatch) {
        for (key, entry) in self.entries.drain() {
            if !entry.dirty {
                continue;
            }
            match entry.coin {
                Some(coin) => batch.put(Column::Coin, key.as_bytes(), coin.encode()),
                None => {
                    // Fresh spends annihilated in-cache; what remains must
                    // be deleted below.
                    batch.delete(Column::Coin, key.as_bytes());
                }
            }
        }
        self.cached_coin_bytes = 0;
        if let Some(best) = self.best_block {
            batch.put(Column::Meta, META_BEST_BLOCK_KEY, best);
        }
    }

    /// Applies a per-block overlay produced by `BlockCoins::into_entries`.
    fn absorb(&mut self, child: HashMap<OutPointKey, CacheEntry>) {
        for (key, child_entry) in child {
            if !child_entry.dirty {
                continue;
            }
            match self.entries.entry(key) {
                Entry::Occupied(mut slot) => {
                    let parent = slot.get_mut();
                    if parent.fresh && child_entry.coin.is_none() {
                        slot.remove();
                    } else {
                        if let Some(coin) = &child_entry.coin {
                            self.cached_coin_bytes += coin.script_pubkey.len();
                        }
                        parent.coin = child_entry.coin;
                        parent.dirty = true;
                    }
                }
                Entry::Vacant(slot) => {
                    if child_entry.fresh && child_entry.coin.is_none() {
                        continue;
                    }
                    if let Some(coin) = &child_entry.coin {
                        self.cached_coin_bytes += coin.script_pubkey.len();
                    }
                    slot.insert(child_entry);
                }
            }
        }
    }
}

impl<S: KeyValueStore> CoinsView for CoinsCache<S> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let key = OutPointKey::new(outpoint);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.coin.clone());
        }
        self.db.coin(outpoint)
    }
}

/// Transient per-block overlay. Connect and disconnect stage mutations
/// here and commit into the parent cache only when the whole block
/// succeeded; dropping the overlay discards a failed block without a
/// trace. The overlay holds no reference: reads take the parent at the
/// call site, so committing needs no borrow gymnastics.
#[derive(Default)]
pub struct BlockCoins {
    entries: HashMap<OutPointKey, CacheEntry>,
}

impl BlockCoins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coin<S: KeyValueStore>(
        &self,
        parent: &CoinsCache<S>,
        outpoint: &OutPoint,
    ) -> Result<Option<Coin>, StoreError> {
        let key = OutPointKey::new(outpoint);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.coin.clone());
        }
        parent.coin(outpoint)
    }

    pub fn have_coin<S: KeyValueStore>(
        &self,
        parent: &CoinsCache<S>,
        outpoint: &OutPoint,
    ) -> Result<bool, StoreError> {
        Ok(self.coin(parent, outpoint)?.is_some())
    }

    pub fn add_coin<S: KeyValueStore>(
        &mut self,
        parent: &CoinsCache<S>,
        outpoint: &OutPoint,
        coin: Coin,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let key = OutPointKey::new(outpoint);
        // A spend staged in this overlay may still shadow an unspent coin
        // below; re-adding on top of it must not be considered fresh.
        let (existing_unspent, fresh) = match self.entries.get(&key) {
            Some(entry) => match &entry.coin {
                Some(_) => (true, entry.fresh),
                None => (false, false),
            },
            None => {
                let below = parent.coin(outpoint)?;
                (below.is_some(), below.is_none())
            }
        };
        if existing_unspent && !overwrite {
            return Err(StoreError::Backend(
                "attempt to overwrite unspent coin".to_string(),
            ));
        }
        self.entries.insert(
            key,
            CacheEntry {
                coin: Some(coin),
                dirty: true,
                fresh,
            },
        );
        Ok(())
    }

    pub fn spend_coin<S: KeyValueStore>(
        &mut self,
        parent: &CoinsCache<S>,
        outpoint: &OutPoint,
    ) -> Result<Option<Coin>, StoreError> {
        let Some(coin) = self.coin(parent, outpoint)? else {
            return Ok(None);
        };
        let key = OutPointKey::new(outpoint);
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().fresh {
                    slot.remove();
                } else {
                    let entry = slot.get_mut();
                    entry.coin = None;
                    entry.dirty = true;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    coin: None,
                    dirty: true,
                    fresh: false,
                });
            }
        }
        Ok(Some(coin))
    }

    /// Commits this block's deltas into the parent cache.
    pub fn commit<S: KeyValueStore>(self, parent: &mut CoinsCache<S>) {
        parent.absorb(self.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartd_storage::memory::MemoryStore;

    fn coin(value: i64, height: u32) -> Coin {
        Coin {
            value,
            script_pubkey: vec![0x51],
            height,
            is_coinbase: false,
        }
    }

    fn outpoint(tag: u8, index: u32) -> OutPoint {
        OutPoint::new([tag; 32], index)
    }

    fn fresh_cache() -> CoinsCache<MemoryStore> {
        CoinsCache::new(Arc::new(MemoryStore::new())).expect("cache")
    }

    #[test]
    fn coin_codec_round_trip() {
        let original = Coin {
            value: 5_000 * 100_000_000,
            script_pubkey: vec![0x76, 0xa9, 0x14],
            height: 42,
            is_coinbase: true,
        };
        assert_eq!(Coin::decode(&original.encode()).expect("decode"), original);
    }

    #[test]
    fn add_then_spend_never_touches_db() {
        let mut cache = fresh_cache();
        let op = outpoint(1, 0);
        cache.add_coin(&op, coin(10, 1), false).expect("add");
        assert!(cache.fetch_coin(&op).expect("fetch").is_some());
        assert!(cache.spend_coin(&op).expect("spend").is_some());
        let mut batch = WriteBatch::new();
        cache.set_best_block([9u8; 32]);
        cache.flush_to_batch(&mut batch);
        // Fresh add + spend annihilate; only the best-block marker remains.
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn flush_persists_and_reload_sees_coins() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = CoinsCache::new(Arc::clone(&store)).expect("cache");
        let op = outpoint(2, 1);
        cache.add_coin(&op, coin(25, 7), false).expect("add");
        cache.set_best_block([1u8; 32]);
        let mut batch = WriteBatch::new();
        cache.flush_to_batch(&mut batch);
        store.write_batch(&batch).expect("write");

        let mut reloaded = CoinsCache::new(store).expect("cache");
        assert_eq!(reloaded.best_block(), Some([1u8; 32]));
        let loaded = reloaded.fetch_coin(&op).expect("fetch").expect("coin");
        assert_eq!(loaded.value, 25);
        assert_eq!(loaded.height, 7);
    }

    #[test]
    fn overwrite_requires_explicit_permission() {
        let mut cache = fresh_cache();
        let op = outpoint(3, 0);
        cache.add_coin(&op, coin(1, 1), false).expect("add");
        assert!(cache.add_coin(&op, coin(2, 2), false).is_err());
        cache.add_coin(&op, coin(2, 2), true).expect("overwrite");
        assert_eq!(cache.fetch_coin(&op).expect("fetch").expect("coin").value, 2);
    }

    #[test]
    fn block_overlay_commit_and_discard() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = CoinsCache::new(Arc::clone(&store)).expect("cache");
        let existing = outpoint(4, 0);
        cache.add_coin(&existing, coin(30, 3), false).expect("add");

        // Discarded overlay leaves the parent untouched.
        {
            let mut block = BlockCoins::new();
            block.spend_coin(&cache, &existing).expect("spend");
            block
                .add_coin(&cache, &outpoint(5, 0), coin(29, 4), false)
                .expect("add");
        }
        assert!(cache.fetch_coin(&existing).expect("fetch").is_some());
        assert!(cache.fetch_coin(&outpoint(5, 0)).expect("fetch").is_none());

        // Committed overlay lands in the parent.
        let mut block = BlockCoins::new();
        block.spend_coin(&cache, &existing).expect("spend");
        block
            .add_coin(&cache, &outpoint(5, 0), coin(29, 4), false)
            .expect("add");
        block.commit(&mut cache);
        assert!(cache.fetch_coin(&existing).expect("fetch").is_none());
        assert!(cache.fetch_coin(&outpoint(5, 0)).expect("fetch").is_some());
    }

    #[test]
    fn spend_of_db_coin_schedules_delete() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut cache = CoinsCache::new(Arc::clone(&store)).expect("cache");
            cache
                .add_coin(&outpoint(6, 0), coin(11, 2), false)
                .expect("add");
            let mut batch = WriteBatch::new();
            cache.set_best_block([2u8; 32]);
            cache.flush_to_batch(&mut batch);
            store.write_batch(&batch).expect("write");
        }

        let mut cache = CoinsCache::new(Arc::clone(&store)).expect("cache");
        assert!(cache.spend_coin(&outpoint(6, 0)).expect("spend").is_some());
        let mut batch = WriteBatch::new();
        cache.flush_to_batch(&mut batch);
        store.write_batch(&batch).expect("write");

        let mut reloaded = CoinsCache::new(store).expect("cache");
        assert!(reloaded.fetch_coin(&outpoint(6, 0)).expect("fetch").is_none());
    }
}
