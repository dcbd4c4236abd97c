//! Engine configuration knobs.

use smartd_consensus::Hash256;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Mempool memory ceiling in bytes (`maxmempool`, MiB at the CLI).
    pub max_mempool_bytes: usize,
    /// Hours before an unconfirmed transaction expires from the pool.
    pub mempool_expiry_hours: u64,
    pub limit_ancestor_count: usize,
    pub limit_ancestor_size: usize,
    pub limit_descendant_count: usize,
    pub limit_descendant_size: usize,
    /// Misbehavior score at which a peer is flagged for disconnection.
    pub ban_score: u32,
    /// Free-transaction budget in kB per minute.
    pub limit_free_relay_kb: u64,
    /// Minimum relay fee rate in satoshis per kB.
    pub min_relay_fee_per_kb: i64,
    /// Coin view cache budget in bytes (`dbcache`, MiB at the CLI).
    pub db_cache_bytes: usize,
    /// Prune target in MiB; zero keeps everything.
    pub prune_target_mib: u64,
    pub reindex: bool,
    pub tx_index: bool,
    pub address_index: bool,
    pub timestamp_index: bool,
    pub spent_index: bool,
    /// Blocks at or below an ancestor of this hash skip script checks.
    pub assume_valid: Option<Hash256>,
    /// Run the paranoid whole-index invariant check after mutations.
    pub check_block_index: bool,
    /// Parallel script verification workers; zero verifies inline.
    pub script_check_workers: usize,
    pub require_standard: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_mempool_bytes: 300 * 1024 * 1024,
            mempool_expiry_hours: 72,
            limit_ancestor_count: 25,
            limit_ancestor_size: 101 * 1000,
            limit_descendant_count: 25,
            limit_descendant_size: 101 * 1000,
            ban_score: 100,
            limit_free_relay_kb: 15,
            min_relay_fee_per_kb: 1_000,
            db_cache_bytes: 300 * 1024 * 1024,
            prune_target_mib: 0,
            reindex: false,
            tx_index: false,
            address_index: false,
            timestamp_index: false,
            spent_index: false,
            assume_valid: None,
            check_block_index: false,
            script_check_workers: 0,
            require_standard: true,
        }
    }
}

impl EngineConfig {
    /// Everything switched on, sized for tests.
    pub fn all_indexes() -> Self {
        Self {
            tx_index: true,
            address_index: true,
            timestamp_index: true,
            spent_index: true,
            ..Self::default()
        }
    }
}
