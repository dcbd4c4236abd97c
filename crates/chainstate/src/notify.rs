//! Interfaces to external collaborators: the signal bus, the governance
//! validator, relay oracles, and peer attribution.

use std::collections::HashMap;

use smartd_consensus::Hash256;
use smartd_primitives::outpoint::OutPoint;
use smartd_primitives::transaction::Transaction;

use crate::validation::ValidationState;

/// Signal bus the engine raises chain events on. Default implementations
/// make every notification optional.
pub trait ChainListener: Send + Sync {
    fn accepted_block_header(&self, _hash: &Hash256) {}

    fn notify_header_tip(&self, _hash: &Hash256, _height: i32) {}

    fn updated_block_tip(&self, _hash: &Hash256, _height: i32, _initial_download: bool) {}

    /// A transaction entered (block `Some`) or left (block `None`) the
    /// active chain.
    fn sync_transaction(&self, _tx: &Transaction, _block_hash: Option<&Hash256>) {}

    fn block_checked(&self, _hash: &Hash256, _state: Option<&ValidationState>) {}

    fn set_best_chain(&self, _locator: &[Hash256]) {}
}

/// A listener that ignores everything; the default wiring for tests.
pub struct NullListener;

impl ChainListener for NullListener {}

/// External per-block predicate consulted before a connect is finalized
/// (mining/governance payee enforcement lives behind it).
pub trait GovernanceValidator: Send + Sync {
    fn validate_block(&self, coinbase: &Transaction, height: i32, reward: i64) -> bool;
}

/// Accepts every block; used when no governance rules are loaded.
pub struct NullGovernance;

impl GovernanceValidator for NullGovernance {
    fn validate_block(&self, _coinbase: &Transaction, _height: i32, _reward: i64) -> bool {
        true
    }
}

/// Instant-lock conflicts: an outpoint already locked to a different
/// transaction blocks admission and block acceptance.
pub trait InstantLockOracle: Send + Sync {
    fn locking_tx(&self, outpoint: &OutPoint) -> Option<Hash256>;
}

pub struct NullInstantLocks;

impl InstantLockOracle for NullInstantLocks {
    fn locking_tx(&self, _outpoint: &OutPoint) -> Option<Hash256> {
        None
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Spork {
    InstantSendFiltering,
    InstantSendBlockFiltering,
}

/// Network feature flags toggled by privileged broadcast.
pub trait SporkOracle: Send + Sync {
    fn is_active(&self, spork: Spork) -> bool;
}

pub struct NullSporks;

impl SporkOracle for NullSporks {
    fn is_active(&self, _spork: Spork) -> bool {
        false
    }
}

/// Where a block came from, kept so validation failures can be attributed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockSource {
    pub peer_id: i64,
    /// Whether an invalid block should count against the peer.
    pub punish: bool,
}

/// Misbehavior accrued against a source peer; the network layer drains
/// these and disconnects past its ban threshold.
#[derive(Clone, Debug)]
pub struct PeerPenalty {
    pub peer_id: i64,
    pub score: u32,
    pub reason: &'static str,
}

/// Tracks block origin and the penalties validation has assessed.
#[derive(Default)]
pub struct PeerLedger {
    sources: HashMap<Hash256, BlockSource>,
    penalties: Vec<PeerPenalty>,
}

impl PeerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_source(&mut self, hash: Hash256, source: BlockSource) {
        self.sources.insert(hash, source);
    }

    pub fn source(&self, hash: &Hash256) -> Option<BlockSource> {
        self.sources.get(hash).copied()
    }

    pub fn forget(&mut self, hash: &Hash256) {
        self.sources.remove(hash);
    }

    /// Assesses an invalid block against its source, if punishment applies.
    pub fn punish(&mut self, hash: &Hash256, state: &ValidationState) {
        if state.dos_score == 0 {
            return;
        }
        if let Some(source) = self.sources.get(hash) {
            if source.punish {
                self.penalties.push(PeerPenalty {
                    peer_id: source.peer_id,
                    score: state.dos_score,
                    reason: state.reject_reason,
                });
            }
        }
    }

    pub fn drain_penalties(&mut self) -> Vec<PeerPenalty> {
        std::mem::take(&mut self.penalties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{ValidationState, REJECT_INVALID};

    #[test]
    fn punishment_respects_source_flag() {
        let mut ledger = PeerLedger::new();
        let hash_a = [1u8; 32];
        let hash_b = [2u8; 32];
        ledger.record_source(
            hash_a,
            BlockSource {
                peer_id: 7,
                punish: true,
            },
        );
        ledger.record_source(
            hash_b,
            BlockSource {
                peer_id: 8,
                punish: false,
            },
        );
        let state = ValidationState::dos(100, REJECT_INVALID, "bad-txnmrklroot");
        ledger.punish(&hash_a, &state);
        ledger.punish(&hash_b, &state);
        let penalties = ledger.drain_penalties();
        assert_eq!(penalties.len(), 1);
        assert_eq!(penalties[0].peer_id, 7);
        assert_eq!(penalties[0].score, 100);
        assert!(ledger.drain_penalties().is_empty());
    }
}
