//! Consensus constants, chain parameters, and the reward schedule.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod rewards;

pub use params::{chain_params, ChainParams, Checkpoint, Network};
pub use rewards::block_subsidy;

pub type Hash256 = [u8; 32];
