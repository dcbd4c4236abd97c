//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (buffer limit).
pub const MAX_BLOCK_SERIALIZED_SIZE: u32 = 2_000_000;
/// The block size limit before adaptive sizing activates (network rule).
pub const OLD_MAX_BLOCK_SIZE: u32 = 1_000_000;
/// Base block size used for the adaptive computation.
pub const MAX_BLOCK_BASE_SIZE: u32 = 1_000_000;
/// The maximum allowed multiple for the computed adaptive block size.
pub const MAX_BLOCK_SIZE_INCREASE_MULTIPLE: u32 = 2;
/// Blocks considered in the median block size computation.
pub const NUM_BLOCKS_FOR_MEDIAN_BLOCK: usize = 2016;
/// The maximum allowed number of signature check operations in a block.
pub const MAX_BLOCK_SIGOPS_COST: u32 = 160_000;
/// Sigop allowance per block as a function of the effective block size.
pub const fn max_block_sigops(block_size: u32) -> u32 {
    block_size / 50
}
/// The maximum sigop cost a standard transaction may carry.
pub const MAX_STANDARD_TX_SIGOPS_COST: u32 = MAX_BLOCK_SIGOPS_COST / 5;
/// Coinbase outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Coinbase scriptSig length bounds (network rule).
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;
/// The maximum serialized size of a standard transaction.
pub const MAX_STANDARD_TX_SIZE: u32 = 100_000;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Last block of the declining reward era; fees only beyond this.
pub const HF_CHAIN_REWARD_END_HEIGHT: i32 = 717_499_999;
/// Height at which the flat 5000-coin reward gives way to the decline.
pub const HF_REWARD_DECLINE_START_HEIGHT: i32 = 143_500;

/// Number of previous block times the timestamp median spans.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Maximum tolerated clock skew for incoming header timestamps.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Blocks of undo data and candidate slack kept ahead of the active tip.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;

/// Interpret sequence numbers as relative lock-time constraints.
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Use the median of past block times as the locktime cutoff.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Locktime flags applied by policy outside of consensus.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 =
    LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

/// nLockTime values below this are block heights, above it unix times.
pub const LOCKTIME_THRESHOLD: i64 = 500_000_000;

/// Sequence number bit disabling relative lock-time for an input.
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
/// Sequence number bit selecting time-based rather than height-based locks.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
/// Mask extracting the lock value from a sequence number.
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
/// Granularity shift for time-based relative locks (512 second units).
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;
/// Inputs with sequence below this value signal replaceability.
pub const MAX_BIP125_RBF_SEQUENCE: u32 = 0xffff_fffd;
