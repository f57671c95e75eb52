//! POAI blockchain core library
//!
//! A single-chain blockchain whose proof of work is deterministic inference
//! over a fixed large language model: a nonce selects a procedurally generated
//! quiz, the model answers it, and the block is valid when the loss derived
//! from the answer falls at or below the difficulty target.

pub mod chain;
pub mod consensus;
pub mod crypto;
pub mod inference;
pub mod mining;
pub mod node;
pub mod p2p;
pub mod storage;
pub mod validation;
pub mod wallet;

use num_bigint::BigInt;

/// Protocol constants shared by every node on the network.
pub mod constants {
    /// Blocks between difficulty retargets
    pub const RETARGET_INTERVAL: u64 = 2016;

    /// Desired seconds per block (10 minutes)
    pub const TARGET_BLOCK_SPACING_SECS: i64 = 600;

    /// Clamp on the retarget ratio: the measured span is bounded to
    /// [expected/4, expected*4] per adjustment period
    pub const MAX_ADJUSTMENT_FACTOR: i64 = 4;

    /// Default mining target (more negative = harder)
    pub const DEFAULT_TARGET: i64 = -1_000_000_000_000_000_000;

    /// Coinbase subsidy at genesis, in base units
    pub const INITIAL_SUBSIDY: u64 = 50;

    /// Heights between subsidy halvings
    pub const HALVING_BLOCKS: u64 = 210_000;

    /// Subsidy is zero once this many halvings have elapsed
    pub const MAX_HALVINGS: u64 = 64;

    /// Maximum transactions pulled from the mempool per block, excluding
    /// the coinbase
    pub const MAX_BLOCK_TXS: usize = 100;

    /// Upper bound on a single block on the wire
    pub const MAX_WIRE_BLOCK: usize = 256 * 1024;

    /// Upper bound on blocks served per sync response
    pub const MAX_BLOCKS_PER_RESPONSE: u64 = 512;

    /// Catch-up window requested when an orphan's ancestry is missing
    pub const ORPHAN_FETCH_WINDOW: u64 = 100;
}

/// Immutable node-wide consensus configuration.
///
/// Constructed once at startup from CLI flags and handed to the chain, miner,
/// validator and difficulty engine. Nothing mutates it after init.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Target assigned to the genesis block
    pub initial_target: BigInt,
    /// Blocks between difficulty retargets
    pub retarget_interval: u64,
    /// Desired seconds per block
    pub target_spacing_secs: i64,
    /// Clamp factor for the retarget ratio
    pub max_adjustment_factor: i64,
    /// Blocks to keep on disk; 0 disables pruning
    pub prune_depth: u64,
    /// Heights per epoch (reserved for dataset key derivation)
    pub epoch_blocks: u64,
    /// Records per inference batch (reserved, kept for CLI parity)
    pub batch_size: usize,
    /// Mempool transactions admitted per block
    pub max_block_txs: usize,
    /// When set, block hashes cover every header field instead of the
    /// minimal {height, parent, nonce} preimage. Off by default: the live
    /// network hashes the minimal preimage.
    pub full_header_hashing: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            initial_target: BigInt::from(constants::DEFAULT_TARGET),
            retarget_interval: constants::RETARGET_INTERVAL,
            target_spacing_secs: constants::TARGET_BLOCK_SPACING_SECS,
            max_adjustment_factor: constants::MAX_ADJUSTMENT_FACTOR,
            prune_depth: 0,
            epoch_blocks: 20,
            batch_size: 2,
            max_block_txs: constants::MAX_BLOCK_TXS,
            full_header_hashing: false,
        }
    }
}
