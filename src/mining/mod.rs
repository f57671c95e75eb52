//! Mining module - nonce search over deterministic inference

mod miner;

pub use miner::*;
