//! Consensus module - block model, difficulty, quiz generation, subsidy

mod block;
mod difficulty;
mod quiz;
mod subsidy;

pub use block::*;
pub use difficulty::*;
pub use quiz::*;
pub use subsidy::*;
