//! Validation module - transactions and the block replay verifier

mod transaction;
mod verify;

pub use transaction::*;
pub use verify::*;
