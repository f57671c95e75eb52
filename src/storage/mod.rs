//! Storage module - durable block store, account state, mempool

mod mempool;
mod state;
mod store;

pub use mempool::*;
pub use state::*;
pub use store::*;
