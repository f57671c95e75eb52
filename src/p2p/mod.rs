//! P2P module - sync protocol over a pluggable gossip transport

mod filedrop;
mod protocol;
mod sync;

pub use filedrop::*;
pub use protocol::*;
pub use sync::*;
