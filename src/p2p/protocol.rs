//! Sync protocol messages
//!
//! Three gossip topics carry chain sync. Payloads are JSON for
//! forward-compatibility; block bodies inside responses use the canonical
//! block encoding, so `bits` stays a decimal string end to end.

use serde::{Deserialize, Serialize};

use crate::consensus::Block;
use crate::crypto::Hash;

/// Head announcements
pub const TOPIC_NEW_HEAD: &str = "newhead/v1";
/// Range requests, inclusive bounds
pub const TOPIC_BLOCK_REQ: &str = "blockreq/v1";
/// Range responses
pub const TOPIC_BLOCK_RESP: &str = "blockresp/v1";

/// Announcement of a new local tip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewHead {
    pub height: u64,
    pub hash: Hash,
    pub parent: Hash,
}

/// Request for blocks in [from, to]; responders cap the span
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockRequest {
    pub from: u64,
    pub to: u64,
}

/// Blocks answering a request, ascending by height
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResponse {
    pub blocks: Vec<Block>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_head_roundtrip() {
        let msg = NewHead {
            height: 42,
            hash: Hash::from_bytes([1u8; 32]),
            parent: Hash::from_bytes([2u8; 32]),
        };
        let data = serde_json::to_vec(&msg).unwrap();
        let decoded: NewHead = serde_json::from_slice(&data).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_block_request_roundtrip() {
        let msg = BlockRequest { from: 10, to: 20 };
        let data = serde_json::to_vec(&msg).unwrap();
        let decoded: BlockRequest = serde_json::from_slice(&data).unwrap();
        assert_eq!(decoded, msg);
    }
}
