//! Block and header model
//!
//! Defines the canonical header, its hashing discipline, and the block
//! encoding used for storage and the wire.

use num_bigint::BigInt;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::crypto::{keccak256, sha3_256, Hash};
use crate::validation::Transaction;

/// Decode failures surfaced to the import pipeline
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed block: {0}")]
    MalformedBlock(#[from] serde_json::Error),
}

/// Canonical block header.
///
/// `bits` is the difficulty target: an arbitrary-precision signed integer
/// where more negative means harder. It rides the wire as a decimal string;
/// numeric JSON is forbidden for it so that no implementation silently
/// truncates it to a machine word.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub height: u64,
    pub parent_hash: Hash,
    /// Claimed loss, the signed 64-bit digest of the model output
    pub loss_claim: i64,
    #[serde(with = "bits_serde")]
    pub bits: BigInt,
    /// Unix seconds
    pub timestamp: i64,
    /// Reserved for a future state trie root
    pub state_root: Hash,
    /// Mining nonce selecting the quiz
    pub nonce: u64,
}

impl Header {
    /// SHA3-256 over the little-endian concatenation
    /// {height(8) || parent_hash(32) || nonce(8)}.
    ///
    /// The remaining header fields deliberately do not contribute; the live
    /// network depends on this exact preimage. See `hash_full` for the
    /// migration variant.
    pub fn hash(&self) -> Hash {
        let mut buf = [0u8; 48];
        buf[..8].copy_from_slice(&self.height.to_le_bytes());
        buf[8..40].copy_from_slice(&self.parent_hash.0);
        buf[40..].copy_from_slice(&self.nonce.to_le_bytes());
        sha3_256(&buf)
    }

    /// SHA3-256 over every header field. Only used when
    /// `ChainConfig::full_header_hashing` is set; incompatible with the
    /// current network.
    pub fn hash_full(&self) -> Hash {
        let mut buf = Vec::with_capacity(96 + 24);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.parent_hash.0);
        buf.extend_from_slice(&self.loss_claim.to_le_bytes());
        buf.extend_from_slice(self.bits.to_string().as_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.state_root.0);
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        sha3_256(&buf)
    }

    /// Dispatch between the minimal and full preimage
    pub fn hash_with(&self, full: bool) -> Hash {
        if full {
            self.hash_full()
        } else {
            self.hash()
        }
    }
}

/// A complete block: header, ordered transactions, and ancillary fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    /// Keccak-256 of the concatenated transaction hashes; empty for an
    /// empty transaction list
    pub merkle_root: Vec<u8>,
    /// Wall-clock assembly time, unix seconds
    pub time: i64,
    /// Opaque receipts blob, reserved
    pub receipts: Vec<u8>,
}

impl Block {
    /// Assemble a block over the given parent. `bits` is inherited from the
    /// parent; the importing chain overwrites it at retarget boundaries.
    pub fn new(
        height: u64,
        parent_hash: Hash,
        loss: i64,
        transactions: Vec<Transaction>,
        parent_bits: BigInt,
        nonce: u64,
    ) -> Self {
        let now = unix_time();
        let merkle_root = merkle_root(&transactions);
        Self {
            header: Header {
                height,
                parent_hash,
                loss_claim: loss,
                bits: parent_bits,
                timestamp: now,
                state_root: Hash::zero(),
                nonce,
            },
            transactions,
            merkle_root,
            time: now,
            receipts: Vec::new(),
        }
    }

    /// Block hash (the header hash)
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 0 && self.header.parent_hash.is_zero()
    }

    /// Serialize for storage and the wire
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize; unparseable input is a `MalformedBlock`
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Flat merkle root: Keccak-256 over the concatenation of the per-transaction
/// hashes, in block order. Empty bytes for an empty list. There is no tree
/// balancing; the single flat round is consensus-critical.
pub fn merkle_root(transactions: &[Transaction]) -> Vec<u8> {
    if transactions.is_empty() {
        return Vec::new();
    }
    let mut concat = Vec::with_capacity(transactions.len() * 32);
    for tx in transactions {
        concat.extend_from_slice(tx.hash().as_bytes());
    }
    keccak256(&concat).0.to_vec()
}

/// Current wall clock as unix seconds
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `bits` is transported as a decimal string to avoid binary-integer
/// ambiguity across implementations.
mod bits_serde {
    use num_bigint::BigInt;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(bits: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&bits.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(BigInt::from(0));
        }
        BigInt::from_str(&s).map_err(D::Error::custom)
    }
}

/// True when `bits` is unusable as a target and must be repaired before the
/// header is handed out (persisted headers carry a non-zero target).
pub fn bits_missing(bits: &BigInt) -> bool {
    bits.is_zero()
}
