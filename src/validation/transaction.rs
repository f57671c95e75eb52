//! Value-transfer transactions
//!
//! Account-model transactions signed with recoverable ECDSA over secp256k1.
//! A transaction with an empty `from` is a coinbase: it carries no signature
//! and pays the block subsidy to `to`.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{keccak256, Hash};

/// Fixed gas for a plain value transfer
pub const TRANSFER_GAS: u64 = 21_000;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("transaction has no signature")]
    MissingSignature,
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("signature does not match sender address")]
    SenderMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Sender address; empty for coinbase
    pub from: Vec<u8>,
    /// Recipient address
    pub to: Vec<u8>,
    /// Value to transfer, in base units
    #[serde(with = "decimal_serde")]
    pub amount: BigUint,
    /// Replay protection
    pub nonce: u64,
    pub gas_limit: u64,
    #[serde(with = "decimal_serde")]
    pub gas_price: BigUint,
    /// 65-byte recoverable ECDSA signature (r || s || v)
    pub signature: Vec<u8>,
    /// Cached hash, set at signing time
    pub hash: Vec<u8>,
}

/// Canonical view hashed for signing: everything except signature and cache.
/// Field order is part of consensus.
#[derive(Serialize)]
struct SigningView<'a> {
    from: &'a [u8],
    to: &'a [u8],
    #[serde(with = "decimal_serde_ref")]
    amount: &'a BigUint,
    nonce: u64,
    gas_limit: u64,
    #[serde(with = "decimal_serde_ref")]
    gas_price: &'a BigUint,
}

impl Transaction {
    /// Coinbase paying the block subsidy to the miner
    pub fn coinbase(miner_address: Vec<u8>, subsidy: BigUint) -> Self {
        let mut tx = Self {
            from: Vec::new(),
            to: miner_address,
            amount: subsidy,
            nonce: 0,
            gas_limit: 0,
            gas_price: BigUint::zero(),
            signature: Vec::new(),
            hash: Vec::new(),
        };
        tx.hash = tx.hash().0.to_vec();
        tx
    }

    /// Regular value transfer
    pub fn transfer(from: Vec<u8>, to: Vec<u8>, amount: BigUint, nonce: u64) -> Self {
        Self {
            from,
            to,
            amount,
            nonce,
            gas_limit: TRANSFER_GAS,
            gas_price: BigUint::from(1u8),
            signature: Vec::new(),
            hash: Vec::new(),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.from.is_empty()
    }

    /// Keccak-256 of the canonical serialization of
    /// {from, to, amount, nonce, gas_limit, gas_price}
    pub fn hash(&self) -> Hash {
        let view = SigningView {
            from: &self.from,
            to: &self.to,
            amount: &self.amount,
            nonce: self.nonce,
            gas_limit: self.gas_limit,
            gas_price: &self.gas_price,
        };
        let encoded = serde_json::to_vec(&view).expect("signing view serializes");
        keccak256(&encoded)
    }

    /// Sign with the given key, filling `signature` and the cached `hash`
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), TxError> {
        let digest = self.hash();
        let (sig, recovery) = key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|e| TxError::InvalidSignature(e.to_string()))?;
        let mut bytes = sig.to_bytes().to_vec();
        bytes.push(recovery.to_byte());
        self.signature = bytes;
        self.hash = digest.0.to_vec();
        Ok(())
    }

    /// Verify the signature recovers the sender address. Coinbase
    /// transactions pass unconditionally.
    pub fn verify(&self) -> Result<(), TxError> {
        if self.is_coinbase() {
            return Ok(());
        }
        if self.signature.len() != 65 {
            return Err(TxError::MissingSignature);
        }

        let digest = self.hash();
        let recovery = RecoveryId::from_byte(self.signature[64])
            .ok_or_else(|| TxError::InvalidSignature("bad recovery id".into()))?;
        let sig = Signature::from_slice(&self.signature[..64])
            .map_err(|e| TxError::InvalidSignature(e.to_string()))?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &sig, recovery)
            .map_err(|e| TxError::InvalidSignature(e.to_string()))?;

        if address_of(&key) != self.from {
            return Err(TxError::SenderMismatch);
        }
        Ok(())
    }
}

/// Address of a verifying key: the last 20 bytes of the Keccak-256 of the
/// uncompressed public key (tag byte stripped).
pub fn address_of(key: &VerifyingKey) -> Vec<u8> {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    digest.0[12..].to_vec()
}

/// Arbitrary-precision amounts ride as decimal strings, same discipline as
/// header bits.
mod decimal_serde {
    use num_bigint::BigUint;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(v: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(BigUint::from(0u8));
        }
        BigUint::from_str(&s).map_err(D::Error::custom)
    }
}

mod decimal_serde_ref {
    use num_bigint::BigUint;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(v: &&BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }
}
