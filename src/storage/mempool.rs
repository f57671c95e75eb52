//! Pending transaction pool
//!
//! Validated transactions waiting for a block, keyed by hash. The miner
//! drains up to the configured maximum per template; a periodic sweep evicts
//! entries that stopped validating after state moved on.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{AccountState, StateError};
use crate::validation::Transaction;

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("transaction already in mempool")]
    AlreadyKnown,
    #[error(transparent)]
    Invalid(#[from] StateError),
}

pub struct Mempool {
    txs: Mutex<HashMap<String, Transaction>>,
    state: AccountState,
}

impl Mempool {
    pub fn new(state: AccountState) -> Self {
        Self {
            txs: Mutex::new(HashMap::new()),
            state,
        }
    }

    /// Admit a transaction after validating it against current state
    pub fn add(&self, tx: Transaction) -> Result<(), MempoolError> {
        let key = hex::encode(tx.hash().as_bytes());
        let mut txs = self.txs.lock().unwrap();
        if txs.contains_key(&key) {
            return Err(MempoolError::AlreadyKnown);
        }
        self.state.validate_transaction(&tx)?;
        debug!(tx = %&key[..8.min(key.len())], "mempool admit");
        txs.insert(key, tx);
        Ok(())
    }

    /// Take up to `max` transactions for a block template
    pub fn take_for_block(&self, max: usize) -> Vec<Transaction> {
        let txs = self.txs.lock().unwrap();
        txs.values().take(max).cloned().collect()
    }

    /// Drop transactions included in an accepted block
    pub fn remove_included(&self, included: &[Transaction]) {
        let mut txs = self.txs.lock().unwrap();
        for tx in included {
            txs.remove(&hex::encode(tx.hash().as_bytes()));
        }
    }

    pub fn len(&self) -> usize {
        self.txs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict entries that no longer validate (spent balance, stale nonce)
    pub fn cleanup(&self) {
        let mut txs = self.txs.lock().unwrap();
        let before = txs.len();
        txs.retain(|_, tx| self.state.validate_transaction(tx).is_ok());
        let evicted = before - txs.len();
        if evicted > 0 {
            info!(evicted, remaining = txs.len(), "mempool sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use num_bigint::BigUint;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    use crate::validation::address_of;

    fn setup() -> (TempDir, AccountState, Mempool) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let state = AccountState::new(db);
        let pool = Mempool::new(state.clone());
        (dir, state, pool)
    }

    fn signed_transfer(state: &AccountState, amount: u32, nonce: u64) -> Transaction {
        let key = SigningKey::random(&mut OsRng);
        let addr = address_of(key.verifying_key());
        state
            .set_balance(&addr, &BigUint::from(10_000_000u64))
            .unwrap();
        let mut tx = Transaction::transfer(addr, vec![2u8; 20], BigUint::from(amount), nonce);
        tx.sign(&key).unwrap();
        tx
    }

    #[test]
    fn test_add_and_take() {
        let (_dir, state, pool) = setup();
        pool.add(signed_transfer(&state, 10, 0)).unwrap();
        pool.add(signed_transfer(&state, 20, 0)).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.take_for_block(1).len(), 1);
        assert_eq!(pool.take_for_block(10).len(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let (_dir, state, pool) = setup();
        let tx = signed_transfer(&state, 10, 0);
        pool.add(tx.clone()).unwrap();
        assert!(matches!(pool.add(tx), Err(MempoolError::AlreadyKnown)));
    }

    #[test]
    fn test_invalid_rejected_on_admission() {
        let (_dir, _state, pool) = setup();
        // unfunded sender
        let key = SigningKey::random(&mut OsRng);
        let addr = address_of(key.verifying_key());
        let mut tx = Transaction::transfer(addr, vec![2u8; 20], BigUint::from(10u8), 0);
        tx.sign(&key).unwrap();
        assert!(matches!(pool.add(tx), Err(MempoolError::Invalid(_))));
    }

    #[test]
    fn test_remove_included() {
        let (_dir, state, pool) = setup();
        let tx = signed_transfer(&state, 10, 0);
        pool.add(tx.clone()).unwrap();
        pool.remove_included(&[tx]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_cleanup_evicts_stale_nonce() {
        let (_dir, state, pool) = setup();
        let key = SigningKey::random(&mut OsRng);
        let addr = address_of(key.verifying_key());
        state
            .set_balance(&addr, &BigUint::from(10_000_000u64))
            .unwrap();
        let mut tx = Transaction::transfer(addr.clone(), vec![2u8; 20], BigUint::from(1u8), 0);
        tx.sign(&key).unwrap();
        pool.add(tx).unwrap();

        // the account's nonce moves past the pooled transaction
        state.set_nonce(&addr, 1).unwrap();
        pool.cleanup();
        assert!(pool.is_empty());
    }
}
