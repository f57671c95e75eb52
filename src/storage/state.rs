//! Account state
//!
//! Balances and nonces keyed by address in the shared database
//! (`balance:<addr>`, `nonce:<addr>`). Transaction execution here is
//! node-local bookkeeping: consensus only guarantees per-transaction
//! signatures, not a global account state.

use num_bigint::BigUint;
use num_traits::Zero;
use sled::Db;
use thiserror::Error;
use tracing::warn;

use crate::validation::Transaction;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("transaction verification failed: {0}")]
    InvalidSignature(String),
    #[error("invalid nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: BigUint, need: BigUint },
    #[error("state i/o failure: {0}")]
    Backend(#[from] sled::Error),
}

#[derive(Debug, Clone)]
pub struct AccountState {
    db: Db,
}

fn balance_key(addr: &[u8]) -> Vec<u8> {
    let mut key = b"balance:".to_vec();
    key.extend_from_slice(addr);
    key
}

fn nonce_key(addr: &[u8]) -> Vec<u8> {
    let mut key = b"nonce:".to_vec();
    key.extend_from_slice(addr);
    key
}

impl AccountState {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn balance(&self, addr: &[u8]) -> BigUint {
        match self.db.get(balance_key(addr)) {
            Ok(Some(bytes)) => BigUint::from_bytes_be(&bytes),
            Ok(None) => BigUint::zero(),
            Err(e) => {
                warn!(error = %e, "balance read failed");
                BigUint::zero()
            }
        }
    }

    pub fn set_balance(&self, addr: &[u8], amount: &BigUint) -> Result<(), StateError> {
        self.db.insert(balance_key(addr), amount.to_bytes_be())?;
        Ok(())
    }

    pub fn add_balance(&self, addr: &[u8], amount: &BigUint) -> Result<(), StateError> {
        let balance = self.balance(addr) + amount;
        self.set_balance(addr, &balance)
    }

    pub fn sub_balance(&self, addr: &[u8], amount: &BigUint) -> Result<(), StateError> {
        let balance = self.balance(addr);
        if &balance < amount {
            return Err(StateError::InsufficientBalance {
                have: balance,
                need: amount.clone(),
            });
        }
        self.set_balance(addr, &(balance - amount))
    }

    pub fn nonce(&self, addr: &[u8]) -> u64 {
        match self.db.get(nonce_key(addr)) {
            Ok(Some(bytes)) if bytes.len() >= 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                u64::from_le_bytes(raw)
            }
            Ok(_) => 0,
            Err(e) => {
                warn!(error = %e, "nonce read failed");
                0
            }
        }
    }

    pub fn set_nonce(&self, addr: &[u8], nonce: u64) -> Result<(), StateError> {
        self.db.insert(nonce_key(addr), nonce.to_le_bytes().as_ref())?;
        Ok(())
    }

    /// Check a transaction against current state without mutating it
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<(), StateError> {
        tx.verify()
            .map_err(|e| StateError::InvalidSignature(e.to_string()))?;
        if tx.is_coinbase() {
            return Ok(());
        }

        let expected = self.nonce(&tx.from);
        if tx.nonce != expected {
            return Err(StateError::BadNonce {
                expected,
                got: tx.nonce,
            });
        }

        let total = self.total_cost(tx);
        let balance = self.balance(&tx.from);
        if balance < total {
            return Err(StateError::InsufficientBalance {
                have: balance,
                need: total,
            });
        }
        Ok(())
    }

    /// Apply a transaction: debit sender (value + gas), credit recipient,
    /// bump the nonce. Coinbase simply credits the subsidy.
    pub fn execute_transaction(&self, tx: &Transaction) -> Result<(), StateError> {
        self.validate_transaction(tx)?;
        if tx.is_coinbase() {
            return self.add_balance(&tx.to, &tx.amount);
        }

        self.sub_balance(&tx.from, &self.total_cost(tx))?;
        self.add_balance(&tx.to, &tx.amount)?;
        self.set_nonce(&tx.from, tx.nonce + 1)
    }

    fn total_cost(&self, tx: &Transaction) -> BigUint {
        &tx.amount + BigUint::from(tx.gas_limit) * &tx.gas_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    use crate::validation::address_of;

    fn fresh_state() -> (TempDir, AccountState) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let state = AccountState::new(db);
        (dir, state)
    }

    fn funded_sender(state: &AccountState, amount: u64) -> (SigningKey, Vec<u8>) {
        let key = SigningKey::random(&mut OsRng);
        let addr = address_of(key.verifying_key());
        state.set_balance(&addr, &BigUint::from(amount)).unwrap();
        (key, addr)
    }

    #[test]
    fn test_unknown_account_has_zero_balance() {
        let (_dir, state) = fresh_state();
        assert_eq!(state.balance(b"nobody"), BigUint::zero());
        assert_eq!(state.nonce(b"nobody"), 0);
    }

    #[test]
    fn test_coinbase_credits_recipient() {
        let (_dir, state) = fresh_state();
        let tx = Transaction::coinbase(vec![7u8; 20], BigUint::from(50u8));
        state.execute_transaction(&tx).unwrap();
        assert_eq!(state.balance(&[7u8; 20]), BigUint::from(50u8));
    }

    #[test]
    fn test_transfer_moves_value_and_bumps_nonce() {
        let (_dir, state) = fresh_state();
        let (key, from) = funded_sender(&state, 100_000);

        let mut tx =
            Transaction::transfer(from.clone(), vec![9u8; 20], BigUint::from(500u32), 0);
        tx.sign(&key).unwrap();
        state.execute_transaction(&tx).unwrap();

        assert_eq!(state.balance(&[9u8; 20]), BigUint::from(500u32));
        assert_eq!(state.nonce(&from), 1);
        // sender paid value + gas_limit * gas_price
        assert_eq!(
            state.balance(&from),
            BigUint::from(100_000u32 - 500 - 21_000)
        );
    }

    #[test]
    fn test_insufficient_balance_rejected() {
        let (_dir, state) = fresh_state();
        let (key, from) = funded_sender(&state, 10);

        let mut tx = Transaction::transfer(from, vec![9u8; 20], BigUint::from(500u32), 0);
        tx.sign(&key).unwrap();
        assert!(matches!(
            state.execute_transaction(&tx),
            Err(StateError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_replayed_nonce_rejected() {
        let (_dir, state) = fresh_state();
        let (key, from) = funded_sender(&state, 100_000);

        let mut tx = Transaction::transfer(from, vec![9u8; 20], BigUint::from(1u8), 0);
        tx.sign(&key).unwrap();
        state.execute_transaction(&tx).unwrap();
        assert!(matches!(
            state.execute_transaction(&tx),
            Err(StateError::BadNonce {
                expected: 1,
                got: 0
            })
        ));
    }
}
