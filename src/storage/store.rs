//! Durable block storage over sled
//!
//! Blocks are keyed `block:<decimal height>`; the canonical tip rides under
//! `chain:tip` as a decimal string and advances with every put. The store is
//! owned exclusively by the node process.

use sled::Db;
use std::path::Path;
use thiserror::Error;

use crate::consensus::{Block, CodecError};

const TIP_KEY: &str = "chain:tip";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failure: {0}")]
    Backend(#[from] sled::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("corrupt store entry: {0}")]
    Corrupt(String),
}

/// Block store handle. Cloning shares the underlying database.
#[derive(Debug, Clone)]
pub struct BlockStore {
    db: Db,
}

fn block_key(height: u64) -> Vec<u8> {
    format!("block:{height}").into_bytes()
}

impl BlockStore {
    /// Open (or create) the store under `<data_dir>/chaindb`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let db = sled::open(data_dir.as_ref().join("chaindb"))?;
        Ok(Self { db })
    }

    /// Shared database handle, for collaborators that persist alongside
    /// blocks (account state)
    pub fn db(&self) -> Db {
        self.db.clone()
    }

    /// Persist a block and advance the tip marker
    pub fn put_block(&self, height: u64, block: &Block) -> Result<(), StoreError> {
        let value = block.encode()?;
        self.db.insert(block_key(height), value)?;
        self.db
            .insert(TIP_KEY, height.to_string().into_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self.db.get(block_key(height))? {
            Some(bytes) => Ok(Some(Block::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_block(&self, height: u64) -> Result<(), StoreError> {
        self.db.remove(block_key(height))?;
        self.db.flush()?;
        Ok(())
    }

    /// Highest persisted height, or None on a fresh store
    pub fn tip_height(&self) -> Result<Option<u64>, StoreError> {
        match self.db.get(TIP_KEY)? {
            Some(bytes) => {
                let s = std::str::from_utf8(&bytes)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let height = s
                    .parse::<u64>()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }

    /// Delete blocks below `tip - keep_n + 1`
    pub fn prune_blocks(&self, keep_n: u64, tip: u64) -> Result<(), StoreError> {
        let min_keep = if tip >= keep_n { tip - keep_n + 1 } else { 0 };
        for height in 0..min_keep {
            self.db.remove(block_key(height))?;
        }
        self.db.flush()?;
        Ok(())
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash;
    use num_bigint::BigInt;
    use tempfile::TempDir;

    fn sample_block(height: u64) -> Block {
        Block::new(
            height,
            Hash::from_bytes([height as u8; 32]),
            -5,
            vec![],
            BigInt::from(-1000i64),
            height,
        )
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();

        let block = sample_block(3);
        store.put_block(3, &block).unwrap();
        let loaded = store.get_block(3).unwrap().unwrap();
        assert_eq!(loaded, block);
    }

    #[test]
    fn test_missing_block_is_none() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        assert!(store.get_block(99).unwrap().is_none());
    }

    #[test]
    fn test_tip_tracks_latest_put() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();

        assert_eq!(store.tip_height().unwrap(), None);
        store.put_block(0, &sample_block(0)).unwrap();
        store.put_block(1, &sample_block(1)).unwrap();
        assert_eq!(store.tip_height().unwrap(), Some(1));
    }

    #[test]
    fn test_delete_block() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        store.put_block(0, &sample_block(0)).unwrap();
        store.delete_block(0).unwrap();
        assert!(store.get_block(0).unwrap().is_none());
    }

    #[test]
    fn test_prune_keeps_recent_window() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        for h in 0..10 {
            store.put_block(h, &sample_block(h)).unwrap();
        }
        // keep the last 3 heights of a tip at 9: 7, 8, 9 survive
        store.prune_blocks(3, 9).unwrap();
        for h in 0..7 {
            assert!(store.get_block(h).unwrap().is_none(), "height {h} kept");
        }
        for h in 7..10 {
            assert!(store.get_block(h).unwrap().is_some(), "height {h} pruned");
        }
    }

    #[test]
    fn test_reopen_preserves_blocks() {
        let dir = TempDir::new().unwrap();
        {
            let store = BlockStore::open(dir.path()).unwrap();
            store.put_block(5, &sample_block(5)).unwrap();
            store.close().unwrap();
        }
        let store = BlockStore::open(dir.path()).unwrap();
        assert_eq!(store.tip_height().unwrap(), Some(5));
        assert!(store.get_block(5).unwrap().is_some());
    }
}
