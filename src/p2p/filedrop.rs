//! On-disk block ingress
//!
//! A secondary path for moving blocks between processes sharing a
//! filesystem: blocks are dropped as `block_<height>_<nanos>.json` files in
//! `<data-dir>/blocks/` and polled at 100 ms. Each file is parsed and
//! imported exactly once, tracked by filename, and removed once its block is
//! accepted.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::chain::{Chain, ChainError};
use crate::consensus::Block;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drop a block into the directory for other local processes to pick up
pub fn write_block(dir: &Path, block: &Block) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let path = dir.join(format!("block_{}_{}.json", block.header.height, nanos));
    let data = block
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(&path, data)?;
    Ok(path)
}

pub struct FileDropImporter {
    dir: PathBuf,
    chain: Arc<Chain>,
    processed: Mutex<HashSet<String>>,
}

impl FileDropImporter {
    pub fn new(dir: PathBuf, chain: Arc<Chain>) -> Self {
        Self {
            dir,
            chain,
            processed: Mutex::new(HashSet::new()),
        }
    }

    /// Poll the drop directory until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.sweep(),
            }
        }
        debug!("file-drop importer stopped");
    }

    /// One pass over the directory
    pub fn sweep(&self) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return, // directory may not exist yet
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") {
                continue;
            }
            {
                let mut processed = self.processed.lock().unwrap();
                if !processed.insert(name.clone()) {
                    continue;
                }
            }

            let path = entry.path();
            let Ok(data) = fs::read(&path) else { continue };
            let block = match Block::decode(&data) {
                Ok(block) => block,
                Err(e) => {
                    warn!(file = %name, error = %e, "removing undecodable block file");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };

            let height = block.header.height;
            match self.chain.import(block) {
                Ok(()) => {
                    debug!(height, file = %name, "imported dropped block");
                    let _ = fs::remove_file(&path);
                }
                // the chain already holds it (e.g. this process minted it)
                Err(ChainError::Duplicate(_)) => {
                    let _ = fs::remove_file(&path);
                }
                Err(e) => debug!(height, error = %e, "dropped block not imported"),
            }
        }
    }
}
