//! Chain manager
//!
//! Owns the canonical chain and every buffer a block can transit on its way
//! there: the orphan pool (parent unknown), side branches (known fork point,
//! not canonical), and the main chain itself. Imports are serialized through
//! a single writer lock; the orphan pool has its own lock so gossip threads
//! can append without blocking readers, and the two are never held together.

use num_bigint::BigInt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::consensus::{
    self, bits_missing, merkle_root, unix_time, Block, ChainReader, DifficultyError, Header,
};
use crate::crypto::Hash;
use crate::storage::{BlockStore, StoreError};
use crate::ChainConfig;

/// Callback capability the chain holds for requesting missing ancestry from
/// peers. Injected after construction; the chain never sees the peer object.
pub type RequestBlockFn = Arc<dyn Fn(Hash) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block at height {0} already exists")]
    Duplicate(u64),
    #[error("parent {0} unknown, block queued in orphan pool")]
    OrphanQueued(Hash),
    #[error("block at height {0} routed to a side branch")]
    SideBranched(u64),
    #[error("recomputed hash disagrees with encoded hash at height {0}")]
    HashMismatch(u64),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Difficulty(#[from] DifficultyError),
}

/// State behind the single writer lock
struct ChainInner {
    /// Canonical main chain
    by_height: HashMap<u64, Arc<Block>>,
    /// Fast ancestry lookup across main chain and imported branches
    by_hash: HashMap<Hash, Arc<Block>>,
    head: u64,
    /// Candidate branches keyed by fork parent hash, blocks in ascending
    /// height order
    side_branches: HashMap<Hash, Vec<Arc<Block>>>,
}

pub struct Chain {
    inner: RwLock<ChainInner>,
    /// Blocks whose parent is unknown, keyed by the missing parent hash.
    /// Separate lock: never held together with the chain lock.
    orphans: Mutex<HashMap<Hash, Vec<Block>>>,
    store: BlockStore,
    config: Arc<ChainConfig>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
    /// Single-flight guard for orphan promotion
    promoting: AtomicBool,
    request_block: RwLock<Option<RequestBlockFn>>,
}

impl Chain {
    /// Open the chain: rebuild indexes from the store, creating genesis on a
    /// fresh data dir.
    pub fn open(store: BlockStore, config: Arc<ChainConfig>) -> Result<Self, ChainError> {
        let chain = Self {
            inner: RwLock::new(ChainInner {
                by_height: HashMap::new(),
                by_hash: HashMap::new(),
                head: 0,
                side_branches: HashMap::new(),
            }),
            orphans: Mutex::new(HashMap::new()),
            store,
            config,
            subscribers: Mutex::new(Vec::new()),
            promoting: AtomicBool::new(false),
            request_block: RwLock::new(None),
        };
        chain.reindex_from_store()?;
        let empty = chain.inner.read().unwrap().by_height.is_empty();
        if empty {
            chain.create_genesis();
        }
        Ok(chain)
    }

    /// Inject the peer-request capability
    pub fn set_request_block(&self, f: RequestBlockFn) {
        *self.request_block.write().unwrap() = Some(f);
    }

    fn block_hash(&self, block: &Block) -> Hash {
        block.header.hash_with(self.config.full_header_hashing)
    }

    /// Rebuild the in-memory indexes from persisted blocks. A missing tip
    /// marker means a fresh store; anything else propagates, since a node
    /// that cannot read its own history must not serve peers.
    pub fn reindex_from_store(&self) -> Result<(), ChainError> {
        let mut inner = self.inner.write().unwrap();
        inner.by_height.clear();
        inner.by_hash.clear();
        inner.head = 0;

        let Some(tip) = self.store.tip_height()? else {
            debug!("no persisted tip, starting from an empty chain");
            return Ok(());
        };
        let mut loaded = 0u64;
        for height in 0..=tip {
            match self.store.get_block(height) {
                Ok(Some(block)) => {
                    let hash = self.block_hash(&block);
                    let block = Arc::new(block);
                    inner.by_height.insert(height, Arc::clone(&block));
                    inner.by_hash.insert(hash, block);
                    if height > inner.head {
                        inner.head = height;
                    }
                    loaded += 1;
                }
                Ok(None) => {} // pruned
                Err(e) => warn!(height, error = %e, "skipping unreadable block"),
            }
        }
        info!(head = inner.head, loaded, "reindexed chain from store");
        Ok(())
    }

    /// Emit the fixed genesis payload on a fresh store
    fn create_genesis(&self) {
        let genesis = Block {
            header: Header {
                height: 0,
                parent_hash: Hash::zero(),
                loss_claim: 0,
                bits: self.config.initial_target.clone(),
                timestamp: unix_time(),
                state_root: Hash::zero(),
                nonce: 0,
            },
            transactions: Vec::new(),
            merkle_root: Vec::new(),
            time: unix_time(),
            receipts: Vec::new(),
        };
        let hash = self.block_hash(&genesis);
        let genesis = Arc::new(genesis);
        {
            let mut inner = self.inner.write().unwrap();
            inner.by_height.insert(0, Arc::clone(&genesis));
            inner.by_hash.insert(hash, Arc::clone(&genesis));
            inner.head = 0;
        }
        if let Err(e) = self.store.put_block(0, &genesis) {
            error!(error = %e, "failed to persist genesis block");
        }
        info!(target = %self.config.initial_target, "created genesis block");
    }

    /// Import a block into the chain.
    ///
    /// Exactly one of: accepted onto the main chain (Ok), judged duplicate,
    /// buffered as an orphan, routed to a side branch, or rejected for an
    /// integrity mismatch. A competing block that completes a longer branch
    /// returns Ok after the reorg it triggers.
    pub fn import(&self, block: Block) -> Result<(), ChainError> {
        let mut block = block;
        let height = block.header.height;
        let incoming_hash = self.block_hash(&block);

        let mut inner = self.inner.write().unwrap();
        let prev_head = inner.head;

        // Competing block at an occupied height: candidate for a branch
        if let Some(existing) = inner.by_height.get(&height) {
            let head_hash = inner
                .by_height
                .get(&inner.head)
                .map(|b| self.block_hash(b))
                .unwrap_or_default();
            if self.block_hash(existing) != incoming_hash
                && block.header.parent_hash != head_hash
            {
                debug!(height, hash = %incoming_hash.short(), "competing block, routing to side branch");
                self.route_side_branch(&mut inner, block);
                self.check_reorg(&mut inner);
                let head_changed = inner.head != prev_head;
                drop(inner);
                if head_changed {
                    self.notify_head();
                }
                return Ok(());
            }
            return Err(ChainError::Duplicate(height));
        }

        // Parent lookup across main chain and imported branches
        let parent = match inner.by_hash.get(&block.header.parent_hash) {
            Some(p) => Arc::clone(p),
            None => {
                let parent_hash = block.header.parent_hash;
                drop(inner);
                self.queue_orphan(block);
                return Err(ChainError::OrphanQueued(parent_hash));
            }
        };

        if parent.header.height + 1 != height {
            debug!(
                height,
                parent_height = parent.header.height,
                "parent at wrong height, routing to side branch"
            );
            self.route_side_branch(&mut inner, block);
            self.check_reorg(&mut inner);
            let head_changed = inner.head != prev_head;
            drop(inner);
            if head_changed {
                self.notify_head();
            }
            return Err(ChainError::SideBranched(height));
        }

        // Parent known but not canonical at its height: the block extends a
        // side branch, not the main chain
        let parent_canonical = inner
            .by_height
            .get(&parent.header.height)
            .map(|b| self.block_hash(b) == block.header.parent_hash)
            .unwrap_or(false);
        if !parent_canonical {
            debug!(height, "parent off the main chain, routing to side branch");
            self.route_side_branch(&mut inner, block);
            self.check_reorg(&mut inner);
            let head_changed = inner.head != prev_head;
            drop(inner);
            if head_changed {
                self.notify_head();
            }
            return Err(ChainError::SideBranched(height));
        }

        // Integrity: the encoded merkle root must match the transactions
        if merkle_root(&block.transactions) != block.merkle_root {
            return Err(ChainError::HashMismatch(height));
        }

        // Difficulty: retarget boundaries recompute bits, everything else
        // inherits the parent's. The chain lock is released around the
        // adjustment, which re-enters through the reader.
        if consensus::is_retarget_boundary(height, &self.config) {
            // scale from the canonical inherited target, not whatever the
            // wire block claimed
            block.header.bits = parent.header.bits.clone();
            drop(inner);
            match consensus::adjust(self, &block.header, &self.config) {
                Ok(bits) => {
                    info!(height, bits = %bits, "difficulty retarget");
                    block.header.bits = bits;
                }
                Err(e) => {
                    // Recoverable: keep the inherited target
                    warn!(height, error = %e, "difficulty adjustment failed, keeping parent bits");
                    block.header.bits = parent.header.bits.clone();
                }
            }
            inner = self.inner.write().unwrap();
        } else {
            block.header.bits = parent.header.bits.clone();
        }

        // Accept
        let hash = self.block_hash(&block);
        let loss = block.header.loss_claim;
        let block = Arc::new(block);
        inner.by_height.insert(height, Arc::clone(&block));
        inner.by_hash.insert(hash, Arc::clone(&block));
        inner.head = height;

        // Persistence failures do not roll back the in-memory chain: the
        // node stays available and reconciles on the next reindex.
        if let Err(e) = self.store.put_block(height, &block) {
            error!(height, error = %e, "failed to persist block");
        }
        if self.config.prune_depth > 0 {
            if let Err(e) = self.store.prune_blocks(self.config.prune_depth, inner.head) {
                warn!(error = %e, "prune failed");
            }
        }
        info!(height, loss, hash = %hash.short(), "accepted block");

        self.check_reorg(&mut inner);
        drop(inner);

        self.notify_head();
        self.try_import_orphans(hash);
        Ok(())
    }

    /// Buffer a block whose parent is unknown and ask peers for the parent.
    /// Holds only the orphan lock; the request callback runs outside it.
    fn queue_orphan(&self, block: Block) {
        let parent_hash = block.header.parent_hash;
        let height = block.header.height;
        {
            let mut orphans = self.orphans.lock().unwrap();
            let entry = orphans.entry(parent_hash).or_default();
            let hash = self.block_hash(&block);
            if entry.iter().any(|b| self.block_hash(b) == hash) {
                return;
            }
            entry.push(block);
        }
        info!(height, parent = %parent_hash.short(), "queued orphan block");

        let callback = self.request_block.read().unwrap().clone();
        if let Some(request) = callback {
            request(parent_hash);
        }
    }

    /// Append a block to the side branch it extends, or open a new branch at
    /// its fork point. Branch blocks are hash-indexed so descendants can find
    /// them.
    fn route_side_branch(&self, inner: &mut ChainInner, block: Block) {
        let hash = self.block_hash(&block);
        let already_branched = inner
            .side_branches
            .values()
            .flatten()
            .any(|b| self.block_hash(b) == hash);
        if already_branched {
            return;
        }

        let block = Arc::new(block);
        inner.by_hash.insert(hash, Arc::clone(&block));

        let extends = inner
            .side_branches
            .iter()
            .find(|(_, branch)| {
                branch
                    .last()
                    .map(|tip| self.block_hash(tip) == block.header.parent_hash)
                    .unwrap_or(false)
            })
            .map(|(fork, _)| *fork);

        match extends {
            Some(fork) => {
                let branch = inner.side_branches.get_mut(&fork).unwrap();
                branch.push(Arc::clone(&block));
                debug!(
                    height = block.header.height,
                    fork = %fork.short(),
                    len = branch.len(),
                    "extended side branch"
                );
            }
            None => {
                use std::collections::hash_map::Entry;
                match inner.side_branches.entry(block.header.parent_hash) {
                    Entry::Vacant(slot) => {
                        slot.insert(vec![Arc::clone(&block)]);
                        debug!(
                            height = block.header.height,
                            fork = %block.header.parent_hash.short(),
                            "opened side branch"
                        );
                    }
                    Entry::Occupied(mut slot) => {
                        // sibling fork at an occupied fork point: keep the
                        // candidate with the higher tip
                        let existing_tip =
                            slot.get().last().map(|b| b.header.height).unwrap_or(0);
                        if block.header.height > existing_tip {
                            slot.insert(vec![Arc::clone(&block)]);
                        } else {
                            debug!(
                                height = block.header.height,
                                "sibling fork discarded, existing branch is ahead"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Promote any branch that outgrew the main chain
    fn check_reorg(&self, inner: &mut ChainInner) {
        let head = inner.head;
        let winners: Vec<Hash> = inner
            .side_branches
            .iter()
            .filter(|(_, branch)| {
                branch
                    .last()
                    .map(|tip| tip.header.height > head)
                    .unwrap_or(false)
            })
            .map(|(fork, _)| *fork)
            .collect();

        for fork in winners {
            if let Some(branch) = inner.side_branches.remove(&fork) {
                self.reorg_to_branch(inner, branch);
            }
        }
    }

    /// Roll the head back to the fork point and apply the branch in ascending
    /// order. Superseded main-chain blocks stay reachable through by_hash.
    fn reorg_to_branch(&self, inner: &mut ChainInner, branch: Vec<Arc<Block>>) {
        let fork_height = branch[0].header.height - 1;
        info!(
            fork_height,
            new_tip = branch.last().map(|b| b.header.height).unwrap_or(fork_height),
            "reorganizing to longer branch"
        );
        inner.head = fork_height;
        for block in branch {
            let height = block.header.height;
            let hash = self.block_hash(&block);
            inner.by_height.insert(height, Arc::clone(&block));
            inner.by_hash.insert(hash, Arc::clone(&block));
            inner.head = height;
            if let Err(e) = self.store.put_block(height, &block) {
                error!(height, error = %e, "failed to persist block during reorg");
            }
        }
        info!(head = inner.head, "reorg complete");
    }

    /// Drain orphans now connected to the chain. Single-flight: a worklist
    /// walks newly-imported hashes instead of recursing, so a long orphan
    /// chain promotes in one pass.
    fn try_import_orphans(&self, parent_hash: Hash) {
        if self
            .promoting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut work = vec![parent_hash];
        while let Some(hash) = work.pop() {
            let Some(orphans) = self.orphans.lock().unwrap().remove(&hash) else {
                continue;
            };
            for orphan in orphans {
                let height = orphan.header.height;
                let parent = {
                    let inner = self.inner.read().unwrap();
                    inner.by_hash.get(&orphan.header.parent_hash).cloned()
                };
                match parent {
                    Some(p) if p.header.height + 1 == height => {
                        let orphan_hash = self.block_hash(&orphan);
                        match self.import(orphan) {
                            Ok(()) => {
                                info!(height, "promoted orphan block");
                                work.push(orphan_hash);
                            }
                            Err(e) => debug!(height, error = %e, "orphan promotion rejected"),
                        }
                    }
                    Some(_) => {
                        let mut inner = self.inner.write().unwrap();
                        self.route_side_branch(&mut inner, orphan);
                        self.check_reorg(&mut inner);
                    }
                    None => debug!(height, "orphan parent vanished, dropping"),
                }
            }
        }

        self.promoting.store(false, Ordering::SeqCst);
    }

    /// Periodic sweep: drain orphans whose parents arrived out of band.
    /// Orphans whose parent is still unknown are requeued.
    pub fn scan_orphans(&self) {
        let drained: Vec<(Hash, Vec<Block>)> = {
            let mut orphans = self.orphans.lock().unwrap();
            orphans.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        debug!(parents = drained.len(), "scanning orphan pool");

        for (parent_hash, blocks) in drained {
            for orphan in blocks {
                let height = orphan.header.height;
                let parent = {
                    let inner = self.inner.read().unwrap();
                    inner.by_hash.get(&parent_hash).cloned()
                };
                match parent {
                    Some(p) if p.header.height + 1 == height => {
                        if let Err(e) = self.import(orphan) {
                            debug!(height, error = %e, "orphan import during scan rejected");
                        }
                    }
                    Some(_) => {
                        let mut inner = self.inner.write().unwrap();
                        self.route_side_branch(&mut inner, orphan);
                        self.check_reorg(&mut inner);
                    }
                    None => {
                        self.orphans
                            .lock()
                            .unwrap()
                            .entry(parent_hash)
                            .or_default()
                            .push(orphan);
                    }
                }
            }
        }
    }

    /// Register a head-change sink: capacity 1, coalescing. A slow
    /// subscriber sees at most one wake per drain and re-reads `height()`
    /// for the final state.
    pub fn subscribe_head(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn notify_head(&self) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        });
    }

    /// Canonical block at the given height (in-memory view)
    pub fn block_at(&self, height: u64) -> Option<Arc<Block>> {
        self.inner.read().unwrap().by_height.get(&height).cloned()
    }

    /// Block by hash, across main chain and imported branches
    pub fn block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.inner.read().unwrap().by_hash.get(hash).cloned()
    }

    /// Hash of the current head block
    pub fn head_hash(&self) -> Hash {
        let inner = self.inner.read().unwrap();
        inner
            .by_height
            .get(&inner.head)
            .map(|b| self.block_hash(b))
            .unwrap_or_default()
    }

    /// Height the orphan waiting on this parent claims, if any
    pub fn orphan_height_for_parent(&self, parent_hash: &Hash) -> Option<u64> {
        self.orphans
            .lock()
            .unwrap()
            .get(parent_hash)
            .and_then(|blocks| blocks.first())
            .map(|b| b.header.height)
    }

    /// Number of parents the orphan pool is waiting on
    pub fn orphan_parents(&self) -> usize {
        self.orphans.lock().unwrap().len()
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

impl ChainReader for Chain {
    /// Canonical header, falling back to the store for heights evicted from
    /// memory. Persisted headers always carry a usable target: a zero `bits`
    /// is repaired to the configured initial target before the header is
    /// handed out.
    fn header_at(&self, height: u64) -> Option<Header> {
        let cached = {
            let inner = self.inner.read().unwrap();
            inner.by_height.get(&height).map(|b| b.header.clone())
        };
        let mut header = match cached {
            Some(h) => h,
            None => match self.store.get_block(height) {
                Ok(Some(block)) => {
                    let header = block.header.clone();
                    let hash = self.block_hash(&block);
                    let block = Arc::new(block);
                    let mut inner = self.inner.write().unwrap();
                    inner
                        .by_height
                        .entry(height)
                        .or_insert_with(|| Arc::clone(&block));
                    inner.by_hash.entry(hash).or_insert(block);
                    header
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(height, error = %e, "header load failed");
                    return None;
                }
            },
        };
        if bits_missing(&header.bits) {
            header.bits = self.config.initial_target.clone();
        }
        Some(header)
    }

    fn height(&self) -> u64 {
        self.inner.read().unwrap().head
    }
}

/// Convenience for tests and the miner: a child block carrying the parent's
/// bits, an empty body and the given nonce.
pub fn child_block(parent: &Header, parent_hash: Hash, loss: i64, nonce: u64) -> Block {
    Block::new(
        parent.height + 1,
        parent_hash,
        loss,
        Vec::new(),
        parent.bits.clone(),
        nonce,
    )
}

/// Bits value used by tests that need an explicit target
pub fn target(value: i64) -> BigInt {
    BigInt::from(value)
}
