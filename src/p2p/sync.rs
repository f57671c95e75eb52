//! Sync engine
//!
//! Listens on the three sync topics and drives the chain import pipeline
//! from peer traffic. The transport is a capability: anything that can
//! publish and subscribe topic-addressed byte payloads works, and an
//! in-process hub backs tests and single-host clusters.
//!
//! One long-running task per subscription, all stopped through a shared
//! shutdown watch. Publish is fire-and-forget; a failed publish is logged,
//! never retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::chain::Chain;
use crate::consensus::{Block, ChainReader};
use crate::constants::{MAX_BLOCKS_PER_RESPONSE, MAX_WIRE_BLOCK, ORPHAN_FETCH_WINDOW};
use crate::crypto::Hash;
use crate::inference::InferenceEngine;
use crate::p2p::{BlockRequest, BlockResponse, NewHead, TOPIC_BLOCK_REQ, TOPIC_BLOCK_RESP, TOPIC_NEW_HEAD};
use crate::validation::verify_block;

pub type PeerId = u64;

/// A topic-addressed payload with its origin
#[derive(Debug, Clone)]
pub struct GossipMessage {
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// Minimal gossip capability the sync engine needs
pub trait GossipTransport: Send + Sync {
    fn local_id(&self) -> PeerId;
    fn publish(&self, topic: &str, data: Vec<u8>);
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<GossipMessage>;
}

/// In-process gossip hub: every joined peer sees every published message,
/// including its own (handlers filter self-origin, as with real pubsub).
pub struct LocalHub {
    topics: Mutex<HashMap<String, broadcast::Sender<GossipMessage>>>,
    next_peer: AtomicU64,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        })
    }

    pub fn join(self: &Arc<Self>) -> LocalPeer {
        LocalPeer {
            hub: Arc::clone(self),
            id: self.next_peer.fetch_add(1, Ordering::SeqCst),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<GossipMessage> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

pub struct LocalPeer {
    hub: Arc<LocalHub>,
    id: PeerId,
}

impl GossipTransport for LocalPeer {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn publish(&self, topic: &str, data: Vec<u8>) {
        // send fails only when nobody subscribed yet; that is not an error
        let _ = self.hub.sender_for(topic).send(GossipMessage {
            from: self.id,
            data,
        });
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<GossipMessage> {
        self.hub.sender_for(topic).subscribe()
    }
}

pub struct SyncService {
    chain: Arc<Chain>,
    transport: Arc<dyn GossipTransport>,
    /// When present, every peer block replays through the validator before
    /// it may enter the chain
    verifier: Option<Arc<dyn InferenceEngine>>,
    /// Highest height any peer has announced
    best_known: AtomicU64,
}

impl SyncService {
    /// Spawn the three topic handlers and return the service handle
    pub fn start(
        chain: Arc<Chain>,
        transport: Arc<dyn GossipTransport>,
        verifier: Option<Arc<dyn InferenceEngine>>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            chain,
            transport,
            verifier,
            best_known: AtomicU64::new(0),
        });

        Self::spawn_handler(&service, TOPIC_NEW_HEAD, shutdown.clone(), Self::on_new_head);
        Self::spawn_handler(&service, TOPIC_BLOCK_REQ, shutdown.clone(), Self::on_block_req);
        Self::spawn_handler(&service, TOPIC_BLOCK_RESP, shutdown, Self::on_block_resp);

        service
    }

    fn spawn_handler(
        service: &Arc<Self>,
        topic: &'static str,
        mut shutdown: watch::Receiver<bool>,
        handler: fn(&SyncService, GossipMessage),
    ) {
        let service = Arc::clone(service);
        let mut rx = service.transport.subscribe(topic);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    msg = rx.recv() => match msg {
                        Ok(msg) => {
                            if msg.from == service.transport.local_id() {
                                continue;
                            }
                            handler(&service, msg);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic, skipped, "gossip receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(topic, "sync handler stopped");
        });
    }

    /// Announce the local tip after a head change
    pub fn announce_head(&self, block: &Block) {
        let msg = NewHead {
            height: block.header.height,
            hash: block.hash(),
            parent: block.header.parent_hash,
        };
        match serde_json::to_vec(&msg) {
            Ok(data) => {
                debug!(height = msg.height, hash = %msg.hash.short(), "announcing head");
                self.transport.publish(TOPIC_NEW_HEAD, data);
            }
            Err(e) => warn!(error = %e, "failed to encode head announcement"),
        }
    }

    /// Push a freshly minted block to peers: a single-block response that
    /// every peer's import path consumes directly.
    pub fn publish_block(&self, block: &Block) {
        match block.encode() {
            Ok(encoded) if encoded.len() > MAX_WIRE_BLOCK => {
                warn!(
                    height = block.header.height,
                    size = encoded.len(),
                    "refusing to publish oversized block"
                );
            }
            Ok(_) => {
                let resp = BlockResponse {
                    blocks: vec![block.clone()],
                };
                if let Ok(data) = serde_json::to_vec(&resp) {
                    self.transport.publish(TOPIC_BLOCK_RESP, data);
                }
            }
            Err(e) => warn!(error = %e, "failed to encode block for publish"),
        }
    }

    /// Bounded catch-up request for the ancestry of an orphan. This is the
    /// callback capability the chain holds.
    pub fn request_block_by_hash(&self, parent_hash: Hash) {
        if self.chain.block_by_hash(&parent_hash).is_some() {
            return;
        }
        let (from, to) = match self.chain.orphan_height_for_parent(&parent_hash) {
            Some(orphan_height) if orphan_height > 1 => (
                orphan_height.saturating_sub(ORPHAN_FETCH_WINDOW).max(1),
                orphan_height,
            ),
            _ => {
                // orphan already drained: fall back to a window behind the head
                let head = self.chain.height();
                (head.saturating_sub(ORPHAN_FETCH_WINDOW).max(1), head.max(1))
            }
        };
        info!(parent = %parent_hash.short(), from, to, "requesting missing ancestry");
        if let Ok(data) = serde_json::to_vec(&BlockRequest { from, to }) {
            self.transport.publish(TOPIC_BLOCK_REQ, data);
        }
    }

    pub fn best_known(&self) -> u64 {
        self.best_known.load(Ordering::SeqCst)
    }

    fn on_new_head(&self, msg: GossipMessage) {
        let Ok(head) = serde_json::from_slice::<NewHead>(&msg.data) else {
            debug!("undecodable newhead message");
            return;
        };
        if head.height == 0 {
            return;
        }
        self.best_known.fetch_max(head.height, Ordering::SeqCst);

        let local = self.chain.height();
        if head.height <= local {
            return;
        }
        info!(
            announced = head.height,
            local, "peer is ahead, requesting blocks"
        );
        let req = BlockRequest {
            from: local + 1,
            to: head.height,
        };
        if let Ok(data) = serde_json::to_vec(&req) {
            self.transport.publish(TOPIC_BLOCK_REQ, data);
        }
    }

    fn on_block_req(&self, msg: GossipMessage) {
        let Ok(mut req) = serde_json::from_slice::<BlockRequest>(&msg.data) else {
            debug!("undecodable block request");
            return;
        };
        if req.to.saturating_sub(req.from) > MAX_BLOCKS_PER_RESPONSE {
            req.to = req.from + MAX_BLOCKS_PER_RESPONSE;
        }
        let mut blocks = Vec::new();
        for height in req.from..=req.to {
            if let Some(block) = self.chain.block_at(height) {
                blocks.push((*block).clone());
            }
        }
        if blocks.is_empty() {
            return;
        }
        debug!(from = req.from, to = req.to, served = blocks.len(), "serving block request");
        if let Ok(data) = serde_json::to_vec(&BlockResponse { blocks }) {
            self.transport.publish(TOPIC_BLOCK_RESP, data);
        }
    }

    fn on_block_resp(&self, msg: GossipMessage) {
        let Ok(resp) = serde_json::from_slice::<BlockResponse>(&msg.data) else {
            debug!("undecodable block response");
            return;
        };
        for block in resp.blocks {
            let height = block.header.height;
            match block.encode() {
                Ok(encoded) if encoded.len() > MAX_WIRE_BLOCK => {
                    warn!(height, size = encoded.len(), "dropping oversized block");
                    continue;
                }
                Err(e) => {
                    warn!(height, error = %e, "dropping unencodable block");
                    continue;
                }
                Ok(_) => {}
            }
            if let Some(llm) = &self.verifier {
                if let Err(e) = verify_block(&block, self.chain.as_ref(), llm.as_ref()) {
                    warn!(height, error = %e, "peer block failed replay verification");
                    continue;
                }
            }
            if let Err(e) = self.chain.import(block) {
                debug!(height, error = %e, "peer block not imported");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::child_block;
    use crate::storage::BlockStore;
    use crate::ChainConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_chain() -> (TempDir, Arc<Chain>) {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let chain = Chain::open(store, Arc::new(ChainConfig::default())).unwrap();
        (dir, Arc::new(chain))
    }

    fn extend_chain(chain: &Chain, count: u64) {
        for _ in 0..count {
            let parent = chain.header_at(chain.height()).unwrap();
            let hash = parent.hash();
            chain
                .import(child_block(&parent, hash, -3, parent.height))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_lagging_peer_catches_up_on_announcement() {
        let hub = LocalHub::new();
        let (_dir_a, chain_a) = open_chain();
        let (_dir_b, chain_b) = open_chain();
        extend_chain(&chain_a, 3);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let svc_a = SyncService::start(
            Arc::clone(&chain_a),
            Arc::new(hub.join()),
            None,
            shutdown_rx.clone(),
        );
        let _svc_b = SyncService::start(
            Arc::clone(&chain_b),
            Arc::new(hub.join()),
            None,
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        // both nodes share the genesis hash (the preimage excludes the
        // timestamp), so B can adopt A's blocks 1..=3 after the announcement
        svc_a.announce_head(&chain_a.block_at(3).unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(chain_b.height(), 3);
        for h in 1..=3 {
            assert_eq!(
                chain_b.block_at(h).unwrap().hash(),
                chain_a.block_at(h).unwrap().hash()
            );
        }
    }

    #[tokio::test]
    async fn test_best_known_tracks_announcements() {
        let hub = LocalHub::new();
        let (_dir_a, chain_a) = open_chain();
        let (_dir_b, chain_b) = open_chain();
        extend_chain(&chain_a, 2);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let svc_a = SyncService::start(
            chain_a.clone(),
            Arc::new(hub.join()),
            None,
            shutdown_rx.clone(),
        );
        let svc_b = SyncService::start(chain_b, Arc::new(hub.join()), None, shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        svc_a.announce_head(&chain_a.block_at(2).unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(svc_b.best_known(), 2);
        // self-origin announcements are ignored
        assert_eq!(svc_a.best_known(), 0);
    }

    #[tokio::test]
    async fn test_orphan_request_is_bounded() {
        let hub = LocalHub::new();
        let (_dir, chain) = open_chain();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = hub.join();
        let mut req_rx = peer.subscribe(TOPIC_BLOCK_REQ);
        let svc = SyncService::start(chain.clone(), Arc::new(hub.join()), None, shutdown_rx);

        // an orphan far up the chain requests a bounded window below itself
        let genesis = chain.header_at(0).unwrap();
        let mut fake_parent = genesis.clone();
        fake_parent.height = 499;
        fake_parent.nonce = 999;
        let orphan = child_block(&fake_parent, fake_parent.hash(), -1, 1000);
        let missing = orphan.header.parent_hash;
        let _ = chain.import(orphan);

        svc.request_block_by_hash(missing);
        let msg = req_rx.recv().await.unwrap();
        let req: BlockRequest = serde_json::from_slice(&msg.data).unwrap();
        assert_eq!(req.to, 500);
        assert_eq!(req.from, 400);
    }
}
