//! Daemon assembly
//!
//! Wires the chain, sync engine, miner, file-drop importer and background
//! sweeps into one running node. Startup order matters: store, reindex,
//! genesis, networking, then mining. Only startup I/O failures are fatal;
//! everything after boot logs and keeps running.

use num_bigint::BigInt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::chain::Chain;
use crate::consensus::ChainReader;
use crate::inference::{InferenceEngine, StubLlm};
use crate::mining::Miner;
use crate::p2p::{FileDropImporter, GossipTransport, LocalHub, SyncService};
use crate::storage::{AccountState, BlockStore, Mempool};
use crate::ChainConfig;

const ORPHAN_SCAN_INTERVAL: Duration = Duration::from_secs(30);
const MEMPOOL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the daemon needs, assembled from CLI flags
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub chain: ChainConfig,
    pub cli_target: BigInt,
    pub model_path: String,
    pub gpu_layers: u32,
    pub miner_address: Vec<u8>,
    pub p2p_port: u16,
    pub peer_multiaddr: Option<String>,
}

/// Run the node until the shutdown signal fires (ctrl-c).
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    // silence inference backend logs before any model loads
    std::env::set_var("GGML_LOG_LEVEL", "0");

    info!(
        data_dir = %config.data_dir.display(),
        target = %config.cli_target,
        prune_depth = config.chain.prune_depth,
        epoch_blocks = config.chain.epoch_blocks,
        batch_size = config.chain.batch_size,
        "starting poai daemon"
    );
    info!("durability note: block writes that fail after acceptance are logged and reconciled at next reindex");

    // fatal startup I/O: store, chain, model
    let store = BlockStore::open(&config.data_dir)?;
    let db = store.db();
    let chain_config = Arc::new(config.chain.clone());
    let chain = Arc::new(Chain::open(store, Arc::clone(&chain_config))?);
    let state = AccountState::new(db);
    let mempool = Arc::new(Mempool::new(state));
    let llm: Arc<dyn InferenceEngine> =
        Arc::new(StubLlm::new(&config.model_path, config.gpu_layers)?);
    info!(model = %config.model_path, gpu_layers = config.gpu_layers, "inference engine ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // gossip: the in-process hub serves single-host deployments; an external
    // transport mounts through the same trait
    let hub = LocalHub::new();
    let transport: Arc<dyn GossipTransport> = Arc::new(hub.join());
    info!(p2p_port = config.p2p_port, "gossip transport ready");
    if let Some(peer) = &config.peer_multiaddr {
        warn!(peer = %peer, "external peer dialing requires an external transport; ignoring");
    }
    let sync = SyncService::start(
        Arc::clone(&chain),
        transport,
        Some(Arc::clone(&llm)),
        shutdown_rx.clone(),
    );

    // the chain requests missing ancestry through the sync engine
    {
        let sync = Arc::clone(&sync);
        chain.set_request_block(Arc::new(move |hash| sync.request_block_by_hash(hash)));
    }

    // head announcer: one task reading the coalescing subscription
    {
        let chain = Arc::clone(&chain);
        let sync = Arc::clone(&sync);
        let mut head_rx = chain.subscribe_head();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut last_announced = 0u64;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { break; }
                    }
                    notify = head_rx.recv() => {
                        if notify.is_none() { break; }
                        let head = chain.height();
                        if head == last_announced {
                            continue;
                        }
                        last_announced = head;
                        if let Some(block) = chain.block_at(head) {
                            sync.announce_head(&block);
                        }
                    }
                }
            }
        });
    }

    // periodic orphan pool scan
    {
        let chain = Arc::clone(&chain);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ORPHAN_SCAN_INTERVAL);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { break; }
                    }
                    _ = ticker.tick() => chain.scan_orphans(),
                }
            }
        });
    }

    // periodic mempool sweep
    {
        let mempool = Arc::clone(&mempool);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MEMPOOL_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { break; }
                    }
                    _ = ticker.tick() => mempool.cleanup(),
                }
            }
        });
    }

    // secondary block ingress from the drop directory
    let importer = FileDropImporter::new(config.data_dir.join("blocks"), Arc::clone(&chain));
    tokio::spawn(importer.run(shutdown_rx.clone()));

    // miner on its own thread: minted blocks go to gossip and the drop dir
    let miner = {
        let sync = Arc::clone(&sync);
        let blocks_dir = config.data_dir.join("blocks");
        let publish = Arc::new(move |block: &crate::consensus::Block| {
            sync.publish_block(block);
            if let Err(e) = crate::p2p::write_block(&blocks_dir, block) {
                warn!(error = %e, "failed to drop block file");
            }
        });
        Arc::new(Miner::new(
            Arc::clone(&chain),
            chain_config,
            llm,
            Arc::clone(&mempool),
            config.miner_address.clone(),
            config.cli_target.clone(),
            publish,
        ))
    };
    let miner_handle = {
        let miner = Arc::clone(&miner);
        let mut head_rx = chain.subscribe_head();
        tokio::task::spawn_blocking(move || miner.run(&mut head_rx))
    };

    info!(height = chain.height(), "node running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    miner.stop();
    let _ = shutdown_tx.send(true);
    let _ = miner_handle.await;
    Ok(())
}
