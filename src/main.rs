//! poaid - Proof-of-AI blockchain daemon and wallet CLI

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use num_bigint::{BigInt, BigUint};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use poai_core::node::{self, NodeConfig};
use poai_core::storage::{AccountState, BlockStore};
use poai_core::validation::Transaction;
use poai_core::wallet::{save_key_files, Keypair};
use poai_core::ChainConfig;

#[derive(Parser)]
#[command(name = "poaid", version, about = "Proof-of-AI blockchain node")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    daemon: DaemonArgs,
}

#[derive(Args)]
struct DaemonArgs {
    /// Mining difficulty target (more negative = harder)
    #[arg(long, default_value_t = poai_core::constants::DEFAULT_TARGET)]
    target: i64,

    /// Blocks per epoch
    #[arg(long, default_value_t = 20)]
    epoch_blocks: u64,

    /// Records per inference batch
    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Directory for chain data
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Blocks to keep (0 = keep all, disables pruning)
    #[arg(long, default_value_t = 0)]
    prune_depth: u64,

    /// P2P listen port
    #[arg(long, default_value_t = 4001)]
    p2p_port: u16,

    /// Multiaddr of a peer to connect to
    #[arg(long)]
    peer_multiaddr: Option<String>,

    /// Path to the GGUF model file
    #[arg(long, default_value = "models/qwen2.5-0.5b-instruct-q4k.gguf")]
    model_path: String,

    /// Model layers to offload to GPU (0 = CPU only)
    #[arg(long, default_value_t = 0)]
    gpu_layers: u32,

    /// Miner address (hex) for block rewards
    #[arg(long)]
    miner_address: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new keypair
    GenerateKey {
        /// Save the keys to files
        #[arg(long)]
        save: bool,
        /// Directory to save key files into
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Check the balance of an address
    Balance {
        /// Address to query (hex)
        #[arg(long)]
        addr: String,
        /// Data directory containing the chain state
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Create and sign a value transfer
    Send {
        /// Recipient address (hex)
        #[arg(long)]
        to: String,
        /// Amount to send
        #[arg(long)]
        amount: String,
        /// Sender private key (hex)
        #[arg(long)]
        privkey: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::GenerateKey { save, output_dir }) => generate_key(save, &output_dir),
        Some(Command::Balance { addr, data_dir }) => balance(&addr, &data_dir),
        Some(Command::Send { to, amount, privkey }) => send(&to, &amount, &privkey),
        None => daemon(cli.daemon),
    }
}

fn daemon(args: DaemonArgs) -> ExitCode {
    let miner_address = match &args.miner_address {
        Some(hex) => match hex::decode(hex) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("invalid --miner-address: {e}");
                return ExitCode::from(1);
            }
        },
        None => {
            // an ephemeral key keeps a bare node mining; rewards are lost
            let keypair = Keypair::generate();
            eprintln!(
                "no --miner-address given, mining to ephemeral address {}",
                keypair.address_hex()
            );
            keypair.address()
        }
    };

    let config = NodeConfig {
        data_dir: args.data_dir,
        chain: ChainConfig {
            initial_target: BigInt::from(args.target),
            prune_depth: args.prune_depth,
            epoch_blocks: args.epoch_blocks,
            batch_size: args.batch_size,
            ..ChainConfig::default()
        },
        cli_target: BigInt::from(args.target),
        model_path: args.model_path,
        gpu_layers: args.gpu_layers,
        miner_address,
        p2p_port: args.p2p_port,
        peer_multiaddr: args.peer_multiaddr,
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(node::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn generate_key(save: bool, output_dir: &PathBuf) -> ExitCode {
    let keypair = Keypair::generate();
    println!("Generated new keypair");
    println!("Private key: {}", keypair.private_key_hex());
    println!("Public key:  {}", keypair.public_key_hex());
    println!("Address:     {}", keypair.address_hex());

    if save {
        match save_key_files(output_dir, &keypair) {
            Ok((key_path, addr_path)) => {
                println!("Saved private key to {}", key_path.display());
                println!("Saved address to {}", addr_path.display());
            }
            Err(e) => {
                eprintln!("failed to save key files: {e}");
                return ExitCode::from(2);
            }
        }
    }
    println!(
        "Ready to mine: poaid --miner-address={}",
        keypair.address_hex()
    );
    ExitCode::SUCCESS
}

fn balance(addr: &str, data_dir: &PathBuf) -> ExitCode {
    let addr_bytes = match hex::decode(addr) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("invalid address: {e}");
            return ExitCode::from(1);
        }
    };
    let store = match BlockStore::open(data_dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("cannot open store (is a node running on this data dir?): {e}");
            return ExitCode::from(1);
        }
    };
    let state = AccountState::new(store.db());
    println!("Balance for {addr}: {} POAI", state.balance(&addr_bytes));
    ExitCode::SUCCESS
}

fn send(to: &str, amount: &str, privkey: &str) -> ExitCode {
    let result = (|| -> anyhow::Result<Transaction> {
        let keypair = Keypair::from_hex(privkey)
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid private key")?;
        let to_bytes = hex::decode(to).context("invalid recipient address")?;
        let amount = BigUint::from_str(amount).context("invalid amount")?;

        let mut tx = Transaction::transfer(keypair.address(), to_bytes, amount, 0);
        tx.sign(keypair.signing_key())
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(tx)
    })();

    match result {
        Ok(tx) => {
            println!("Transaction created:");
            println!("  From:      {}", hex::encode(&tx.from));
            println!("  To:        {}", hex::encode(&tx.to));
            println!("  Amount:    {}", tx.amount);
            println!("  Hash:      {}", hex::encode(&tx.hash));
            println!("  Signature: {}", hex::encode(&tx.signature));
            println!("Signed; submit it to a node's mempool to broadcast.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("send failed: {e:#}");
            ExitCode::from(1)
        }
    }
}
