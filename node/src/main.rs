//! # cryptopuff-node
//!
//! Entry point for the node binary. The `run` subcommand opens the
//! chain store, spawns the miner searchers, the hash-rate reporter and
//! the periodic peer sync, seeds the well-known peers, and serves the
//! HTTP API. Every other subcommand is a wallet operation against a
//! running node.

mod api;
mod cli;
mod gossip;
mod logging;
mod miner;
mod wallet;

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cryptopuff_protocol::config::{DEFAULT_DB_FILE, DEFAULT_PORT};
use cryptopuff_protocol::crypto::address::Version;
use cryptopuff_protocol::net::detect_ip;
use cryptopuff_protocol::network::{PeerClient, RpcClient};
use cryptopuff_protocol::ChainStore;

use cli::{Cli, Commands, RunArgs, WalletArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Genkey {
            wallet,
            bits,
            seed,
            v2,
        } => {
            let client = rpc_client(&wallet)?;
            let seed = seed.unwrap_or_else(unix_time);
            wallet::generate_key_cmd(&client, version(v2), bits, seed).await
        }
        Commands::Importkey { wallet, file, v2 } => {
            let client = rpc_client(&wallet)?;
            wallet::import_key(&client, file, version(v2)).await
        }
        Commands::Exportkey { wallet, address } => {
            let client = rpc_client(&wallet)?;
            wallet::export_key(&client, &address).await
        }
        Commands::Setmineraddr { wallet, address } => {
            let client = rpc_client(&wallet)?;
            wallet::set_miner_address(&client, &address).await
        }
        Commands::Balance { wallet } => {
            let client = rpc_client(&wallet)?;
            wallet::balance(&client).await
        }
        Commands::Txs { wallet } => {
            let client = rpc_client(&wallet)?;
            wallet::txs(&client).await
        }
        Commands::Send {
            wallet,
            source,
            destination,
            amount,
            fee,
        } => {
            let client = rpc_client(&wallet)?;
            wallet::send(&client, &source, &destination, amount, fee).await
        }
        Commands::Peers { wallet } => {
            let client = rpc_client(&wallet)?;
            wallet::peers(&client).await
        }
    }
}

async fn run_node(args: RunArgs) -> Result<()> {
    logging::init("cryptopuff_node=info,cryptopuff_protocol=info");

    let ext_addr = match &args.ext_addr {
        Some(addr) => addr.clone(),
        None => {
            let ip = detect_ip()
                .context("failed to detect the external IP; pass --ext-addr explicitly")?;
            format!("{ip}:{DEFAULT_PORT}")
        }
    };

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => home_dir()
            .context("failed to locate the home directory; pass --db explicitly")?
            .join(DEFAULT_DB_FILE),
    };

    tracing::info!(
        addr = %args.addr,
        ext_addr = %ext_addr,
        db = %db_path.display(),
        block_reward = args.block_reward,
        "starting cryptopuff node"
    );

    let chain = ChainStore::open(&db_path)
        .with_context(|| format!("failed to open chain store at {}", db_path.display()))?;
    let client = PeerClient::new(&ext_addr).context("failed to build peer client")?;

    let state = Arc::new(api::AppState {
        chain,
        client,
        ext_addr: ext_addr.to_lowercase(),
        password: args.password.clone(),
        block_reward: args.block_reward,
        well_known_peers: args.well_known_peers().into_iter().collect::<HashSet<_>>(),
        best_block_version: AtomicU64::new(0),
        hashes_per_sec: AtomicU64::new(0),
    });

    miner::spawn(Arc::clone(&state));
    gossip::spawn_periodic_sync(Arc::clone(&state));

    for peer in state.well_known_peers.clone() {
        gossip::validate_and_add_peer(&state, peer).context("failed to add well-known peer")?;
    }

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    tracing::info!(addr = %args.addr, "HTTP server listening");

    axum::serve(listener, api::router(state))
        .await
        .context("HTTP server failed")?;
    Ok(())
}

fn rpc_client(wallet: &WalletArgs) -> Result<RpcClient> {
    RpcClient::new(&wallet.addr, &wallet.password).context("failed to build RPC client")
}

fn version(v2: bool) -> Version {
    if v2 {
        Version::V2
    } else {
        Version::V1
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
