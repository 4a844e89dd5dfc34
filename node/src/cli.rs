//! # CLI Interface
//!
//! One binary, two personalities: `run` starts the node daemon, every
//! other subcommand is a wallet operation executed against a running
//! node's RPC surface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use cryptopuff_protocol::config::{
    DEFAULT_BLOCK_REWARD, DEFAULT_KEY_BITS, DEFAULT_PASSWORD, DEFAULT_WELL_KNOWN_PEER,
};

/// Cryptopuff node daemon and wallet CLI.
#[derive(Parser, Debug)]
#[command(
    name = "cryptopuff-node",
    about = "Cryptopuff proof-of-work node and wallet",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node: chain store, miner, peer gossip and HTTP API.
    Run(RunArgs),

    /// Generate a new private key and print its address.
    Genkey {
        #[command(flatten)]
        wallet: WalletArgs,

        /// RSA key length in bits.
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,

        /// Random number generator seed (default: current Unix time).
        #[arg(long)]
        seed: Option<u64>,

        /// Use the 16-byte v2 address format.
        #[arg(long)]
        v2: bool,
    },

    /// Import an existing PEM private key from a file (or stdin) and
    /// print its address.
    Importkey {
        #[command(flatten)]
        wallet: WalletArgs,

        /// Path to the PEM file. Reads stdin when omitted.
        file: Option<PathBuf>,

        /// Use the 16-byte v2 address format.
        #[arg(long)]
        v2: bool,
    },

    /// Export the private key for an address and print it.
    Exportkey {
        #[command(flatten)]
        wallet: WalletArgs,

        /// Base64 wallet address.
        address: String,
    },

    /// Set the block reward destination for blocks mined by this node.
    Setmineraddr {
        #[command(flatten)]
        wallet: WalletArgs,

        /// Base64 wallet address.
        address: String,
    },

    /// Print the balance of each address in the wallet.
    Balance {
        #[command(flatten)]
        wallet: WalletArgs,
    },

    /// Print all transactions to or from wallet addresses.
    Txs {
        #[command(flatten)]
        wallet: WalletArgs,
    },

    /// Send coins from one address to another.
    Send {
        #[command(flatten)]
        wallet: WalletArgs,

        /// Base64 source address (its key must be in the wallet).
        source: String,

        /// Base64 destination address.
        destination: String,

        /// Amount of coins to transfer.
        amount: i64,

        /// Miner fee offered.
        fee: i64,
    },

    /// Print all peers known to this node.
    Peers {
        #[command(flatten)]
        wallet: WalletArgs,
    },
}

/// Connection settings shared by every wallet subcommand.
#[derive(Args, Debug, Clone)]
pub struct WalletArgs {
    /// Address of the local node.
    #[arg(long, default_value = "localhost:8080")]
    pub addr: String,

    /// Password for accessing the node's wallet.
    #[arg(long, env = "CRYPTOPUFF_PASSWORD", default_value = DEFAULT_PASSWORD)]
    pub password: String,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// Address peers can use to reach this node. Defaults to the
    /// detected external IP on port 8080.
    #[arg(long)]
    pub ext_addr: Option<String>,

    /// Path to the database file. Do not delete it — it contains the
    /// wallet's private keys. Defaults to ~/cryptopuff.sqlite3.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Comma-separated list of well-known peer addresses. These are
    /// never evicted when a ping fails.
    #[arg(long, default_value = DEFAULT_WELL_KNOWN_PEER)]
    pub peers: String,

    /// Password restricting access to this node's wallet endpoints.
    #[arg(long, env = "CRYPTOPUFF_PASSWORD", default_value = DEFAULT_PASSWORD)]
    pub password: String,

    /// Block reward to claim in blocks mined by this node.
    #[arg(long, default_value_t = DEFAULT_BLOCK_REWARD)]
    pub block_reward: i64,
}

impl RunArgs {
    /// The bootstrap peer list, lowercased, with empty entries dropped
    /// so `--peers ""` means "no well-known peers".
    pub fn well_known_peers(&self) -> Vec<String> {
        self.peers
            .split(',')
            .filter(|p| !p.is_empty())
            .map(|p| p.to_lowercase())
            .collect()
    }
}
