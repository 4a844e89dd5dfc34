//! # Protocol Configuration & Constants
//!
//! Every magic number in cryptopuff lives here. The consensus-relevant
//! values (proof-of-work target, block limits, genesis nonce) define the
//! network itself — changing any of them forks the chain.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Consensus Parameters
// ---------------------------------------------------------------------------

/// Nonce of the hard-coded genesis block. Inserted into every store on
/// first open; all chains descend from it.
pub const GENESIS_NONCE: i64 = 39_611_433;

/// Maximum reward a block may claim for itself, in coins.
pub const MAX_BLOCK_REWARD: i64 = 1000;

/// Maximum number of signed transactions a single block may carry.
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 100;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// RSA key length for generated wallet keys, in bits. 256-bit RSA is
/// factorable on a laptop; that is the point of the exercise.
pub const DEFAULT_KEY_BITS: usize = 256;

/// PSS salt length in bytes for transaction signatures. A 256-bit
/// modulus leaves a 32-byte encoded message; the MD5 digest takes 16
/// of it and salt + digest + 2 must fit.
pub const PSS_SALT_LEN: usize = 8;

/// PSS salt length for address-ownership proofs. Their SHA-224 digest
/// occupies 28 of the 32 available bytes, leaving at most 2 for salt.
pub const PROOF_SALT_LEN: usize = 2;

// ---------------------------------------------------------------------------
// Node Defaults
// ---------------------------------------------------------------------------

/// Default TCP port for both the peer protocol and the wallet RPC.
pub const DEFAULT_PORT: &str = "8080";

/// Default password protecting the wallet endpoints.
pub const DEFAULT_PASSWORD: &str = "netcraftnetcraftnetcraft";

/// Bootstrap peer every node knows about out of the box. Well-known
/// peers are never evicted when a ping fails.
pub const DEFAULT_WELL_KNOWN_PEER: &str = "cryptopuff.netcraft.com:8080";

/// Default block reward claimed by locally mined blocks, in coins.
pub const DEFAULT_BLOCK_REWARD: i64 = 100;

/// File name of the embedded database, placed in the user's home
/// directory by default.
pub const DEFAULT_DB_FILE: &str = "cryptopuff.sqlite3";

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Per-request timeout for every peer and RPC HTTP call.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between periodic full syncs with every known peer.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Interval at which the miner's hash counter is sampled and reset.
pub const HASH_RATE_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Mining
// ---------------------------------------------------------------------------

/// Number of parallel proof-of-work searchers. They do not coordinate;
/// duplicate finds are absorbed by the store's idempotent block insert.
pub const MINER_WORKERS: usize = 3;

/// Maximum number of pending transactions packed into a mined block.
pub const MINER_TX_LIMIT: usize = 10;
