//! # cryptopuff-protocol
//!
//! Core library for the cryptopuff proof-of-work network: primitives
//! (hashes, addresses, RSA keys), signed transactions, blocks, the
//! persistent chain store, and the HTTP clients used to talk to peers
//! and to a node's wallet RPC.
//!
//! The chain is deliberately weak by modern standards — MD5 digests,
//! 256-bit RSA keys, an 18-bit proof-of-work target. It is a playground
//! currency, not money.
//!
//! ## Module map
//!
//! | Module        | Responsibility                                       |
//! |---------------|------------------------------------------------------|
//! | `config`      | Protocol constants and node defaults                 |
//! | `crypto`      | Hashing, address derivation, RSA key handling        |
//! | `transaction` | Transfers, signing, signature validation             |
//! | `block`       | Block assembly, hashing, validation against parent   |
//! | `storage`     | SQLite-backed chain state with retrying transactions |
//! | `network`     | Peer and wallet RPC HTTP clients                     |
//! | `proof`       | Address-ownership attestations (non-consensus)       |
//! | `net`         | External IP detection helper                         |

pub mod block;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod network;
pub mod proof;
pub mod storage;
pub mod transaction;

pub use block::Block;
pub use crypto::address::{Address, Version};
pub use crypto::hash::Hash;
pub use error::ValidationError;
pub use storage::chain::ChainStore;
pub use transaction::{SignedTx, Tx, TxId, TxOutput};
