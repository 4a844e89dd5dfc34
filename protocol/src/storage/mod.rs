//! Persistent chain state.
//!
//! Two layers: [`store`] owns the embedded SQLite connection and the
//! "run this closure in a transaction, retrying on contention"
//! primitive; [`chain`] builds the actual chain operations — blocks,
//! balances, mempool, peers, wallet keys — on top of it.

pub mod chain;
pub mod store;

pub use chain::{ChainError, ChainStore};
pub use store::{binary_exponential_backoff, is_deadlock, Backoff, Retriable, Store};
