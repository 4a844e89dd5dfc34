//! Validation failure taxonomy.
//!
//! Every consensus rule violation is a distinct variant so callers can
//! branch on the reason: the gossip layer drops invalid material
//! silently, the store turns `UnknownParent` into a backfill request,
//! and the RPC surface maps the whole family to client errors. IO and
//! storage faults are deliberately a different type
//! ([`crate::storage::ChainError`]) — confusing "bad block" with
//! "broken disk" would make peers able to crash each other.

use thiserror::Error;

use crate::crypto::hash::Hash;

/// A transaction's amounts are malformed.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum AmountError {
    #[error("negative fee")]
    NegativeFee,

    #[error("negative or zero amount")]
    NonPositiveAmount,

    #[error("fee plus amount overflows")]
    Overflow,
}

/// A block or transaction broke a consensus rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The block's parent is not in the store. Control-flow marker:
    /// gossip handlers respond by pulling the sender's full chain.
    #[error("unknown parent block")]
    UnknownParent,

    #[error("previous hash mismatch (expected {expected}, got {got})")]
    PreviousHashMismatch { expected: Hash, got: Hash },

    #[error("height mismatch (expected {expected}, got {got})")]
    BadHeight { expected: i64, got: i64 },

    #[error("hash doesn't meet difficulty requirement")]
    BadPow,

    #[error("reward amount negative or greater than maximum")]
    RewardOutOfRange,

    #[error("number of transactions greater than maximum")]
    TooManyTransactions,

    #[error("invalid amounts: {0}")]
    BadAmount(#[from] AmountError),

    #[error("address doesn't match public key")]
    AddressMismatch,

    #[error("invalid signature: {0}")]
    BadSignature(String),

    #[error("insufficient balance ({balance} coins, {required} required)")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("transaction already included in blockchain")]
    AlreadyIncluded,
}
