//! The proof-of-work miner.
//!
//! A fixed number of searcher loops run on blocking worker threads.
//! Each reads the miner address, the best block, and up to ten pending
//! transactions, then hammers random nonces until a candidate hash
//! clears the difficulty target — or until the shared
//! `best_block_version` counter moves, which means somebody (a peer, a
//! sibling searcher) changed the tip and the candidate is built on
//! stale state. Searchers do not coordinate: two finding blocks on the
//! same parent is harmless because the store's block insert is
//! idempotent and forks resolve by height.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

use cryptopuff_protocol::config::{HASH_RATE_INTERVAL, MINER_TX_LIMIT, MINER_WORKERS};
use cryptopuff_protocol::Block;

use crate::api::SharedState;
use crate::gossip::store_fatal;

/// Outcome of one proof-of-work search.
#[derive(Debug, PartialEq, Eq)]
enum Search {
    /// The candidate's hash clears the difficulty target.
    Found,
    /// The tip changed under us; the candidate is stale.
    Preempted,
}

/// Spawns the searcher loops and the hash-rate reporter.
pub fn spawn(state: SharedState) {
    let handle = Handle::current();
    for worker in 0..MINER_WORKERS {
        let state = Arc::clone(&state);
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || mine_loop(state, handle, worker));
    }
    spawn_hash_rate_reporter(state);
}

/// Randomizes the candidate's nonce until it either clears the target
/// or the version counter leaves `snapshot`. Counts every rejected
/// candidate.
fn search_pow(
    candidate: &mut Block,
    version: &AtomicU64,
    snapshot: u64,
    rejected: &AtomicU64,
) -> Result<Search, serde_json::Error> {
    let mut rng = rand::thread_rng();
    loop {
        if version.load(Ordering::SeqCst) != snapshot {
            return Ok(Search::Preempted);
        }

        candidate.nonce = rng.gen_range(0..i64::MAX);
        candidate.update_hash()?;
        if candidate.hash.meets_difficulty() {
            return Ok(Search::Found);
        }

        rejected.fetch_add(1, Ordering::Relaxed);
    }
}

fn mine_loop(state: SharedState, handle: Handle, worker: usize) {
    loop {
        let address = store_fatal(
            state.chain.miner_address(),
            "miner failed to read miner address",
        );
        let snapshot = state.best_block_version.load(Ordering::SeqCst);
        let tip = store_fatal(state.chain.best_block(), "miner failed to read best block");
        let stxs = store_fatal(
            state.chain.pending_txs(&tip.hash, MINER_TX_LIMIT),
            "miner failed to read pending transactions",
        );

        tracing::info!(worker, tip = %tip.hash, height = tip.height, txs = stxs.len(), "mining on current tip");

        let mut candidate = match Block::new(&tip, 0, address, state.block_reward, stxs) {
            Ok(candidate) => candidate,
            Err(err) => {
                tracing::error!(error = %err, "miner failed to assemble candidate block");
                std::process::exit(1);
            }
        };

        match search_pow(
            &mut candidate,
            &state.best_block_version,
            snapshot,
            &state.hashes_per_sec,
        ) {
            Ok(Search::Preempted) => continue,
            Ok(Search::Found) => {}
            Err(err) => {
                tracing::error!(error = %err, "miner failed to hash candidate block");
                std::process::exit(1);
            }
        }

        match state.chain.add_block(&candidate) {
            Ok(()) => {}
            // A racing block got in first and invalidated ours (e.g. a
            // pending tx is now included). Start over on the new state.
            Err(err) if err.is_invalid() => {
                tracing::debug!(worker, error = %err, "mined block lost a race, restarting");
                continue;
            }
            Err(err) => {
                tracing::error!(error = %err, "miner failed to store mined block");
                std::process::exit(1);
            }
        }
        state.bump_best_block_version();
        tracing::info!(worker, block = %candidate.hash, height = candidate.height, "mined a block");

        let peers = store_fatal(state.chain.peers(), "miner failed to list peers");
        for peer in peers {
            let state = Arc::clone(&state);
            let block = candidate.clone();
            handle.spawn(async move {
                if let Err(err) = state.client.add_block(&peer, &block).await {
                    tracing::warn!(peer = %peer, block = %block.hash, error = %err, "failed to push mined block");
                }
            });
        }
    }
}

/// Samples and resets the rejected-candidate counter once a second.
fn spawn_hash_rate_reporter(state: SharedState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HASH_RATE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let hashes = state.hashes_per_sec.swap(0, Ordering::Relaxed);
            tracing::info!(hashes_per_sec = hashes, "mining rate");
        }
    });
}
