//! Peer gossip orchestration.
//!
//! Discovery and sync are pull-heavy and best-effort: a new peer is
//! pinged before it is believed, every other peer hears about it, and
//! a full sync (peers, blocks, mempool) runs against it. A periodic
//! task repeats the full sync with everyone once a minute, evicting
//! unresponsive peers unless they are in the well-known bootstrap set.
//!
//! Everything here fires background tasks and logs failures rather
//! than surfacing them — gossip is allowed to be lossy. The exception
//! is the store: a failing database is not a network hiccup, and takes
//! the process down.

use anyhow::{Context, Result};
use std::sync::Arc;

use cryptopuff_protocol::config::SYNC_INTERVAL;
use cryptopuff_protocol::storage::ChainError;

use crate::api::SharedState;

/// Logs a fatal store error and exits. Background tasks have nobody to
/// return an error to, and a broken store means every future
/// transaction would fail anyway.
pub fn store_fatal<T>(result: Result<T, ChainError>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "{what}");
            std::process::exit(1);
        }
    }
}

/// Considers `peer` for the peer set. Self and already-known peers are
/// no-ops. Otherwise, in the background: ping it, insert it, announce
/// it to every other peer, then run a full sync with it.
pub fn validate_and_add_peer(state: &SharedState, peer: String) -> Result<(), ChainError> {
    let peer = peer.to_lowercase();
    if peer == state.ext_addr {
        return Ok(());
    }
    if state.chain.peer_exists(&peer)? {
        return Ok(());
    }

    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = state.client.ping(&peer).await {
            tracing::info!(peer = %peer, error = %err, "ignoring peer, ping failed");
            return;
        }

        let created = match state.chain.add_peer(&peer) {
            Ok(created) => created,
            Err(err) => {
                tracing::error!(peer = %peer, error = %err, "failed to add peer to the store");
                return;
            }
        };
        if !created {
            // Lost the race against another announcement of the same peer.
            return;
        }

        let others = match state.chain.peers() {
            Ok(others) => others,
            Err(err) => {
                tracing::error!(error = %err, "failed to list peers");
                return;
            }
        };
        for other in others {
            if other == peer {
                continue;
            }
            let state = Arc::clone(&state);
            let newcomer = peer.clone();
            tokio::spawn(async move {
                if let Err(err) = state.client.add_peer(&other, &newcomer).await {
                    tracing::warn!(peer = %other, newcomer = %newcomer, error = %err, "failed to announce new peer");
                }
            });
        }

        if let Err(err) = full_peer_sync(&state, &peer).await {
            tracing::warn!(peer = %peer, error = %err, "full sync with new peer failed");
        }
    });

    Ok(())
}

/// Announces ourselves to `peer`, then pulls its peer list, chain, and
/// mempool.
pub async fn full_peer_sync(state: &SharedState, peer: &str) -> Result<()> {
    state
        .client
        .add_peer(peer, &state.ext_addr)
        .await
        .with_context(|| format!("failed to announce ourselves to {peer}"))?;

    fetch_peers(state, peer)
        .await
        .with_context(|| format!("failed to fetch peers from {peer}"))?;

    fetch_blocks(state, peer)
        .await
        .with_context(|| format!("failed to fetch blocks from {peer}"))?;

    fetch_txs(state, peer)
        .await
        .with_context(|| format!("failed to fetch transactions from {peer}"))?;

    Ok(())
}

/// Feeds the peer's peer list through discovery.
pub async fn fetch_peers(state: &SharedState, peer: &str) -> Result<()> {
    for candidate in state.client.peers(peer).await? {
        validate_and_add_peer(state, candidate)?;
    }
    Ok(())
}

/// Pulls the peer's full chain and applies whatever extends ours.
pub async fn fetch_blocks(state: &SharedState, peer: &str) -> Result<()> {
    let blocks = state.client.blocks(peer).await?;
    state.chain.add_blocks(&blocks)?;
    state.bump_best_block_version();
    Ok(())
}

/// Pulls the peer's mempool. Invalid transactions are bad gossip and
/// are dropped without comment; store faults propagate.
pub async fn fetch_txs(state: &SharedState, peer: &str) -> Result<()> {
    for stx in state.client.txs(peer).await? {
        match state.chain.add_tx(&stx) {
            Ok(()) => {}
            Err(err) if err.is_invalid() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    state.bump_best_block_version();
    Ok(())
}

/// Once a minute: ping every known peer, evict the unresponsive ones
/// (well-known bootstrap peers excepted), and run a full sync with
/// each.
pub fn spawn_periodic_sync(state: SharedState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        // The first tick fires immediately; startup already syncs the
        // well-known peers, so skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let peers = store_fatal(state.chain.peers(), "periodic sync failed to list peers");
            for peer in peers {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if state.client.ping(&peer).await.is_err()
                        && !state.well_known_peers.contains(&peer)
                    {
                        if let Err(err) = state.chain.remove_peer(&peer) {
                            tracing::error!(peer = %peer, error = %err, "failed to remove unresponsive peer");
                            return;
                        }
                        tracing::info!(peer = %peer, "removed unresponsive peer");
                    }

                    if let Err(err) = full_peer_sync(&state, &peer).await {
                        tracing::warn!(peer = %peer, error = %err, "periodic full sync failed");
                    }
                });
            }
        }
    });
}
