//! # HTTP API surface
//!
//! One axum router, two audiences. Peer endpoints are open — any node
//! on the network may pull or push state. Wallet endpoints sit behind
//! HTTP basic auth with a shared password; only the password half of
//! the credentials is checked.
//!
//! | Method | Path                      | Auth | Handler                |
//! |--------|---------------------------|------|------------------------|
//! | GET    | `/api/ping`               | no   | liveness               |
//! | GET    | `/api/peers`              | no   | known peer list        |
//! | POST   | `/api/peers`              | no   | peer announcement      |
//! | GET    | `/api/blocks`             | no   | full chain, tip first  |
//! | POST   | `/api/blocks`             | no   | pushed block           |
//! | GET    | `/api/txs`                | no   | mempool                |
//! | POST   | `/api/txs`                | no   | pushed transaction     |
//! | GET    | `/api/addresses`          | no   | wallet address states  |
//! | GET    | `/api/addresses/proofs`   | no   | ownership attestations |
//! | POST   | `/api/addresses/miner`    | yes  | set reward destination |
//! | POST   | `/api/keys`               | yes  | import key             |
//! | GET    | `/api/keys/{address}`     | yes  | export key             |
//! | GET    | `/api/txs/mine`           | yes  | wallet's transactions  |
//! | POST   | `/api/txs/sign`           | yes  | sign a transfer        |
//! | POST   | `/api/txs/broadcast`      | yes  | submit + gossip        |

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use cryptopuff_protocol::crypto::address::{Address, AddressState, Version};
use cryptopuff_protocol::crypto::keys::{decode_private_key_pem, encode_private_key_pem};
use cryptopuff_protocol::network::{PeerClient, CONTENT_TYPE_PEM, HEADER_X_PEER};
use cryptopuff_protocol::proof::AddressProof;
use cryptopuff_protocol::storage::ChainError;
use cryptopuff_protocol::transaction::PersonalTx;
use cryptopuff_protocol::{Block, ChainStore, SignedTx, Tx};

use crate::gossip;

/// Everything the handlers and background tasks share.
pub struct AppState {
    pub chain: ChainStore,
    pub client: PeerClient,
    /// This node's own external address, lowercased. Excluded from the
    /// peer set.
    pub ext_addr: String,
    pub password: String,
    pub block_reward: i64,
    /// Bootstrap peers, immune to ping eviction. Immutable after startup.
    pub well_known_peers: HashSet<String>,
    /// Monotonic counter bumped on every tip-affecting mutation. The
    /// miner snapshots it and restarts when it moves.
    pub best_block_version: AtomicU64,
    /// Candidates rejected since the last reporter tick.
    pub hashes_per_sec: AtomicU64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn bump_best_block_version(&self) {
        self.best_block_version.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds the router with tracing and the wallet auth group.
pub fn router(state: SharedState) -> Router {
    let wallet = Router::new()
        .route("/api/addresses/miner", post(set_miner_address))
        .route("/api/keys", post(add_key))
        .route("/api/keys/{address}", get(key))
        .route("/api/txs/mine", get(my_txs))
        .route("/api/txs/sign", post(sign_tx))
        .route("/api/txs/broadcast", post(broadcast_tx))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_password,
        ));

    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/peers", get(peers).post(add_peer))
        .route("/api/blocks", get(blocks).post(add_block))
        .route("/api/txs", get(txs).post(add_tx))
        .route("/api/addresses", get(addresses))
        .route("/api/addresses/proofs", get(address_proofs))
        .merge(wallet)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Maps store failures to responses: consensus violations are the
/// client's fault, everything else is ours.
fn chain_error(err: ChainError) -> (StatusCode, String) {
    let status = if err.is_invalid() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, err.to_string())
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn bad_request(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Extracts the password half of a `Basic` Authorization header. The
/// user half is ignored.
fn basic_auth_password(header_value: &str) -> Option<String> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (_user, password) = credentials.split_once(':')?;
    Some(password.to_string())
}

async fn require_password(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(basic_auth_password)
        .is_some_and(|password| password == state.password);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"cryptopuff\"")],
            "invalid password",
        )
            .into_response();
    }

    next.run(request).await
}

// ---------------------------------------------------------------------------
// Peer endpoints
// ---------------------------------------------------------------------------

async fn ping() -> StatusCode {
    StatusCode::OK
}

async fn peers(
    State(state): State<SharedState>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    state.chain.peers().map(Json).map_err(chain_error)
}

async fn add_peer(
    State(state): State<SharedState>,
    Json(peer): Json<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    gossip::validate_and_add_peer(&state, peer).map_err(bad_request)?;
    Ok(StatusCode::OK)
}

async fn blocks(State(state): State<SharedState>) -> Result<Json<Vec<Block>>, (StatusCode, String)> {
    state.chain.blocks().map(Json).map_err(chain_error)
}

async fn add_block(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(mut block): Json<Block>,
) -> Result<StatusCode, (StatusCode, String)> {
    block.update_hash().map_err(internal)?;

    match state.chain.add_block(&block) {
        Ok(()) => {
            state.bump_best_block_version();
            Ok(StatusCode::OK)
        }
        Err(err) if err.is_unknown_parent() => {
            // We are missing ancestry; pull the pusher's full chain in
            // the background and report success to keep gossip flowing.
            let peer = headers
                .get(HEADER_X_PEER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(err) = gossip::fetch_blocks(&state, &peer).await {
                    tracing::warn!(peer = %peer, error = %err, "failed to fetch missing parent blocks");
                }
            });
            Ok(StatusCode::OK)
        }
        Err(err) => Err(chain_error(err)),
    }
}

async fn txs(State(state): State<SharedState>) -> Result<Json<Vec<SignedTx>>, (StatusCode, String)> {
    state.chain.all_pending_txs().map(Json).map_err(chain_error)
}

async fn add_tx(
    State(state): State<SharedState>,
    Json(mut stx): Json<SignedTx>,
) -> Result<StatusCode, (StatusCode, String)> {
    stx.update_hash().map_err(internal)?;
    state.chain.add_tx(&stx).map_err(chain_error)?;
    state.bump_best_block_version();
    Ok(StatusCode::OK)
}

async fn addresses(
    State(state): State<SharedState>,
) -> Result<Json<Vec<AddressState>>, (StatusCode, String)> {
    state.chain.addresses().map(Json).map_err(chain_error)
}

#[derive(Deserialize)]
struct ProofParams {
    challenge: String,
}

async fn address_proofs(
    State(state): State<SharedState>,
    Query(params): Query<ProofParams>,
) -> Result<Json<Vec<AddressProof>>, (StatusCode, String)> {
    let challenge = hex::decode(&params.challenge).map_err(bad_request)?;

    let keys = state.chain.keys().map_err(chain_error)?;
    let mut proofs = Vec::with_capacity(keys.len());
    for key in keys {
        proofs.push(key.sign_address_proof(&challenge).map_err(internal)?);
    }
    Ok(Json(proofs))
}

// ---------------------------------------------------------------------------
// Wallet endpoints
// ---------------------------------------------------------------------------

async fn set_miner_address(
    State(state): State<SharedState>,
    Json(address): Json<Address>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .chain
        .set_miner_address(&address)
        .map_err(chain_error)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct KeyParams {
    version: u8,
}

async fn add_key(
    State(state): State<SharedState>,
    Query(params): Query<KeyParams>,
    body: String,
) -> Result<Json<Address>, (StatusCode, String)> {
    let version = Version::from_query(params.version)
        .ok_or_else(|| bad_request("version must be 1 or 2"))?;
    let key = decode_private_key_pem(&body).map_err(bad_request)?;

    state
        .chain
        .add_key(version, &key)
        .map(Json)
        .map_err(chain_error)
}

async fn key(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let address = Address::from_base64(&address).map_err(bad_request)?;

    let key = state
        .chain
        .key(&address)
        .map_err(chain_error)?
        .ok_or((StatusCode::NOT_FOUND, format!("no key for address {address}")))?;

    Ok((
        [(header::CONTENT_TYPE, CONTENT_TYPE_PEM)],
        encode_private_key_pem(&key),
    ))
}

async fn my_txs(
    State(state): State<SharedState>,
) -> Result<Json<Vec<PersonalTx>>, (StatusCode, String)> {
    state.chain.my_txs().map(Json).map_err(chain_error)
}

async fn sign_tx(
    State(state): State<SharedState>,
    Json(tx): Json<Tx>,
) -> Result<Json<SignedTx>, (StatusCode, String)> {
    let key = state
        .chain
        .key(&tx.source)
        .map_err(chain_error)?
        .ok_or((
            StatusCode::NOT_FOUND,
            format!("no key for address {}", tx.source),
        ))?;

    let stx = tx.sign(&key).map_err(internal)?;
    Ok(Json(stx))
}

async fn broadcast_tx(
    State(state): State<SharedState>,
    Json(mut stx): Json<SignedTx>,
) -> Result<StatusCode, (StatusCode, String)> {
    stx.update_hash().map_err(internal)?;
    state.chain.add_tx(&stx).map_err(chain_error)?;
    state.bump_best_block_version();

    // Fan the transaction out to every known peer; individual push
    // failures are logged, never surfaced.
    let peers = state.chain.peers().map_err(chain_error)?;
    for peer in peers {
        let state = Arc::clone(&state);
        let stx = stx.clone();
        tokio::spawn(async move {
            if let Err(err) = state.client.add_tx(&peer, &stx).await {
                tracing::warn!(peer = %peer, tx = %stx.hash, error = %err, "failed to push transaction");
            }
        });
    }

    Ok(StatusCode::OK)
}
