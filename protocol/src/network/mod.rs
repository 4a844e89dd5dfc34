//! HTTP plumbing shared by the node and its clients.

pub mod client;

pub use client::{ClientError, PeerClient, RpcClient};

/// Header carrying the requesting peer's own external address. Lets
/// the receiver know whom to pull missing parents from.
pub const HEADER_X_PEER: &str = "X-Peer";

/// Content type for PEM-wrapped RSA keys.
pub const CONTENT_TYPE_PEM: &str = "application/x-pem-file";
