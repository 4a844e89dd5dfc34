//! HTTP clients for the peer protocol and the wallet RPC.
//!
//! [`PeerClient`] speaks the unauthenticated peer surface and stamps
//! every request with an `X-Peer` header naming this node's external
//! address. [`RpcClient`] speaks the password-protected wallet surface
//! with HTTP basic auth. Both apply a flat one-minute timeout per
//! request; a non-200 response becomes an error carrying the first
//! line of the body, which is where the node puts its reason.

use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue};
use reqwest::{Client, Response, StatusCode};
use rsa::RsaPrivateKey;
use thiserror::Error;

use super::{CONTENT_TYPE_PEM, HEADER_X_PEER};
use crate::block::Block;
use crate::config::HTTP_TIMEOUT;
use crate::crypto::address::{Address, AddressState, Version};
use crate::crypto::keys::{decode_private_key_pem, encode_private_key_pem, KeyError};
use crate::transaction::{PersonalTx, SignedTx, Tx};

/// Errors from talking to a peer or a node's RPC surface.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid status code {status}: {line}")]
    Status { status: u16, line: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid key in response: {0}")]
    Key(#[from] KeyError),

    #[error("invalid external address: {0}")]
    Header(#[from] InvalidHeaderValue),
}

/// Fails non-200 responses with the first line of their body.
async fn ok_or_status(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status == StatusCode::OK {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let line = body.lines().next().unwrap_or_default().to_string();
    Err(ClientError::Status {
        status: status.as_u16(),
        line,
    })
}

/// Percent-encodes an address for use as a single path segment. The
/// Base64 alphabet only needs `+`, `/` and `=` (and a literal `%`)
/// escaped.
fn escape_path_segment(s: &str) -> String {
    s.replace('%', "%25")
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D")
}

// ---------------------------------------------------------------------------
// PeerClient
// ---------------------------------------------------------------------------

/// Client for the unauthenticated peer-to-peer endpoints.
#[derive(Debug, Clone)]
pub struct PeerClient {
    client: Client,
}

impl PeerClient {
    /// Builds a client announcing `ext_addr` as this node's address.
    pub fn new(ext_addr: &str) -> Result<PeerClient, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_X_PEER, HeaderValue::from_str(ext_addr)?);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(PeerClient { client })
    }

    pub async fn ping(&self, peer: &str) -> Result<(), ClientError> {
        let resp = self.client.get(format!("http://{peer}/api/ping")).send().await?;
        ok_or_status(resp).await?;
        Ok(())
    }

    pub async fn peers(&self, peer: &str) -> Result<Vec<String>, ClientError> {
        let resp = self.client.get(format!("http://{peer}/api/peers")).send().await?;
        Ok(ok_or_status(resp).await?.json().await?)
    }

    /// Tells `peer` that `addr` exists.
    pub async fn add_peer(&self, peer: &str, addr: &str) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(format!("http://{peer}/api/peers"))
            .json(&addr)
            .send()
            .await?;
        ok_or_status(resp).await?;
        Ok(())
    }

    /// Pulls the peer's full chain, tip first.
    pub async fn blocks(&self, peer: &str) -> Result<Vec<Block>, ClientError> {
        let resp = self.client.get(format!("http://{peer}/api/blocks")).send().await?;
        let mut blocks: Vec<Block> = ok_or_status(resp).await?.json().await?;
        for block in &mut blocks {
            block.update_hash()?;
        }
        Ok(blocks)
    }

    pub async fn add_block(&self, peer: &str, block: &Block) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(format!("http://{peer}/api/blocks"))
            .json(block)
            .send()
            .await?;
        ok_or_status(resp).await?;
        Ok(())
    }

    /// Pulls the peer's mempool.
    pub async fn txs(&self, peer: &str) -> Result<Vec<SignedTx>, ClientError> {
        let resp = self.client.get(format!("http://{peer}/api/txs")).send().await?;
        let mut stxs: Vec<SignedTx> = ok_or_status(resp).await?.json().await?;
        for stx in &mut stxs {
            stx.update_hash()?;
        }
        Ok(stxs)
    }

    pub async fn add_tx(&self, peer: &str, stx: &SignedTx) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(format!("http://{peer}/api/txs"))
            .json(stx)
            .send()
            .await?;
        ok_or_status(resp).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// Client for a node's password-protected wallet endpoints. Used by
/// the wallet CLI.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    addr: String,
    password: String,
}

impl RpcClient {
    pub fn new(addr: &str, password: &str) -> Result<RpcClient, ClientError> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(RpcClient {
            client,
            addr: addr.to_string(),
            password: password.to_string(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("http://{}{path}", self.addr))
            .basic_auth("", Some(&self.password))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("http://{}{path}", self.addr))
            .basic_auth("", Some(&self.password))
    }

    pub async fn peers(&self) -> Result<Vec<String>, ClientError> {
        let resp = self.get("/api/peers").send().await?;
        Ok(ok_or_status(resp).await?.json().await?)
    }

    pub async fn addresses(&self) -> Result<Vec<AddressState>, ClientError> {
        let resp = self.get("/api/addresses").send().await?;
        Ok(ok_or_status(resp).await?.json().await?)
    }

    pub async fn my_txs(&self) -> Result<Vec<PersonalTx>, ClientError> {
        let resp = self.get("/api/txs/mine").send().await?;
        let mut ptxs: Vec<PersonalTx> = ok_or_status(resp).await?.json().await?;
        for ptx in &mut ptxs {
            ptx.tx.update_hash()?;
        }
        Ok(ptxs)
    }

    /// Imports a private key into the node's wallet and returns the
    /// address the node derived for it.
    pub async fn add_key(
        &self,
        key: &RsaPrivateKey,
        version: Version,
    ) -> Result<Address, ClientError> {
        let resp = self
            .post(&format!("/api/keys?version={}", version.as_query()))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_PEM)
            .body(encode_private_key_pem(key))
            .send()
            .await?;
        Ok(ok_or_status(resp).await?.json().await?)
    }

    /// Exports the private key the node holds for `address`.
    pub async fn key(&self, address: &Address) -> Result<RsaPrivateKey, ClientError> {
        let resp = self
            .get(&format!(
                "/api/keys/{}",
                escape_path_segment(&address.to_string())
            ))
            .send()
            .await?;
        let pem = ok_or_status(resp).await?.text().await?;
        Ok(decode_private_key_pem(&pem)?)
    }

    pub async fn set_miner_address(&self, address: &Address) -> Result<(), ClientError> {
        let resp = self.post("/api/addresses/miner").json(address).send().await?;
        ok_or_status(resp).await?;
        Ok(())
    }

    /// Asks the node to sign a transfer with the wallet key of its
    /// source address.
    pub async fn sign_tx(&self, tx: &Tx) -> Result<SignedTx, ClientError> {
        let resp = self.post("/api/txs/sign").json(tx).send().await?;
        let mut stx: SignedTx = ok_or_status(resp).await?.json().await?;
        stx.update_hash()?;
        Ok(stx)
    }

    /// Submits a signed transaction for inclusion and gossip.
    pub async fn broadcast_tx(&self, stx: &SignedTx) -> Result<(), ClientError> {
        let resp = self.post("/api/txs/broadcast").json(stx).send().await?;
        ok_or_status(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segment_escaping_covers_the_base64_alphabet() {
        assert_eq!(escape_path_segment("abcXYZ019"), "abcXYZ019");
        assert_eq!(escape_path_segment("a+b/c="), "a%2Bb%2Fc%3D");
        assert_eq!(escape_path_segment("50%"), "50%25");
        // '%' is escaped first so existing escapes don't double-expand.
        assert_eq!(escape_path_segment("%2B"), "%252B");
    }

    #[test]
    fn peer_client_rejects_unprintable_ext_addr() {
        assert!(PeerClient::new("10.0.0.1:8080").is_ok());
        assert!(PeerClient::new("bad\naddr").is_err());
    }
}
