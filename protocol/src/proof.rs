//! Address-ownership attestations.
//!
//! A node can be challenged to prove which wallet addresses it holds
//! keys for. The proof signs the SHA-224 digest of the challenge —
//! deliberately a different digest than the transaction path, so this
//! endpoint cannot be abused as an oracle for signing transfers. This
//! is bookkeeping for an out-of-band scoreboard, not consensus.

use rand::thread_rng;
use rsa::{Pss, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};

use crate::config::PROOF_SALT_LEN;
use crate::crypto::address::{Address, Version};
use crate::crypto::keys::{parse_public_key_der, public_key_der};
use crate::error::ValidationError;
use crate::transaction::SignError;

fn pss() -> Pss {
    Pss::new_with_salt::<Sha224>(PROOF_SALT_LEN)
}

/// An address and the private key that controls it, as stored in the
/// local wallet.
#[derive(Debug, Clone)]
pub struct WalletKey {
    pub address: Address,
    pub key: RsaPrivateKey,
}

impl WalletKey {
    /// Signs a challenge, attesting that this node controls `address`.
    pub fn sign_address_proof(&self, challenge: &[u8]) -> Result<AddressProof, SignError> {
        let digest = Sha224::digest(challenge);
        let signature = self
            .key
            .sign_with_rng(&mut thread_rng(), pss(), &digest)?;

        Ok(AddressProof {
            signature,
            address: self.address.clone(),
            public_key: public_key_der(&self.key.to_public_key()),
        })
    }
}

/// A signed claim that the prover controls `address`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressProof {
    #[serde(rename = "Signature", with = "crate::codec::base64_bytes")]
    pub signature: Vec<u8>,
    #[serde(rename = "Address")]
    pub address: Address,
    #[serde(rename = "PublicKey", with = "crate::codec::base64_bytes")]
    pub public_key: Vec<u8>,
}

impl AddressProof {
    /// Checks the proof against the challenge it was issued for.
    pub fn verify(&self, challenge: &[u8]) -> Result<(), ValidationError> {
        let key = parse_public_key_der(&self.public_key)
            .map_err(|e| ValidationError::BadSignature(e.to_string()))?;

        let v1 = Address::from_key(Version::V1, &key);
        let v2 = Address::from_key(Version::V2, &key);
        if v1 != self.address && v2 != self.address {
            return Err(ValidationError::AddressMismatch);
        }

        let digest = Sha224::digest(challenge);
        key.verify(pss(), &digest, &self.signature)
            .map_err(|e| ValidationError::BadSignature(e.to_string()))
    }
}
