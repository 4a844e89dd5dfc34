//! Value transfers and their signatures.
//!
//! A [`Tx`] moves a positive `Amount` from `Source` to `Destination`
//! and offers a non-negative `Fee` to whoever mines it. Signing wraps
//! it in a [`SignedTx`]: a random 16-byte ID (so two identical
//! transfers never hash equal), the signer's PKCS#1 public key, and an
//! RSA-PSS signature over the MD5 digest of the unsigned transaction's
//! canonical JSON.
//!
//! The canonical JSON key order is consensus: `Destination`, `Amount`,
//! `Source`, `Fee`, then (for the signed envelope) `ID`, `Signature`,
//! `PublicKey`. Field declaration order below is therefore load-bearing.

use md5::{Digest, Md5};
use rand::Rng;
use rsa::{Pss, RsaPrivateKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::config::PSS_SALT_LEN;
use crate::crypto::address::{Address, Version};
use crate::crypto::hash::Hash;
use crate::crypto::keys::{parse_public_key_der, public_key_der};
use crate::error::{AmountError, ValidationError};

/// Size of a transaction ID in bytes.
pub const TX_ID_SIZE: usize = 16;

/// Errors that can occur while signing a transaction.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to encode transaction: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to sign transaction: {0}")]
    Sign(#[from] rsa::Error),
}

/// The PSS scheme shared by signing and verification.
fn pss() -> Pss {
    Pss::new_with_salt::<Md5>(PSS_SALT_LEN)
}

fn check_amounts(amount: i64, fee: i64) -> Result<(), AmountError> {
    if fee < 0 {
        return Err(AmountError::NegativeFee);
    }
    if amount <= 0 {
        return Err(AmountError::NonPositiveAmount);
    }
    if fee.checked_add(amount).is_none() {
        return Err(AmountError::Overflow);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TxId
// ---------------------------------------------------------------------------

/// A random nonce minted at signing time, hex-encoded on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TxId([u8; TX_ID_SIZE]);

impl TxId {
    pub fn random() -> TxId {
        let mut id = [0; TX_ID_SIZE];
        rand::thread_rng().fill(&mut id[..]);
        TxId(id)
    }

    pub fn from_hex(s: &str) -> Result<TxId, String> {
        let bytes = hex::decode(s).map_err(|e| format!("failed to hex decode TxID: {e}"))?;
        if bytes.len() != TX_ID_SIZE {
            return Err(format!(
                "invalid TxID length, expected {TX_ID_SIZE}, got {}",
                bytes.len()
            ));
        }
        let mut id = [0; TX_ID_SIZE];
        id.copy_from_slice(&bytes);
        Ok(TxId(id))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({self})")
    }
}

impl Serialize for TxId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TxId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tx
// ---------------------------------------------------------------------------

/// A destination and an amount. Also used for a block's reward slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(rename = "Destination")]
    pub destination: Address,
    #[serde(rename = "Amount")]
    pub amount: i64,
}

/// An unsigned transfer. This exact encoding (without the signature
/// envelope) is what gets digested and signed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    #[serde(rename = "Destination")]
    pub destination: Address,
    #[serde(rename = "Amount")]
    pub amount: i64,
    #[serde(rename = "Source")]
    pub source: Address,
    #[serde(rename = "Fee")]
    pub fee: i64,
}

impl Tx {
    pub fn valid_amounts(&self) -> Result<(), AmountError> {
        check_amounts(self.amount, self.fee)
    }

    /// The minimum source balance this transfer needs: amount plus fee.
    pub fn required_balance(&self) -> i64 {
        self.fee + self.amount
    }

    /// Signs this transfer, minting a fresh random ID.
    pub fn sign(&self, key: &RsaPrivateKey) -> Result<SignedTx, SignError> {
        let payload = serde_json::to_vec(self)?;
        let digest = Md5::digest(&payload);
        let signature = key.sign_with_rng(&mut rand::thread_rng(), pss(), &digest)?;

        let mut stx = SignedTx {
            destination: self.destination.clone(),
            amount: self.amount,
            source: self.source.clone(),
            fee: self.fee,
            id: TxId::random(),
            signature,
            public_key: public_key_der(&key.to_public_key()),
            hash: Hash::EMPTY,
        };
        stx.update_hash()?;
        Ok(stx)
    }
}

// ---------------------------------------------------------------------------
// SignedTx
// ---------------------------------------------------------------------------

/// A transfer plus its signature envelope. The `hash` is the MD5 of the
/// full canonical encoding (signature and ID included) and is the
/// identity the chain uses; it is recomputed after every decode, never
/// transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    #[serde(rename = "Destination")]
    pub destination: Address,
    #[serde(rename = "Amount")]
    pub amount: i64,
    #[serde(rename = "Source")]
    pub source: Address,
    #[serde(rename = "Fee")]
    pub fee: i64,
    #[serde(rename = "ID")]
    pub id: TxId,
    #[serde(rename = "Signature", with = "crate::codec::base64_bytes")]
    pub signature: Vec<u8>,
    #[serde(rename = "PublicKey", with = "crate::codec::base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(skip)]
    pub hash: Hash,
}

impl SignedTx {
    /// Decodes from canonical JSON and recomputes the identity hash.
    pub fn decode(raw: &[u8]) -> Result<SignedTx, serde_json::Error> {
        let mut stx: SignedTx = serde_json::from_slice(raw)?;
        stx.update_hash()?;
        Ok(stx)
    }

    /// Recomputes `hash` from the canonical encoding.
    pub fn update_hash(&mut self) -> Result<(), serde_json::Error> {
        let raw = serde_json::to_vec(self)?;
        self.hash = Hash::digest(&raw);
        Ok(())
    }

    /// The unsigned view, i.e. the bytes the signature covers.
    pub fn tx(&self) -> Tx {
        Tx {
            destination: self.destination.clone(),
            amount: self.amount,
            source: self.source.clone(),
            fee: self.fee,
        }
    }

    pub fn valid_amounts(&self) -> Result<(), AmountError> {
        check_amounts(self.amount, self.fee)
    }

    pub fn required_balance(&self) -> i64 {
        self.fee + self.amount
    }

    /// Checks that the declared source belongs to the embedded public
    /// key (under either address version) and that the signature
    /// verifies over the unsigned encoding.
    pub fn valid_signature(&self) -> Result<(), ValidationError> {
        let key = parse_public_key_der(&self.public_key)
            .map_err(|e| ValidationError::BadSignature(e.to_string()))?;

        let v1 = Address::from_key(Version::V1, &key);
        let v2 = Address::from_key(Version::V2, &key);
        if v1 != self.source && v2 != self.source {
            return Err(ValidationError::AddressMismatch);
        }

        let payload = serde_json::to_vec(&self.tx())
            .map_err(|e| ValidationError::BadSignature(e.to_string()))?;
        let digest = Md5::digest(&payload);
        key.verify(pss(), &digest, &self.signature)
            .map_err(|e| ValidationError::BadSignature(e.to_string()))
    }

    /// Full standalone validation: amounts, then signature.
    pub fn valid(&self) -> Result<(), ValidationError> {
        self.valid_amounts()?;
        self.valid_signature()
    }
}

/// A signed transaction as seen from the local wallet: whether it is
/// included at the current tip, and at what height.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalTx {
    #[serde(flatten)]
    pub tx: SignedTx,
    #[serde(rename = "Included")]
    pub included: bool,
    #[serde(rename = "Height")]
    pub height: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_KEY_BITS;
    use crate::crypto::keys::generate_key;

    fn key_pair(seed: u64) -> (RsaPrivateKey, Address) {
        let key = generate_key(DEFAULT_KEY_BITS, seed).unwrap();
        let addr = Address::from_key(Version::V1, &key.to_public_key());
        (key, addr)
    }

    fn transfer(source: Address, dest: Address, amount: i64, fee: i64) -> Tx {
        Tx {
            destination: dest,
            amount,
            source,
            fee,
        }
    }

    #[test]
    fn sign_then_verify() {
        let (key, source) = key_pair(1);
        let (_, dest) = key_pair(2);

        let stx = transfer(source, dest, 40, 10).sign(&key).unwrap();
        stx.valid().unwrap();
        assert_eq!(stx.required_balance(), 50);
        assert_ne!(stx.hash, Hash::EMPTY);
    }

    #[test]
    fn v2_source_verifies_too() {
        let key = generate_key(DEFAULT_KEY_BITS, 3).unwrap();
        let source = Address::from_key(Version::V2, &key.to_public_key());
        let (_, dest) = key_pair(4);

        let stx = transfer(source, dest, 1, 0).sign(&key).unwrap();
        stx.valid().unwrap();
    }

    #[test]
    fn flipped_signature_bit_is_rejected() {
        let (key, source) = key_pair(5);
        let (_, dest) = key_pair(6);

        let mut stx = transfer(source, dest, 10, 1).sign(&key).unwrap();
        stx.signature[0] ^= 0x01;
        assert!(matches!(
            stx.valid(),
            Err(ValidationError::BadSignature(_))
        ));
    }

    #[test]
    fn source_not_derived_from_key_is_rejected() {
        let (key, _) = key_pair(7);
        let (_, stranger) = key_pair(8);
        let (_, dest) = key_pair(9);

        // Signed by `key`, but the declared source belongs to someone else.
        let stx = transfer(stranger, dest, 10, 1).sign(&key).unwrap();
        assert_eq!(stx.valid(), Err(ValidationError::AddressMismatch));
    }

    #[test]
    fn amount_rules() {
        let (_, a) = key_pair(10);
        let (_, b) = key_pair(11);

        let zero = transfer(a.clone(), b.clone(), 0, 1);
        assert_eq!(zero.valid_amounts(), Err(AmountError::NonPositiveAmount));

        let negative_fee = transfer(a.clone(), b.clone(), 1, -1);
        assert_eq!(negative_fee.valid_amounts(), Err(AmountError::NegativeFee));

        let overflow = transfer(a.clone(), b.clone(), i64::MAX, 1);
        assert_eq!(overflow.valid_amounts(), Err(AmountError::Overflow));

        let ok = transfer(a, b, 1, 0);
        assert!(ok.valid_amounts().is_ok());
    }

    #[test]
    fn canonical_key_order() {
        let (key, source) = key_pair(12);
        let (_, dest) = key_pair(13);

        let tx = transfer(source, dest, 5, 2);
        let unsigned = serde_json::to_string(&tx).unwrap();
        let dest_pos = unsigned.find("\"Destination\"").unwrap();
        let amount_pos = unsigned.find("\"Amount\"").unwrap();
        let source_pos = unsigned.find("\"Source\"").unwrap();
        let fee_pos = unsigned.find("\"Fee\"").unwrap();
        assert!(dest_pos < amount_pos && amount_pos < source_pos && source_pos < fee_pos);

        let stx = tx.sign(&key).unwrap();
        let signed = serde_json::to_string(&stx).unwrap();
        let id_pos = signed.find("\"ID\"").unwrap();
        let sig_pos = signed.find("\"Signature\"").unwrap();
        let key_pos = signed.find("\"PublicKey\"").unwrap();
        assert!(signed.find("\"Fee\"").unwrap() < id_pos);
        assert!(id_pos < sig_pos && sig_pos < key_pos);
        assert!(!signed.contains("\"Hash\""), "hash must never be serialized");
    }

    #[test]
    fn hash_survives_a_round_trip() {
        let (key, source) = key_pair(14);
        let (_, dest) = key_pair(15);

        let stx = transfer(source, dest, 10, 0).sign(&key).unwrap();
        let raw = serde_json::to_vec(&stx).unwrap();
        let back = SignedTx::decode(&raw).unwrap();

        assert_eq!(back.hash, stx.hash);
        assert_eq!(back, stx);
    }

    #[test]
    fn identical_transfers_get_distinct_identities() {
        let (key, source) = key_pair(16);
        let (_, dest) = key_pair(17);

        let tx = transfer(source, dest, 10, 0);
        let a = tx.sign(&key).unwrap();
        let b = tx.sign(&key).unwrap();

        // Random TxIDs keep otherwise-identical transfers apart.
        assert_ne!(a.id, b.id);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn tx_id_hex_round_trip() {
        let id = TxId::random();
        let parsed = TxId::from_hex(&id.to_string()).unwrap();
        assert_eq!(parsed, id);

        assert!(TxId::from_hex("abcd").is_err());
        assert!(TxId::from_hex("zz").is_err());
    }
}
