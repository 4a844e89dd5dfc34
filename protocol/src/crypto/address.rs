//! Key-derived wallet addresses.
//!
//! An address is a truncation of the MD5 digest of a public key's
//! PKCS#1 DER encoding: version 1 keeps the first two bytes, version 2
//! keeps all sixteen. Both versions derived from the same key identify
//! the same owner. Addresses compare by raw bytes and travel as
//! standard Base64 everywhere outside the process.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use rsa::RsaPublicKey;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use super::keys::public_key_der;

/// Address derivation scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    /// Two-byte addresses. Collisions are a feature, not a bug.
    #[default]
    V1,
    /// Full 16-byte digests.
    V2,
}

impl Version {
    /// Numeric form used in the `?version=` query parameter.
    pub fn as_query(self) -> u8 {
        match self {
            Version::V1 => 1,
            Version::V2 => 2,
        }
    }

    /// Parses the `?version=` query parameter.
    pub fn from_query(v: u8) -> Option<Version> {
        match v {
            1 => Some(Version::V1),
            2 => Some(Version::V2),
            _ => None,
        }
    }
}

/// Errors produced when parsing an address from its Base64 form.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("failed to base64 decode address: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// An opaque wallet address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Vec<u8>);

impl Address {
    /// Derives the address of a public key under the given version.
    pub fn from_key(version: Version, key: &RsaPublicKey) -> Address {
        let digest = Md5::digest(public_key_der(key));
        match version {
            Version::V1 => Address(digest[..2].to_vec()),
            Version::V2 => Address(digest.to_vec()),
        }
    }

    /// Parses the Base64 external form.
    pub fn from_base64(s: &str) -> Result<Address, AddressError> {
        Ok(Address(BASE64.decode(s)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(&self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl ToSql for Address {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(Value::Text(self.to_string())))
    }
}

impl FromSql for Address {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(t) => {
                let s = std::str::from_utf8(t).map_err(|e| FromSqlError::Other(Box::new(e)))?;
                Address::from_base64(s).map_err(|e| FromSqlError::Other(Box::new(e)))
            }
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A wallet address together with its public key and balance at the
/// current tip. Served by `GET /api/addresses`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressState {
    #[serde(rename = "Address")]
    pub address: Address,
    #[serde(rename = "PublicKey", with = "crate::codec::base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(rename = "Balance")]
    pub balance: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_key;

    fn test_key() -> RsaPublicKey {
        generate_key(crate::config::DEFAULT_KEY_BITS, 11)
            .unwrap()
            .to_public_key()
    }

    #[test]
    fn v1_is_a_prefix_of_v2() {
        let key = test_key();
        let v1 = Address::from_key(Version::V1, &key);
        let v2 = Address::from_key(Version::V2, &key);

        assert_eq!(v1.len(), 2);
        assert_eq!(v2.len(), 16);
        assert_eq!(v1.as_bytes(), &v2.as_bytes()[..2]);
    }

    #[test]
    fn derivation_is_deterministic() {
        let key = test_key();
        assert_eq!(
            Address::from_key(Version::V2, &key),
            Address::from_key(Version::V2, &key)
        );
    }

    #[test]
    fn base64_round_trip() {
        let addr = Address::from_key(Version::V2, &test_key());
        let parsed = Address::from_base64(&addr.to_string()).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn json_form_is_base64() {
        let addr = Address::from_key(Version::V1, &test_key());
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr));

        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn version_query_mapping() {
        assert_eq!(Version::from_query(1), Some(Version::V1));
        assert_eq!(Version::from_query(2), Some(Version::V2));
        assert_eq!(Version::from_query(0), None);
        assert_eq!(Version::V1.as_query(), 1);
        assert_eq!(Version::V2.as_query(), 2);
    }
}
