//! The 16-byte chain digest.
//!
//! Every identity on the chain — blocks, signed transactions, the
//! proof-of-work target — is an MD5 digest of a canonical byte stream.
//! The distinguished all-zero value marks "no parent" and maps to SQL
//! NULL in the store, while in JSON it travels as 32 zero hex digits
//! like any other hash.

use md5::{Digest, Md5};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Size of a chain digest in bytes.
pub const HASH_SIZE: usize = 16;

/// Errors produced when parsing a hash from its hex form.
#[derive(Debug, Error, PartialEq)]
pub enum HashError {
    #[error("failed to hex decode hash: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid hash length, expected {HASH_SIZE}, got {0}")]
    Length(usize),
}

/// An MD5 digest identifying a block or a signed transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    /// The all-zero hash, used as the genesis block's parent marker.
    pub const EMPTY: Hash = Hash([0; HASH_SIZE]);

    /// Digests an arbitrary byte stream.
    pub fn digest(data: &[u8]) -> Hash {
        Hash(Md5::digest(data).into())
    }

    /// Whether this hash satisfies the proof-of-work rule: the first
    /// 18 bits are zero.
    pub fn meets_difficulty(&self) -> bool {
        self.0[0] == 0 && self.0[1] == 0 && self.0[2] & 0xfc == 0
    }

    /// Whether this is the distinguished empty hash.
    pub fn is_empty(&self) -> bool {
        *self == Hash::EMPTY
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Parses the lowercase hex form. The empty string decodes to
    /// [`Hash::EMPTY`].
    pub fn from_hex(s: &str) -> Result<Hash, HashError> {
        let bytes = hex::decode(s)?;
        if bytes.is_empty() {
            return Ok(Hash::EMPTY);
        }
        if bytes.len() != HASH_SIZE {
            return Err(HashError::Length(bytes.len()));
        }
        let mut out = [0; HASH_SIZE];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// The empty hash persists as NULL so the blocks table's self-referencing
// foreign key accepts the genesis row.
impl ToSql for Hash {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        if self.is_empty() {
            Ok(ToSqlOutput::Owned(Value::Null))
        } else {
            Ok(ToSqlOutput::Owned(Value::Text(self.to_string())))
        }
    }
}

impl FromSql for Hash {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Hash::EMPTY),
            ValueRef::Text(t) => {
                let s = std::str::from_utf8(t).map_err(|e| FromSqlError::Other(Box::new(e)))?;
                Hash::from_hex(s).map_err(|e| FromSqlError::Other(Box::new(e)))
            }
            _ => Err(FromSqlError::InvalidType),
        }
    }
}
