//! Serde adapters for the wire encodings.
//!
//! Binary fields travel as strings in the canonical JSON: signatures and
//! public keys as standard Base64, digests and transaction IDs as
//! lowercase hex. These helpers plug into `#[serde(with = ...)]`.

/// Base64 (standard alphabet, padded) encoding for byte vectors.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn base64_round_trip() {
        let w = Wrapper {
            data: vec![0, 1, 2, 0xff],
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"data":"AAEC/w=="}"#);

        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, w.data);
    }

    #[test]
    fn base64_rejects_garbage() {
        let err = serde_json::from_str::<Wrapper>(r#"{"data":"!!!"}"#);
        assert!(err.is_err());
    }
}
