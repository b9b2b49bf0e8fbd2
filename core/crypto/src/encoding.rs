//! Serde helpers for binary fields stored in JSON records.

/// Serialize byte containers as standard base64 strings.
///
/// Works for `Vec<u8>` and fixed-size arrays; decoding into an array fails
/// when the decoded length does not match.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: TryFrom<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        T::try_from(bytes).map_err(|_| D::Error::custom("unexpected byte length"))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        #[serde(with = "super::base64_bytes")]
        blob: Vec<u8>,
        #[serde(with = "super::base64_bytes")]
        fixed: [u8; 4],
    }

    #[test]
    fn test_roundtrip() {
        let record = Record {
            blob: b"hello".to_vec(),
            fixed: [1, 2, 3, 4],
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"blob":"aGVsbG8=","fixed":"AQIDBA=="}"#);
        assert_eq!(serde_json::from_str::<Record>(&json).unwrap(), record);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let json = r#"{"blob":"","fixed":"AQID"}"#;
        assert!(serde_json::from_str::<Record>(json).is_err());
    }
}
