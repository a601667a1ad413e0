// src/utils/serialization.rs
//! Serialization utilities for anchored documents.
//!
//! Documents are stored as compact JSON. Struct fields serialize in
//! declaration order and the document model holds no maps, so the same
//! value always produces the same bytes and therefore the same CID.

use serde::{de::DeserializeOwned, Serialize};

/// Serializes a value to canonical compact JSON bytes.
///
/// # Arguments
/// * `data` - The value to serialize (must implement `Serialize`)
///
/// # Returns
/// - `Ok(Vec<u8>)` with the JSON bytes on success
/// - `Err(serde_json::Error)` if serialization fails
pub fn serialize<T: Serialize>(data: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(data)
}

/// Deserializes a value from JSON bytes fetched from the content store.
pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Reading {
        speed: u32,
        line: String,
    }

    #[test]
    fn serialization_is_stable() {
        let reading = Reading {
            speed: 88,
            line: "S1".into(),
        };
        let first = serialize(&reading).unwrap();
        let second = serialize(&reading).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, br#"{"speed":88,"line":"S1"}"#.to_vec());
        assert_eq!(deserialize::<Reading>(&first).unwrap(), reading);
    }
}
