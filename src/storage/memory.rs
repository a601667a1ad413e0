// src/storage/memory.rs
//! In-process content store.
//!
//! Addresses are CIDv0-shaped: base58btc of a SHA2-256 multihash over the
//! raw bytes. They are stable and collision resistant but do not match the
//! chunked DAG addresses a real IPFS node would produce for the same bytes.

use super::{Cid, ContentStore};
use crate::error::{ChainError, ChainResult};
use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Multihash prefix: sha2-256 code, 32-byte length.
const SHA2_256_MULTIHASH_PREFIX: [u8; 2] = [0x12, 0x20];

#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the address `put` would assign to `data`.
    pub fn address_of(data: &[u8]) -> Cid {
        let mut multihash = SHA2_256_MULTIHASH_PREFIX.to_vec();
        multihash.extend_from_slice(&Sha256::digest(data));
        Cid::new(bs58::encode(multihash).into_string())
    }

    /// Drops a blob, simulating garbage collection on the storage node.
    pub fn evict(&self, cid: &Cid) -> bool {
        self.lock().remove(cid).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Cid, Vec<u8>>> {
        // A poisoned map still holds valid blobs; keep serving them.
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: &[u8]) -> ChainResult<Cid> {
        let cid = Self::address_of(data);
        self.lock().entry(cid.clone()).or_insert_with(|| data.to_vec());
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> ChainResult<Vec<u8>> {
        self.lock()
            .get(cid)
            .cloned()
            .ok_or_else(|| ChainError::ContentUnavailable {
                cid: cid.to_string(),
                reason: "not found".to_string(),
                transient: false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = MemoryContentStore::new();
        let first = store.put(b"train-42 telemetry").await.unwrap();
        let second = store.put(b"train-42 telemetry").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert!(first.as_str().starts_with("Qm"));
        assert_eq!(first.as_str().len(), 46);
    }

    #[tokio::test]
    async fn get_returns_stored_bytes() {
        let store = MemoryContentStore::new();
        let bytes = br#"{"id":"did:peaq:0x01"}"#.to_vec();
        let cid = store.put(&bytes).await.unwrap();

        assert_eq!(assert_ok!(store.get(&cid).await), bytes);
    }

    #[tokio::test]
    async fn distinct_bytes_get_distinct_addresses() {
        let store = MemoryContentStore::new();
        let a = store.put(b"t0").await.unwrap();
        let b = store.put(b"t1").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn evicted_content_is_unavailable_without_retry() {
        let store = MemoryContentStore::new();
        let cid = store.put(b"gone soon").await.unwrap();
        assert!(store.evict(&cid));

        let err = store.get(&cid).await.unwrap_err();
        assert!(matches!(err, ChainError::ContentUnavailable { .. }));
        assert!(!err.is_transient());
    }
}
