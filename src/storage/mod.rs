// src/storage/mod.rs
//! Content-addressed document storage.
//!
//! The chain manager only needs two calls from a store: `put` bytes and get
//! back a stable content address, and `get` the bytes behind an address.
//! Implementations must be idempotent (same bytes, same CID) and must not
//! retry a definitive "not found" answer.

pub mod ipfs_client;
pub mod memory;

use crate::error::ChainResult;
use crate::utils::crypto::{hash_data, Digest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A content address returned by a [`ContentStore`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn new(value: impl Into<String>) -> Self {
        Cid(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keccak-256 of the address string; this digest is what owners sign.
    pub fn digest(&self) -> Digest {
        hash_data(self.0.as_bytes())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-addressed blob store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Stores `data` and returns its content address.
    async fn put(&self, data: &[u8]) -> ChainResult<Cid>;

    /// Returns the bytes behind `cid`.
    ///
    /// Fails with `ContentUnavailable` when the store cannot produce them.
    async fn get(&self, cid: &Cid) -> ChainResult<Vec<u8>>;
}
