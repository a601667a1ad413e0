// src/storage/ipfs_client.rs
//! IPFS storage client for document content.
//!
//! Provides thread-safe interaction with an IPFS node's HTTP API for:
//! - Storing document bytes and returning their CID
//! - Retrieving bytes by CID with streaming reads
//!
//! # Features
//! - Asynchronous operations using Tokio runtime
//! - Thread-safe client with Arc-based sharing
//! - Exponential backoff on transport failures, never on "not found"
//!
//! # Security Considerations
//! - All stored data is public by default (IPFS is a public network)
//! - Hashes are content-addressable and permanent

use super::{Cid, ContentStore};
use crate::error::{ChainError, ChainResult};
use crate::utils::retry::{retry_transient, RetryPolicy};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::TryStreamExt;
use ipfs_api_backend_hyper::{IpfsApi, IpfsClient, TryFromUri};
use log::debug;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

/// Error fragments IPFS uses when a block definitively does not exist.
const NOT_FOUND_MARKERS: [&str; 3] = ["not found", "no link named", "invalid path"];

/// Thread-safe IPFS client wrapper implementing [`ContentStore`].
///
/// Uses `ipfs-api-backend-hyper` under the hood with:
/// - Automatic connection pooling
/// - Streaming for large files
#[derive(Clone)]
pub struct IpfsStorage {
    /// Shared IPFS client instance (thread-safe via Arc)
    client: Arc<IpfsClient>,
    retry: RetryPolicy,
    /// Upper bound for a single add or cat round trip.
    request_timeout: Duration,
}

impl IpfsStorage {
    /// Creates a new IPFS storage client connected to the node at `api_url`.
    ///
    /// # Arguments
    /// * `api_url` - Node API base, e.g. `http://localhost:5001`
    /// * `retry` - Backoff budget for transport failures
    /// * `request_timeout` - Limit for each individual attempt
    ///
    /// # Errors
    /// Returns [`ChainError::Config`] if the URL cannot be parsed.
    pub fn new(api_url: &str, retry: RetryPolicy, request_timeout: Duration) -> ChainResult<Self> {
        let client = IpfsClient::from_str(api_url)
            .map_err(|e| ChainError::Config(format!("invalid IPFS API url {}: {}", api_url, e)))?;
        Ok(IpfsStorage {
            client: Arc::new(client),
            retry,
            request_timeout,
        })
    }

    /// One `add` round trip.
    ///
    /// The hyper backend's futures are not `Send`, so each call runs on a
    /// dedicated current-thread runtime inside a blocking task.
    async fn add_once(&self, data: Vec<u8>) -> ChainResult<Cid> {
        let client = self.client.clone();
        let limit = self.request_timeout;

        let res = task::spawn_blocking(move || -> ChainResult<Cid> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| ChainError::transport("ipfs.put", e))?;
            rt.block_on(async {
                let reader = Cursor::new(data);
                match tokio::time::timeout(limit, client.add(reader)).await {
                    Ok(Ok(added)) => Ok(Cid::new(added.hash)),
                    Ok(Err(e)) => Err(ChainError::transport("ipfs.put", e)),
                    Err(_) => Err(ChainError::transport("ipfs.put", "request timed out")),
                }
            })
        })
        .await;

        match res {
            Ok(inner) => inner,
            Err(join_err) => Err(ChainError::transport("ipfs.put", join_err)),
        }
    }

    /// One `cat` round trip, classifying the failure.
    async fn cat_once(&self, cid: Cid) -> ChainResult<Vec<u8>> {
        let client = self.client.clone();
        let limit = self.request_timeout;
        let key = cid.to_string();

        let data = task::spawn_blocking(move || -> ChainResult<Vec<u8>> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| unavailable(&key, e.to_string(), true))?;
            rt.block_on(async {
                let read = client
                    .cat(&key)
                    .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                        acc.extend_from_slice(&chunk);
                        Ok(acc)
                    });
                match tokio::time::timeout(limit, read).await {
                    Ok(Ok(value)) => Ok(value.to_vec()),
                    Ok(Err(e)) => {
                        let message = e.to_string();
                        let definitive = is_not_found(&message);
                        Err(unavailable(&key, message, !definitive))
                    }
                    Err(_) => Err(unavailable(&key, "request timed out".to_string(), true)),
                }
            })
        })
        .await;

        match data {
            Ok(inner) => inner,
            Err(join_err) => Err(unavailable(cid.as_str(), join_err.to_string(), true)),
        }
    }
}

fn unavailable(cid: &str, reason: String, transient: bool) -> ChainError {
    ChainError::ContentUnavailable {
        cid: cid.to_string(),
        reason,
        transient,
    }
}

fn is_not_found(message: &str) -> bool {
    let message = message.to_lowercase();
    NOT_FOUND_MARKERS.iter().any(|marker| message.contains(marker))
}

#[async_trait]
impl ContentStore for IpfsStorage {
    /// Stores raw binary data in IPFS.
    ///
    /// # Returns
    /// The CID reported by the node. Adding identical bytes twice yields
    /// the same CID.
    async fn put(&self, data: &[u8]) -> ChainResult<Cid> {
        let data = data.to_vec();
        let cid = retry_transient(&self.retry, "ipfs.put", move || self.add_once(data.clone())).await?;
        debug!("stored {} on IPFS", cid);
        Ok(cid)
    }

    /// Retrieves binary data from IPFS by its CID.
    ///
    /// # Errors
    /// `ContentUnavailable` if the node reports the block missing (no
    /// retry), or if transport failures outlast the retry budget.
    async fn get(&self, cid: &Cid) -> ChainResult<Vec<u8>> {
        retry_transient(&self.retry, "ipfs.get", move || self.cat_once(cid.clone())).await
    }
}
