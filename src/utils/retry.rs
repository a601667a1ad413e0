// src/utils/retry.rs
//! Bounded exponential backoff for network round trips.
//!
//! Store and ledger adapters wrap each remote call in [`retry_transient`].
//! Errors classified as transient by [`ChainError::is_transient`] are retried
//! until the elapsed-time budget runs out; everything else (conflicts,
//! definitive not-found answers, reverts) is returned immediately.

use crate::error::{ChainError, ChainResult};
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use log::warn;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Retry budget shared by the IPFS and ledger adapters.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Total time budget; once exceeded the last error is surfaced.
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 10_000,
            max_elapsed_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn none() -> Self {
        Self {
            initial_interval_ms: 1,
            max_interval_ms: 1,
            max_elapsed_ms: 0,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.max_elapsed_ms)))
            .build()
    }
}

/// Runs `op` until it succeeds, fails permanently, or the budget is spent.
///
/// # Arguments
/// * `policy` - Backoff intervals and total budget
/// * `operation` - Name used in log lines
/// * `op` - Factory producing one attempt per call
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> ChainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChainResult<T>>,
{
    retry(policy.backoff(), || {
        let attempt = op();
        async move {
            attempt.await.map_err(|err| {
                if err.is_transient() {
                    warn!("{} failed, retrying: {}", operation, err);
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        }
    })
    .await
}

/// Bounds a single suspension point by `limit`.
pub async fn within<T, Fut>(limit: Duration, operation: &'static str, fut: Fut) -> ChainResult<T>
where
    Fut: Future<Output = ChainResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout { operation, limit }),
    }
}
