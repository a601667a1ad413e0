// src/error.rs
//! Error taxonomy for document anchoring.
//!
//! Every failure carries the operation that produced it and the record key
//! involved, so a caller can tell which publish step stopped and resume from
//! there. Only [`ChainError::is_transient`] errors are eligible for retry.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type ChainResult<T> = Result<T, ChainError>;

/// The two ledger namespaces a record can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Owner-scoped `(owner address, document name) -> CID`.
    Attribute,
    /// Content-address-scoped `CID -> signature`.
    Item,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Attribute => f.write_str("attribute"),
            Namespace::Item => f.write_str("item"),
        }
    }
}

/// All errors surfaced by the content store, the ledger and the chain manager.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Network failure talking to the content store or the ledger.
    #[error("transport failure during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// Insert on an existing key, or update on a missing key.
    #[error("{namespace} record conflict for key {key}: {reason}")]
    RecordConflict {
        namespace: Namespace,
        key: String,
        reason: String,
    },

    #[error("{namespace} record not found for key {key}")]
    NotFound { namespace: Namespace, key: String },

    /// The CID is known but its bytes cannot be produced right now.
    #[error("content {cid} unavailable: {reason}")]
    ContentUnavailable {
        cid: String,
        reason: String,
        transient: bool,
    },

    #[error("{operation} did not complete within {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// The signing key is not the key named by the document's controller.
    #[error("controller {controller} is not controlled by signer {signer}")]
    ControllerMismatch { controller: String, signer: String },

    #[error("field `{field}` cannot change between versions ({previous} -> {next})")]
    ImmutableFieldChanged {
        field: &'static str,
        previous: String,
        next: String,
    },

    /// The current head failed verification, so nothing can be chained onto it.
    #[error("head version {cid} of {key} failed verification")]
    HeadUnverified { key: String, cid: String },

    #[error("{namespace} record {what} exceeds limit ({actual} > {limit})")]
    RecordTooLarge {
        namespace: Namespace,
        what: &'static str,
        limit: usize,
        actual: usize,
    },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The ledger definitively rejected a transaction (revert, failed receipt).
    #[error("ledger rejected {operation}: {message}")]
    Ledger {
        operation: &'static str,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChainError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Transport { .. } => true,
            ChainError::ContentUnavailable { transient, .. } => *transient,
            _ => false,
        }
    }

    pub(crate) fn transport(operation: &'static str, err: impl fmt::Display) -> Self {
        ChainError::Transport {
            operation,
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for ChainError {
    fn from(err: config::ConfigError) -> Self {
        ChainError::Config(err.to_string())
    }
}
