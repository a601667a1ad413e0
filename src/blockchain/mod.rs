// src/blockchain/mod.rs
//! Ledger record store: the two on-chain key-value namespaces.
//!
//! - **attribute**: owner-scoped `(owner address, name) -> value`. Insert and
//!   update are distinct operations; inserting over an existing key or
//!   updating a missing key fails with `RecordConflict`.
//! - **item**: `key -> value`, always an upsert.
//!
//! Writes return only once the transaction is final. Intermediate states
//! are published as [`TxProgress`] events for observers that care.

pub mod evm_ledger;
pub mod memory;

use crate::error::{ChainError, ChainResult, Namespace};
use crate::wallet::key_management::{format_address, Keypair};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde::Serialize;

/// Longest attribute name or item key the ledger accepts, in bytes.
pub const MAX_KEY_LEN: usize = 64;
/// Longest attribute value, in bytes.
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 2560;
/// Longest item value once rendered as `0x`-prefixed hex.
pub const MAX_ITEM_VALUE_HEX_LEN: usize = 256;

/// Lifecycle events of a ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TxProgress {
    Submitted {
        operation: &'static str,
        tx_hash: H256,
    },
    Finalized {
        operation: &'static str,
        tx_hash: H256,
        block: u64,
    },
    Failed {
        operation: &'static str,
        tx_hash: Option<H256>,
        reason: String,
    },
}

/// Proof that a write reached finality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block: u64,
}

/// Two-namespace key-value ledger.
#[async_trait]
pub trait LedgerRecordStore: Send + Sync {
    /// First write of `(signer, name)`.
    async fn insert_attribute(&self, signer: &Keypair, name: &str, value: &[u8]) -> ChainResult<TxReceipt>;

    /// Replaces the value of an existing `(signer, name)`.
    async fn update_attribute(&self, signer: &Keypair, name: &str, value: &[u8]) -> ChainResult<TxReceipt>;

    /// Reads `(owner, name)`; `reader` is the account submitting the query.
    async fn read_attribute(&self, reader: Address, owner: Address, name: &str) -> ChainResult<Option<Vec<u8>>>;

    async fn upsert_item(&self, signer: &Keypair, key: &str, value: &[u8]) -> ChainResult<TxReceipt>;

    async fn read_item(&self, reader: Address, key: &str) -> ChainResult<Option<Vec<u8>>>;

    /// Subscribes to write progress events.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TxProgress>;
}

/// Display key for an attribute record.
pub fn attribute_key(owner: Address, name: &str) -> String {
    format!("{}/{}", format_address(owner), name)
}

pub(crate) fn check_attribute(name: &str, value: &[u8]) -> ChainResult<()> {
    check_len(Namespace::Attribute, "name", name.len(), MAX_KEY_LEN)?;
    check_len(Namespace::Attribute, "value", value.len(), MAX_ATTRIBUTE_VALUE_LEN)
}

pub(crate) fn check_item(key: &str, value: &[u8]) -> ChainResult<()> {
    check_len(Namespace::Item, "key", key.len(), MAX_KEY_LEN)?;
    check_len(Namespace::Item, "value", 2 + value.len() * 2, MAX_ITEM_VALUE_HEX_LEN)
}

fn check_len(namespace: Namespace, what: &'static str, actual: usize, limit: usize) -> ChainResult<()> {
    if actual > limit {
        return Err(ChainError::RecordTooLarge {
            namespace,
            what,
            limit,
            actual,
        });
    }
    Ok(())
}
