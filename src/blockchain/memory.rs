// src/blockchain/memory.rs
//! In-process ledger with the same write rules as the on-chain registry.
//!
//! Every write is final immediately. Writes to the same key are serialized
//! by a single lock, mirroring the per-key ordering a real ledger provides.
//! Failure injection hooks let tests interrupt a publish between steps.

use super::{attribute_key, check_attribute, check_item, LedgerRecordStore, TxProgress, TxReceipt};
use crate::error::{ChainError, ChainResult, Namespace};
use crate::utils::crypto::hash_data;
use crate::wallet::key_management::Keypair;
use async_trait::async_trait;
use ethers::types::{Address, H256};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Default)]
struct Records {
    attributes: HashMap<(Address, String), Vec<u8>>,
    items: HashMap<String, Vec<u8>>,
}

pub struct MemoryLedger {
    records: Mutex<Records>,
    block: AtomicU64,
    attribute_writes: AtomicUsize,
    item_writes: AtomicUsize,
    fail_next_item_write: AtomicBool,
    progress: broadcast::Sender<TxProgress>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        let (progress, _) = broadcast::channel(64);
        Self {
            records: Mutex::new(Records::default()),
            block: AtomicU64::new(0),
            attribute_writes: AtomicUsize::new(0),
            item_writes: AtomicUsize::new(0),
            fail_next_item_write: AtomicBool::new(false),
            progress,
        }
    }

    /// Makes the next `upsert_item` fail with a transport error.
    pub fn fail_next_item_write(&self) {
        self.fail_next_item_write.store(true, Ordering::SeqCst);
    }

    /// Successful attribute inserts and updates so far.
    pub fn attribute_writes(&self) -> usize {
        self.attribute_writes.load(Ordering::SeqCst)
    }

    pub fn item_writes(&self) -> usize {
        self.item_writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Emits the progress pair for a write and returns its receipt.
    fn finalize(&self, operation: &'static str, key: &str, value: &[u8]) -> TxReceipt {
        let block = self.block.fetch_add(1, Ordering::SeqCst) + 1;
        let mut preimage = key.as_bytes().to_vec();
        preimage.extend_from_slice(value);
        preimage.extend_from_slice(&block.to_be_bytes());
        let tx_hash = H256::from(hash_data(&preimage));

        // No subscribers is fine.
        let _ = self.progress.send(TxProgress::Submitted { operation, tx_hash });
        let _ = self.progress.send(TxProgress::Finalized {
            operation,
            tx_hash,
            block,
        });
        debug!("{} {} finalized in block {}", operation, key, block);
        TxReceipt { tx_hash, block }
    }
}

#[async_trait]
impl LedgerRecordStore for MemoryLedger {
    async fn insert_attribute(&self, signer: &Keypair, name: &str, value: &[u8]) -> ChainResult<TxReceipt> {
        check_attribute(name, value)?;
        let owner = signer.address();
        let key = attribute_key(owner, name);
        {
            let mut records = self.lock();
            let slot = (owner, name.to_string());
            if records.attributes.contains_key(&slot) {
                return Err(ChainError::RecordConflict {
                    namespace: Namespace::Attribute,
                    key,
                    reason: "insert on existing attribute".to_string(),
                });
            }
            records.attributes.insert(slot, value.to_vec());
        }
        self.attribute_writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.finalize("ledger.insert_attribute", &key, value))
    }

    async fn update_attribute(&self, signer: &Keypair, name: &str, value: &[u8]) -> ChainResult<TxReceipt> {
        check_attribute(name, value)?;
        let owner = signer.address();
        let key = attribute_key(owner, name);
        {
            let mut records = self.lock();
            match records.attributes.get_mut(&(owner, name.to_string())) {
                Some(existing) => *existing = value.to_vec(),
                None => {
                    return Err(ChainError::RecordConflict {
                        namespace: Namespace::Attribute,
                        key,
                        reason: "update on missing attribute".to_string(),
                    })
                }
            }
        }
        self.attribute_writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.finalize("ledger.update_attribute", &key, value))
    }

    async fn read_attribute(&self, _reader: Address, owner: Address, name: &str) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.lock().attributes.get(&(owner, name.to_string())).cloned())
    }

    async fn upsert_item(&self, _signer: &Keypair, key: &str, value: &[u8]) -> ChainResult<TxReceipt> {
        check_item(key, value)?;
        if self.fail_next_item_write.swap(false, Ordering::SeqCst) {
            let _ = self.progress.send(TxProgress::Failed {
                operation: "ledger.upsert_item",
                tx_hash: None,
                reason: "injected failure".to_string(),
            });
            return Err(ChainError::transport("ledger.upsert_item", "injected failure"));
        }
        self.lock().items.insert(key.to_string(), value.to_vec());
        self.item_writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.finalize("ledger.upsert_item", key, value))
    }

    async fn read_item(&self, _reader: Address, key: &str) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.lock().items.get(key).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<TxProgress> {
        self.progress.subscribe()
    }
}
