// src/blockchain/evm_ledger.rs
//! EVM ledger client implementation.
//!
//! Provides the [`LedgerRecordStore`] adapter for a registry contract that
//! exposes an attribute namespace and a storage-item namespace (the shape
//! of peaq's DID and storage precompiles). Transactions are signed locally
//! with the caller's keypair and a write returns only after the configured
//! number of confirmations.
//!
//! The transaction hash is derived from the signed bytes before broadcast.
//! Once a write has been sent, every later step polls for that hash; the
//! write is never rebuilt or re-checked, so a slow or flaky node cannot
//! turn a landed write into a second submission.

use super::{attribute_key, check_attribute, check_item, LedgerRecordStore, TxProgress, TxReceipt};
use crate::config::LedgerConfig;
use crate::error::{ChainError, ChainResult, Namespace};
use crate::utils::retry::{retry_transient, RetryPolicy};
use crate::wallet::key_management::Keypair;
use async_trait::async_trait;
use ethers::abi::Abi;
use ethers::contract::{BaseContract, Contract, ContractError};
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionReceipt, TransactionRequest, H256, U64};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Ledger client for the on-chain record registry.
///
/// The client holds only the RPC provider and contract description. Writes
/// are signed with the caller's keypair, so no wallet state is shared
/// between operations.
pub struct EvmLedger {
    /// JSON-RPC provider
    provider: Provider<Http>,
    chain_id: u64,
    registry: Address,
    abi: BaseContract,
    confirmations: usize,
    finality_timeout: Duration,
    poll_interval: Duration,
    retry: RetryPolicy,
    progress: broadcast::Sender<TxProgress>,
}

impl EvmLedger {
    /// Opens a client against the configured RPC endpoint.
    ///
    /// # Errors
    /// Returns error if:
    /// - RPC URL or registry address is invalid
    /// - Chain ID cannot be retrieved within the retry budget
    pub async fn connect(config: &LedgerConfig, retry: RetryPolicy) -> ChainResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| ChainError::Config(format!("invalid RPC url {}: {}", config.rpc_url, e)))?;
        let registry: Address = config
            .registry_address
            .parse()
            .map_err(|e| ChainError::Config(format!("invalid registry address: {}", e)))?;
        let abi = Abi::load(&include_bytes!("../abi/RecordRegistry.json")[..])
            .map_err(|e| ChainError::Config(format!("invalid registry ABI: {}", e)))?;

        let rpc = &provider;
        let chain_id = retry_transient(&retry, "ledger.chain_id", move || async move {
            rpc
                .get_chainid()
                .await
                .map_err(|e| ChainError::transport("ledger.chain_id", e))
        })
        .await?
        .as_u64();
        info!("connected to chain {} at {}", chain_id, config.rpc_url);

        let (progress, _) = broadcast::channel(256);
        Ok(Self {
            provider,
            chain_id,
            registry,
            abi: BaseContract::from(abi),
            confirmations: config.confirmations,
            finality_timeout: Duration::from_secs(config.finality_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            retry,
            progress,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn reader(&self) -> Contract<Provider<Http>> {
        Contract::new(self.registry, self.abi.clone(), Arc::new(self.provider.clone()))
    }

    fn emit(&self, event: TxProgress) {
        // Nobody listening is fine.
        let _ = self.progress.send(event);
    }

    /// Builds and signs a registry call from `signer`.
    ///
    /// Returns the raw transaction and its hash. Nonce, gas price and gas
    /// estimation are read-only and retried on transport faults.
    async fn prepare(&self, signer: &Keypair, operation: &'static str, data: Bytes) -> ChainResult<(Bytes, H256)> {
        let from = signer.address();
        let rpc = &self.provider;

        let nonce = retry_transient(&self.retry, operation, move || async move {
            rpc
                .get_transaction_count(from, Some(BlockNumber::Pending.into()))
                .await
                .map_err(|e| classify_rpc(operation, e))
        })
        .await?;
        let gas_price = retry_transient(&self.retry, operation, move || async move {
            rpc.get_gas_price().await.map_err(|e| classify_rpc(operation, e))
        })
        .await?;

        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(self.registry)
            .data(data)
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(self.chain_id)
            .into();
        let draft = &tx;
        let gas = retry_transient(&self.retry, operation, move || async move {
            rpc.estimate_gas(draft, None).await.map_err(|e| classify_rpc(operation, e))
        })
        .await?;
        tx.set_gas(gas);

        let signature = signer
            .wallet()
            .sign_transaction_sync(&tx)
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        Ok((tx.rlp_signed(&signature), tx.hash(&signature)))
    }

    /// Submits one transaction and waits for finality.
    ///
    /// # Process Flow
    /// 1. Encodes and signs the call with the caller's key
    /// 2. Broadcasts it (`Submitted`); a node that already holds it counts
    /// 3. Polls for the receipt until `confirmations` blocks, bounded by
    ///    `finality_timeout`
    /// 4. Checks the receipt status (`Finalized` or `Failed`)
    async fn submit(
        &self,
        signer: &Keypair,
        operation: &'static str,
        method: &str,
        key: String,
        value: Bytes,
    ) -> ChainResult<TxReceipt> {
        let data = self
            .abi
            .encode(method, (key, value))
            .map_err(|e| ChainError::Ledger {
                operation,
                message: e.to_string(),
            })?;
        let (raw, tx_hash) = self.prepare(signer, operation, data).await?;

        let rpc = &self.provider;
        let raw = &raw;
        let sent = retry_transient(&self.retry, operation, move || async move {
            match rpc.send_raw_transaction(raw.clone()).await {
                Ok(_) => Ok(()),
                Err(e) if already_known(&e) => Ok(()),
                Err(e) => Err(classify_rpc(operation, e)),
            }
        })
        .await;
        if let Err(err) = sent {
            self.emit(TxProgress::Failed {
                operation,
                tx_hash: None,
                reason: err.to_string(),
            });
            return Err(err);
        }
        self.emit(TxProgress::Submitted { operation, tx_hash });
        debug!("{} submitted as {:?}", operation, tx_hash);

        let receipt = match tokio::time::timeout(self.finality_timeout, self.await_receipt(operation, tx_hash)).await {
            Ok(receipt) => receipt,
            Err(_) => {
                let timeout = ChainError::Timeout {
                    operation,
                    limit: self.finality_timeout,
                };
                return Err(self.fail(operation, tx_hash, timeout));
            }
        };

        if receipt.status != Some(U64::from(1)) {
            let reverted = ChainError::Ledger {
                operation,
                message: format!("transaction {:?} reverted", tx_hash),
            };
            return Err(self.fail(operation, tx_hash, reverted));
        }

        let block = receipt.block_number.map(|b| b.as_u64()).unwrap_or_default();
        self.emit(TxProgress::Finalized {
            operation,
            tx_hash,
            block,
        });
        info!("{} finalized in block {}", operation, block);
        Ok(TxReceipt { tx_hash, block })
    }

    /// Polls until `tx_hash` is mined with enough confirmations.
    ///
    /// Poll failures are logged and polled again; the caller bounds the wait.
    async fn await_receipt(&self, operation: &'static str, tx_hash: H256) -> TransactionReceipt {
        let needed = self.confirmations.max(1) as u64;
        loop {
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => match receipt.block_number {
                    Some(_) if needed == 1 => return receipt,
                    Some(mined) => match self.provider.get_block_number().await {
                        Ok(head) if head.as_u64() + 1 >= mined.as_u64() + needed => return receipt,
                        Ok(_) => {}
                        Err(e) => warn!("{}: block number poll failed: {}", operation, e),
                    },
                    None => {}
                },
                Ok(None) => {}
                Err(e) => warn!("{}: receipt poll for {:?} failed: {}", operation, tx_hash, e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn fail(&self, operation: &'static str, tx_hash: H256, err: ChainError) -> ChainError {
        self.emit(TxProgress::Failed {
            operation,
            tx_hash: Some(tx_hash),
            reason: err.to_string(),
        });
        err
    }

    async fn read_attribute_once(&self, reader: Address, owner: Address, name: String) -> ChainResult<Option<Vec<u8>>> {
        let value: Bytes = self
            .reader()
            .method::<_, Bytes>("readAttribute", (owner, name))
            .map_err(|e| ChainError::Ledger {
                operation: "ledger.read_attribute",
                message: e.to_string(),
            })?
            .from(reader)
            .call()
            .await
            .map_err(|e| classify("ledger.read_attribute", e))?;
        Ok(non_empty(value))
    }

    async fn read_item_once(&self, reader: Address, key: String) -> ChainResult<Option<Vec<u8>>> {
        let value: Bytes = self
            .reader()
            .method::<_, Bytes>("getItem", (key,))
            .map_err(|e| ChainError::Ledger {
                operation: "ledger.read_item",
                message: e.to_string(),
            })?
            .from(reader)
            .call()
            .await
            .map_err(|e| classify("ledger.read_item", e))?;
        Ok(non_empty(value))
    }

    async fn write_attribute(
        &self,
        signer: &Keypair,
        name: &str,
        value: &[u8],
        insert: bool,
    ) -> ChainResult<TxReceipt> {
        check_attribute(name, value)?;
        let owner = signer.address();
        let (operation, method) = if insert {
            ("ledger.insert_attribute", "addAttribute")
        } else {
            ("ledger.update_attribute", "updateAttribute")
        };

        // The registry reverts on the wrong write kind; checking first turns
        // that revert into a precise conflict. The check runs once, before
        // anything is signed.
        let existing = retry_transient(&self.retry, "ledger.read_attribute", move || {
            self.read_attribute_once(owner, owner, name.to_string())
        })
        .await?;
        match (insert, existing.is_some()) {
            (true, true) => {
                return Err(ChainError::RecordConflict {
                    namespace: Namespace::Attribute,
                    key: attribute_key(owner, name),
                    reason: "insert on existing attribute".to_string(),
                })
            }
            (false, false) => {
                return Err(ChainError::RecordConflict {
                    namespace: Namespace::Attribute,
                    key: attribute_key(owner, name),
                    reason: "update on missing attribute".to_string(),
                })
            }
            _ => {}
        }
        self.submit(signer, operation, method, name.to_string(), Bytes::from(value.to_vec()))
            .await
    }
}

fn non_empty(value: Bytes) -> Option<Vec<u8>> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_vec())
    }
}

/// Reverts are definitive; anything else is treated as a transport fault.
fn classify<M: Middleware>(operation: &'static str, err: ContractError<M>) -> ChainError {
    match err {
        ContractError::Revert(data) => ChainError::Ledger {
            operation,
            message: format!("reverted: {}", data),
        },
        other => ChainError::transport(operation, other),
    }
}

/// A JSON-RPC error response is the node's answer; anything else is a
/// transport fault.
fn classify_rpc(operation: &'static str, err: ProviderError) -> ChainError {
    match err.as_error_response() {
        Some(response) => ChainError::Ledger {
            operation,
            message: response.message.clone(),
        },
        None => ChainError::transport(operation, err),
    }
}

/// Node already holds this exact transaction, e.g. from an earlier attempt
/// whose response was lost.
fn already_known(err: &ProviderError) -> bool {
    err.as_error_response().map_or(false, |response| {
        let message = response.message.to_lowercase();
        message.contains("already known") || message.contains("known transaction")
    })
}

#[async_trait]
impl LedgerRecordStore for EvmLedger {
    async fn insert_attribute(&self, signer: &Keypair, name: &str, value: &[u8]) -> ChainResult<TxReceipt> {
        self.write_attribute(signer, name, value, true).await
    }

    async fn update_attribute(&self, signer: &Keypair, name: &str, value: &[u8]) -> ChainResult<TxReceipt> {
        self.write_attribute(signer, name, value, false).await
    }

    async fn read_attribute(&self, reader: Address, owner: Address, name: &str) -> ChainResult<Option<Vec<u8>>> {
        retry_transient(&self.retry, "ledger.read_attribute", move || {
            self.read_attribute_once(reader, owner, name.to_string())
        })
        .await
    }

    async fn upsert_item(&self, signer: &Keypair, key: &str, value: &[u8]) -> ChainResult<TxReceipt> {
        check_item(key, value)?;
        self.submit(
            signer,
            "ledger.upsert_item",
            "addItem",
            key.to_string(),
            Bytes::from(value.to_vec()),
        )
        .await
    }

    async fn read_item(&self, reader: Address, key: &str) -> ChainResult<Option<Vec<u8>>> {
        retry_transient(&self.retry, "ledger.read_item", move || {
            self.read_item_once(reader, key.to_string())
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<TxProgress> {
        self.progress.subscribe()
    }
}
