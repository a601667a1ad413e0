// src/config.rs
//! Application configuration.
//!
//! Values are layered, later sources winning:
//! 1. Built-in defaults (local IPFS node, peaq agung testnet RPC)
//! 2. Optional `did-anchor.toml` (or the file passed on the command line)
//! 3. Environment variables prefixed `DID_ANCHOR__`, nested with `__`,
//!    e.g. `DID_ANCHOR__LEDGER__RPC_URL`
//!
//! A `.env` file is loaded into the environment first by the binary.

use crate::error::ChainResult;
use crate::utils::retry::RetryPolicy;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "did-anchor";
pub const ENV_PREFIX: &str = "DID_ANCHOR";

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub rpc_url: String,
    /// Address of the attribute/item registry contract.
    pub registry_address: String,
    /// Blocks to wait before a write counts as final.
    pub confirmations: usize,
    pub finality_timeout_secs: u64,
    /// Delay between receipt polls while waiting for finality.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpfsConfig {
    pub api_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// DID method namespace, the `peaq` in `did:peaq:0x…`.
    pub namespace: String,
    /// Limit for each store or ledger step of a publish or verify.
    pub step_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub ipfs: IpfsConfig,
    pub retry: RetryPolicy,
    pub identity: IdentityConfig,
    pub oracle: OracleConfig,
    pub server: ServerConfig,
    /// Hex private key or BIP-39 mnemonic of the owner account.
    pub owner_secret: Option<String>,
}

impl AppConfig {
    /// Loads configuration from defaults, `file` (or the default file name
    /// if present), and the environment.
    pub fn load(file: Option<&str>) -> ChainResult<Self> {
        let file_source = match file {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = Self::defaults()?
            .add_source(file_source)
            .add_source(Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    fn defaults() -> ChainResult<config::ConfigBuilder<config::builder::DefaultState>> {
        let retry = RetryPolicy::default();
        Ok(Config::builder()
            .set_default("ledger.rpc_url", "https://rpcpc1-qa.agung.peaq.network")?
            .set_default("ledger.registry_address", "0x0000000000000000000000000000000000000800")?
            .set_default("ledger.confirmations", 2_i64)?
            .set_default("ledger.finality_timeout_secs", 120_i64)?
            .set_default("ledger.poll_interval_ms", 2_000_i64)?
            .set_default("ipfs.api_url", "http://localhost:5001")?
            .set_default("ipfs.request_timeout_secs", 30_i64)?
            .set_default("retry.initial_interval_ms", retry.initial_interval_ms as i64)?
            .set_default("retry.max_interval_ms", retry.max_interval_ms as i64)?
            .set_default("retry.max_elapsed_ms", retry.max_elapsed_ms as i64)?
            .set_default("identity.namespace", "peaq")?
            .set_default("identity.step_timeout_secs", 180_i64)?
            .set_default("oracle.interval_secs", 120_i64)?
            .set_default("server.bind", "127.0.0.1:3000")?)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.identity.step_timeout_secs)
    }

    pub fn ipfs_request_timeout(&self) -> Duration {
        Duration::from_secs(self.ipfs.request_timeout_secs)
    }

    pub fn oracle_interval(&self) -> Duration {
        Duration::from_secs(self.oracle.interval_secs)
    }
}
