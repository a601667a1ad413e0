// src/main.rs

//! # DID Anchor - Main Entry Point
//!
//! Wires the IPFS content store and the EVM ledger into an
//! [`IdentityChainManager`] and dispatches the CLI subcommand.
//!
//! ## Architecture Overview
//! 1. **Ledger Layer**: `EvmLedger` over the attribute/item registry contract
//! 2. **Storage Layer**: `IpfsStorage` for document and telemetry content
//! 3. **Services Layer**: chain manager, fleet enrollment, telemetry oracle, API
//!
//! ## Configuration
//! See [`did_anchor::config`]. The owner key is read from
//! `DID_ANCHOR__OWNER_SECRET` (hex private key or mnemonic).

mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cli::{Commands, DidAnchorCli};
use did_anchor::blockchain::evm_ledger::EvmLedger;
use did_anchor::config::AppConfig;
use did_anchor::models::did::{Did, IdentityDocument};
use did_anchor::services::api_server::ApiServer;
use did_anchor::services::fleet::{FleetRegistrar, Roster};
use did_anchor::services::identity_chain::IdentityChainManager;
use did_anchor::services::oracle::{TelemetryFeed, TelemetryOracle};
use did_anchor::storage::ipfs_client::IpfsStorage;
use did_anchor::utils::serialization::deserialize;
use did_anchor::wallet::key_management::{format_address, Keypair};
use dotenv::dotenv;
use ethers::types::Address;
use log::info;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type Manager = IdentityChainManager<IpfsStorage, EvmLedger>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("did_anchor=info")).init();

    let cli = DidAnchorCli::parse();
    let config_path = cli
        .config
        .as_deref()
        .map(|p| p.to_str().ok_or_else(|| anyhow!("config path is not valid UTF-8")))
        .transpose()?;
    let config = AppConfig::load(config_path).context("failed to load configuration")?;

    if let Commands::Whoami = cli.command {
        let owner = owner_key(&config)?;
        println!("address: {}", format_address(owner.address()));
        println!("did:     {}", Did::new(config.identity.namespace.as_str(), owner.address()));
        return Ok(());
    }

    let manager = connect(&config).await?;

    match cli.command {
        Commands::Serve => {
            let owner = owner_key(&config)?;
            ApiServer::new(manager, owner, config.step_timeout())
                .run(config.server.bind)
                .await
                .context("API server failed")?;
        }
        Commands::Publish(args) => {
            let owner = owner_key(&config)?;
            let document = read_document(&args.document)?;
            let cid = manager
                .publish_document(&owner, &args.name, &document, args.first)
                .await?;
            println!("{}", cid);
        }
        Commands::Verify(args) => {
            let owner: Address = args
                .owner
                .parse()
                .map_err(|_| anyhow!("invalid owner address {}", args.owner))?;
            // Reads need a sender address but no funds.
            let reader = match &config.owner_secret {
                Some(secret) => Keypair::from_secret(secret)?,
                None => Keypair::generate(),
            };
            let report = manager.verify_document(owner, &args.name, &reader).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(2);
            }
        }
        Commands::Append(args) => {
            let owner = owner_key(&config)?;
            let document = read_document(&args.document)?;
            let cid = manager.publish_next_version(&owner, &args.name, document).await?;
            println!("{}", cid);
        }
        Commands::Enroll(args) => {
            let owner = owner_key(&config)?;
            let roster = Roster::from_file(&args.roster)?;
            let registrar = FleetRegistrar::new(manager, config.identity.namespace.as_str());
            let report = registrar.enroll(&owner, &roster).await?;
            for enrollment in &report.enrolled {
                println!(
                    "{}\t{}\t{}\t{}",
                    enrollment.train_id,
                    enrollment.did,
                    enrollment.cid,
                    enrollment.machine.secret_hex()
                );
            }
            for skipped in &report.skipped {
                println!("{}\tskipped", skipped);
            }
        }
        Commands::Oracle(args) => {
            let owner = owner_key(&config)?;
            let feed = TelemetryFeed::from_file(&args.feed)?;
            let interval = args
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.oracle_interval());
            let oracle = TelemetryOracle::new(manager, config.step_timeout());

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing current reading");
                    let _ = shutdown_tx.send(true);
                }
            });

            let stats = oracle.run(&owner, &args.name, feed, interval, shutdown_rx).await;
            println!("published {} readings, {} failed", stats.published, stats.failed);
        }
        Commands::Whoami => {}
    }
    Ok(())
}

async fn connect(config: &AppConfig) -> Result<Manager> {
    let content = IpfsStorage::new(&config.ipfs.api_url, config.retry.clone(), config.ipfs_request_timeout())
        .context("failed to create IPFS client")?;
    let ledger = EvmLedger::connect(&config.ledger, config.retry.clone())
        .await
        .with_context(|| format!("failed to connect to {}", config.ledger.rpc_url))?;
    info!("connected to chain {} at {}", ledger.chain_id(), config.ledger.rpc_url);

    Ok(IdentityChainManager::new(
        Arc::new(content),
        Arc::new(ledger),
        config.step_timeout(),
    ))
}

fn owner_key(config: &AppConfig) -> Result<Keypair> {
    let secret = config
        .owner_secret
        .as_deref()
        .ok_or_else(|| anyhow!("owner key missing; set DID_ANCHOR__OWNER_SECRET"))?;
    Ok(Keypair::from_secret(secret)?)
}

fn read_document(path: &Path) -> Result<IdentityDocument> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    deserialize(&bytes).with_context(|| format!("{} is not an identity document", path.display()))
}
