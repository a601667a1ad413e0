//! # CLI Interface
//!
//! Command-line argument structure for `did-anchor`, using `clap` derive.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Anchors identity documents on a ledger with content on IPFS.
#[derive(Parser, Debug)]
#[command(name = "did-anchor", version, propagate_version = true)]
pub struct DidAnchorCli {
    /// Configuration file (TOML, YAML or JSON). Defaults to `did-anchor.*`
    /// in the working directory when present.
    #[arg(long, short = 'c', global = true, env = "DID_ANCHOR_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the HTTP API.
    Serve,
    /// Publish a document version from a JSON file.
    Publish(PublishArgs),
    /// Verify the current version of `(owner, name)`.
    Verify(VerifyArgs),
    /// Append a chained version on top of the verified head.
    Append(AppendArgs),
    /// Enroll every train in a roster file.
    Enroll(EnrollArgs),
    /// Feed telemetry readings into a document's history.
    Oracle(OracleArgs),
    /// Print the owner address and DID.
    Whoami,
}

#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Document name, the attribute key under the owner.
    pub name: String,
    /// Path to the identity document JSON.
    pub document: PathBuf,
    /// Insert as the first version instead of updating.
    #[arg(long)]
    pub first: bool,
}

#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Owner address, `0x`-prefixed.
    pub owner: String,
    pub name: String,
}

#[derive(Parser, Debug)]
pub struct AppendArgs {
    pub name: String,
    /// Path to the next version's JSON; `prevHash` is filled in.
    pub document: PathBuf,
}

#[derive(Parser, Debug)]
pub struct EnrollArgs {
    /// Roster file: `{ "trains": [{ "id", "admin" }] }`.
    pub roster: PathBuf,
}

#[derive(Parser, Debug)]
pub struct OracleArgs {
    /// Document name of the machine, as enrolled.
    pub name: String,
    /// Readings file: a JSON array, or an object keyed `t0`, `t1`, ...
    pub feed: PathBuf,
    /// Seconds between readings; overrides `oracle.interval_secs`.
    #[arg(long)]
    pub interval_secs: Option<u64>,
}
