// src/lib.rs

//! # DID Anchor
//!
//! Anchors versioned identity documents for machines and their owners:
//! document bytes live in a content-addressed store, while a ledger holds
//! `(owner, name) -> CID` and `CID -> signature` records.
//!
//! ## Layout
//! - [`storage`]: content store trait, IPFS and in-memory adapters
//! - [`blockchain`]: ledger record store trait, EVM and in-memory adapters
//! - [`services`]: chain manager, fleet enrollment, telemetry oracle, HTTP API
//! - [`models`], [`wallet`], [`utils`]: documents, keys, hashing and retry

pub mod blockchain;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;
pub mod wallet;

pub use error::{ChainError, ChainResult};
