// src/utils/crypto.rs
//! Cryptographic utilities optimized for blockchain compatibility.
//!
//! Uses Keccak-256 (Ethereum's standard hash function) for all digests, so
//! a document hash computed here matches what the registry contract and the
//! signing wallet see.

use ethers::utils::{hex, keccak256};

/// A 32-byte Keccak-256 digest.
pub type Digest = [u8; 32];

/// Computes a Keccak-256 hash of the input data (Ethereum-compatible).
///
/// # Arguments
/// * `data` - Binary data to hash (as bytes slice)
///
/// # Returns
/// Fixed-size 32-byte array (`[u8; 32]`) containing the hash.
pub fn hash_data(data: &[u8]) -> Digest {
    keccak256(data)
}

/// Renders a digest as `0x`-prefixed lowercase hex.
pub fn digest_to_hex(digest: &Digest) -> String {
    format!("0x{}", hex::encode(digest))
}

/// Parses a `0x`-prefixed (or bare) hex digest.
///
/// Returns `None` unless the input decodes to exactly 32 bytes.
pub fn digest_from_hex(value: &str) -> Option<Digest> {
    let bytes = hex::decode(value.trim_start_matches("0x")).ok()?;
    bytes.try_into().ok()
}
