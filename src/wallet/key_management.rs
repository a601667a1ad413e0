// src/wallet/key_management.rs
//! Signing keypairs for owners and machines.
//!
//! Provides generation, loading, and usage of the secp256k1 keys that sign
//! anchored documents and submit ledger transactions:
//! - Public address derivation (20-byte Ethereum address)
//! - Recoverable ECDSA signatures over 32-byte digests
//! - Address-based signature verification
//!
//! Uses the following cryptographic primitives:
//! - secp256k1 curve (via `k256` crate)
//! - Keccak-256 address derivation and signature recovery (via `ethers`)

use crate::error::{ChainError, ChainResult};
use crate::utils::crypto::Digest;
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers::types::{Address, Signature, H256};
use ethers::utils::hex;
use k256::ecdsa::SigningKey;
use std::fmt;

/// A signing keypair able to sign digests and expose its public address.
///
/// # Security Notes
/// - The secret key never leaves the wrapped wallet
/// - Signatures are deterministic (RFC 6979) and recoverable, so a verifier
///   only needs the signer's address
#[derive(Clone)]
pub struct Keypair {
    wallet: LocalWallet,
}

impl Keypair {
    /// Generates a keypair from the system RNG.
    ///
    /// Used for machine identities created during fleet enrollment and in tests.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        Self {
            wallet: LocalWallet::from(signing_key),
        }
    }

    /// Loads a keypair from a secret seed.
    ///
    /// # Arguments
    /// * `secret` - Either a hex-encoded private key (with or without `0x`)
    ///   or an English BIP-39 mnemonic phrase
    ///
    /// # Errors
    /// Returns [`ChainError::Config`] if the secret is neither a valid key
    /// nor a valid phrase.
    pub fn from_secret(secret: &str) -> ChainResult<Self> {
        let secret = secret.trim();
        let wallet = if secret.split_whitespace().count() > 1 {
            MnemonicBuilder::<English>::default()
                .phrase(secret)
                .build()
                .map_err(|e| ChainError::Config(format!("invalid mnemonic: {}", e)))?
        } else {
            secret
                .trim_start_matches("0x")
                .parse::<LocalWallet>()
                .map_err(|e| ChainError::Config(format!("invalid private key: {}", e)))?
        };
        Ok(Self { wallet })
    }

    /// The public address identifying this key on the ledger.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Compressed SEC1 public key, `0x`-prefixed hex.
    ///
    /// Published as the verification method's key material.
    pub fn public_key_hex(&self) -> String {
        let point = self.wallet.signer().verifying_key().to_encoded_point(true);
        format!("0x{}", hex::encode(point.as_bytes()))
    }

    /// Signs a 32-byte digest.
    ///
    /// # Returns
    /// 65-byte recoverable ECDSA signature (R || S || V)
    pub fn sign(&self, digest: &Digest) -> ChainResult<Vec<u8>> {
        let signature = self
            .wallet
            .sign_hash(H256::from(*digest))
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        Ok(signature.to_vec())
    }

    /// Hex-encoded private key, `0x`-prefixed.
    ///
    /// Only for handing a freshly generated machine key to its operator.
    pub fn secret_hex(&self) -> String {
        format!("0x{}", hex::encode(self.wallet.signer().to_bytes()))
    }

    /// The underlying wallet, for signing ledger transactions.
    pub(crate) fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &format_address(self.address()))
            .finish()
    }
}

/// Checks that `signature` over `digest` was produced by the key behind `address`.
///
/// Malformed signatures verify as `false` rather than erroring; an invalid
/// signature is an expected outcome of verification.
pub fn verify(digest: &Digest, signature: &[u8], address: Address) -> bool {
    match Signature::try_from(signature) {
        Ok(signature) => signature.verify(H256::from(*digest), address).is_ok(),
        Err(_) => false,
    }
}

/// Recovers the signing address, if the signature is well formed.
pub fn recover_signer(digest: &Digest, signature: &[u8]) -> Option<Address> {
    Signature::try_from(signature)
        .ok()?
        .recover(H256::from(*digest))
        .ok()
}

/// Formats an Ethereum address as a lowercase hex string with 0x prefix.
pub fn format_address(addr: Address) -> String {
    format!("0x{:x}", addr)
}
