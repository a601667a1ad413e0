// src/models/did.rs
//! Decentralized Identifier (DID) data model implementation.
//!
//! Defines the identity document anchored for owners and machines. The
//! document layout follows the shape of the
//! [DID Core Specification](https://www.w3.org/TR/did-core/) with one
//! addition: `prevHash`, which links each version to the Keccak-256 hash of
//! the serialized version before it, forming an append-only history per
//! identity.
//!
//! # DID Format
//! ```text
//! did:<namespace>:0x<40 hex address>
//! ```

use crate::error::{ChainError, ChainResult};
use crate::utils::crypto::{digest_to_hex, hash_data, Digest};
use crate::utils::serialization::serialize;
use crate::wallet::key_management::{format_address, Keypair};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Verification method type for recoverable secp256k1 keys.
pub const SECP256K1_METHOD_TYPE: &str = "EcdsaSecp256k1VerificationKey2019";

/// A parsed `did:<namespace>:<address>` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Did {
    pub namespace: String,
    pub address: Address,
}

impl Did {
    pub fn new(namespace: impl Into<String>, address: Address) -> Self {
        Self {
            namespace: namespace.into(),
            address,
        }
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "did:{}:{}", self.namespace, format_address(self.address))
    }
}

impl FromStr for Did {
    type Err = ChainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("did"), Some(namespace), Some(address)) if !namespace.is_empty() => {
                let address = address
                    .parse::<Address>()
                    .map_err(|_| ChainError::InvalidDocument(format!("bad DID address in {}", value)))?;
                Ok(Did::new(namespace, address))
            }
            _ => Err(ChainError::InvalidDocument(format!("malformed DID {}", value))),
        }
    }
}

/// Key material authorized to act for the DID subject.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VerificationMethod {
    /// Example: "did:peaq:0xab..#keys-1"
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub controller: String,
    /// Compressed SEC1 public key, hex encoded.
    #[serde(rename = "publicKeyHex")]
    pub public_key_material: String,
}

/// A service entry: either an endpoint URI or inline data such as a CID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Example: "#telemetry"
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "data")]
    pub endpoint_or_data: String,
}

/// One version of an entity's identity document.
///
/// `id` and `controller` never change across versions of the same logical
/// document; every other change produces a new version whose `prev_hash`
/// points at [`IdentityDocument::hash`] of the previous one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IdentityDocument {
    pub id: String,
    pub controller: String,
    #[serde(rename = "verificationMethod", default)]
    pub verification_methods: Vec<VerificationMethod>,
    #[serde(rename = "service", default)]
    pub services: Vec<Service>,
    #[serde(rename = "prevHash", default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
}

impl IdentityDocument {
    /// Creates a bare draft with no keys or services.
    pub fn new(id: impl Into<String>, controller: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            controller: controller.into(),
            verification_methods: Vec::new(),
            services: Vec::new(),
            prev_hash: None,
        }
    }

    /// Builds a self-controlled document for `keypair`, with the key
    /// itself as the first verification method.
    pub fn self_controlled(namespace: &str, keypair: &Keypair) -> Self {
        let did = Did::new(namespace, keypair.address()).to_string();
        Self::new(did.clone(), did.clone()).with_verification_method(&did, keypair)
    }

    /// Appends `keypair` as a verification method controlled by `controller`.
    pub fn with_verification_method(mut self, controller: &str, keypair: &Keypair) -> Self {
        let index = self.verification_methods.len() + 1;
        self.verification_methods.push(VerificationMethod {
            id: format!("{}#keys-{}", self.id, index),
            method_type: SECP256K1_METHOD_TYPE.to_string(),
            controller: controller.to_string(),
            public_key_material: keypair.public_key_hex(),
        });
        self
    }

    pub fn with_service(
        mut self,
        id: impl Into<String>,
        service_type: impl Into<String>,
        endpoint_or_data: impl Into<String>,
    ) -> Self {
        self.set_service(id, service_type, endpoint_or_data);
        self
    }

    /// Inserts or replaces the service with the given `id`, keeping order.
    pub fn set_service(
        &mut self,
        id: impl Into<String>,
        service_type: impl Into<String>,
        endpoint_or_data: impl Into<String>,
    ) {
        let service = Service {
            id: id.into(),
            service_type: service_type.into(),
            endpoint_or_data: endpoint_or_data.into(),
        };
        match self.services.iter_mut().find(|s| s.id == service.id) {
            Some(existing) => *existing = service,
            None => self.services.push(service),
        }
    }

    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Canonical bytes stored in the content store.
    pub fn to_bytes(&self) -> ChainResult<Vec<u8>> {
        Ok(serialize(self)?)
    }

    /// Keccak-256 of the canonical bytes; the value later versions carry
    /// as `prev_hash`.
    pub fn hash(&self) -> ChainResult<Digest> {
        Ok(hash_data(&self.to_bytes()?))
    }

    pub fn hash_hex(&self) -> ChainResult<String> {
        Ok(digest_to_hex(&self.hash()?))
    }

    /// Whether this document is the direct successor of `previous`.
    pub fn follows(&self, previous: &IdentityDocument) -> ChainResult<bool> {
        Ok(self.id == previous.id
            && self.controller == previous.controller
            && self.prev_hash.as_deref() == Some(previous.hash_hex()?.as_str()))
    }

    /// Checks the document is complete enough to publish.
    ///
    /// # Errors
    /// - `id` or `controller` is not a well-formed DID
    /// - no verification method is present
    pub fn validate(&self) -> ChainResult<()> {
        self.id.parse::<Did>()?;
        self.controller.parse::<Did>()?;
        if self.verification_methods.is_empty() {
            return Err(ChainError::InvalidDocument(format!(
                "{} has no verification method",
                self.id
            )));
        }
        Ok(())
    }

    pub fn controller_did(&self) -> ChainResult<Did> {
        self.controller.parse()
    }
}
