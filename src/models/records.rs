// src/models/records.rs
//! Ledger-side records and verification outcomes.

use crate::models::did::IdentityDocument;
use crate::storage::Cid;
use crate::utils::crypto::{digest_to_hex, Digest};
use crate::wallet::key_management::format_address;
use ethers::types::Address;
use ethers::utils::hex;
use serde::{Serialize, Serializer};

/// The signature stored in the item namespace under a document's CID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureRecord {
    /// Address recovered from the signature, if it is well formed.
    #[serde(serialize_with = "serialize_signer")]
    pub signer: Option<Address>,
    #[serde(serialize_with = "serialize_digest")]
    pub hash_signed: Digest,
    #[serde(serialize_with = "serialize_bytes")]
    pub signature: Vec<u8>,
}

/// Why a fetched document did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFailure {
    /// No item record exists for the CID.
    SignatureMissing,
    /// The item record is not a recoverable signature.
    SignatureMalformed,
    /// The signature recovers to some other key.
    SignerMismatch,
}

/// Result of verifying the current version of a document.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub valid: bool,
    pub cid: Cid,
    pub document: IdentityDocument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<VerificationFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureRecord>,
}

impl VerificationReport {
    pub fn valid(cid: Cid, document: IdentityDocument, signature: SignatureRecord) -> Self {
        Self {
            valid: true,
            cid,
            document,
            failure: None,
            signature: Some(signature),
        }
    }

    pub fn invalid(cid: Cid, document: IdentityDocument, failure: VerificationFailure) -> Self {
        Self {
            valid: false,
            cid,
            document,
            failure: Some(failure),
            signature: None,
        }
    }
}

fn serialize_signer<S: Serializer>(signer: &Option<Address>, s: S) -> Result<S::Ok, S::Error> {
    match signer {
        Some(address) => s.serialize_some(&format_address(*address)),
        None => s.serialize_none(),
    }
}

fn serialize_digest<S: Serializer>(digest: &Digest, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&digest_to_hex(digest))
}

fn serialize_bytes<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{}", hex::encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::key_management::Keypair;

    #[test]
    fn report_serializes_hex_fields() {
        let keypair = Keypair::generate();
        let cid = Cid::new("QmA");
        let digest = cid.digest();
        let record = SignatureRecord {
            signer: Some(keypair.address()),
            hash_signed: digest,
            signature: keypair.sign(&digest).unwrap(),
        };
        let report = VerificationReport::valid(
            cid,
            IdentityDocument::self_controlled("peaq", &keypair),
            record,
        );
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["valid"], true);
        assert_eq!(json["cid"], "QmA");
        assert_eq!(json["signature"]["signer"], format_address(keypair.address()));
        assert_eq!(json["signature"]["hash_signed"], digest_to_hex(&digest));
        assert_eq!(json["signature"]["signature"].as_str().unwrap().len(), 2 + 130);
        assert!(json.get("failure").is_none());
    }

    #[test]
    fn invalid_report_names_the_failure() {
        let keypair = Keypair::generate();
        let report = VerificationReport::invalid(
            Cid::new("QmA"),
            IdentityDocument::self_controlled("peaq", &keypair),
            VerificationFailure::SignatureMissing,
        );
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["valid"], false);
        assert_eq!(json["failure"], "signature_missing");
        assert!(json.get("signature").is_none());
    }
}
