// src/services/identity_chain.rs
//! Identity Chain Manager
//!
//! Orchestrates anchoring of identity documents:
//! - **Publish**: serialize → store content (CID) → hash the CID → sign the
//!   hash → attribute `(owner, name) -> CID` → item `CID -> signature`
//! - **Verify**: read the CID by `(owner, name)` → fetch the bytes → read the
//!   signature by CID → recompute the hash → check it against the owner
//!
//! The manager keeps no state of its own. Every call reconstructs what it
//! needs from the ledger and the content store, so any number of managers
//! (or tasks sharing one) may work on different identities at once.
//! Concurrent writers on the *same* identity are arbitrated by the ledger's
//! insert/update distinction, which surfaces as `RecordConflict`.

use crate::blockchain::{attribute_key, LedgerRecordStore};
use crate::error::{ChainError, ChainResult, Namespace};
use crate::models::did::IdentityDocument;
use crate::models::records::{SignatureRecord, VerificationFailure, VerificationReport};
use crate::storage::{Cid, ContentStore};
use crate::utils::retry::within;
use crate::utils::serialization::deserialize;
use crate::wallet::key_management::{format_address, recover_signer, verify, Keypair};
use ethers::types::Address;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Stateless orchestrator over a content store and a ledger.
pub struct IdentityChainManager<C, L> {
    content: Arc<C>,
    ledger: Arc<L>,
    step_timeout: Duration,
}

impl<C, L> Clone for IdentityChainManager<C, L> {
    fn clone(&self) -> Self {
        Self {
            content: self.content.clone(),
            ledger: self.ledger.clone(),
            step_timeout: self.step_timeout,
        }
    }
}

impl<C: ContentStore, L: LedgerRecordStore> IdentityChainManager<C, L> {
    /// Creates a manager over explicitly passed store and ledger handles.
    ///
    /// # Arguments
    /// * `content` - Content-addressed blob store
    /// * `ledger` - Two-namespace ledger record store
    /// * `step_timeout` - Upper bound for each network step
    pub fn new(content: Arc<C>, ledger: Arc<L>, step_timeout: Duration) -> Self {
        Self {
            content,
            ledger,
            step_timeout,
        }
    }

    pub fn content_store(&self) -> &Arc<C> {
        &self.content
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Publishes one version of a document.
    ///
    /// # Arguments
    /// * `owner` - Signing keypair; must be the key named by `draft.controller`
    /// * `name` - Document identifier, the attribute key under the owner
    /// * `draft` - The document version to anchor
    /// * `first_version` - Insert (first write) vs update semantics
    ///
    /// # Returns
    /// The CID of the stored document.
    ///
    /// # Errors
    /// - `InvalidDocument` / `ControllerMismatch` before anything is written
    /// - `RecordConflict` for insert on an existing name or update on a
    ///   missing one
    /// - `Transport` / `Timeout` from any step, carrying the operation name
    ///
    /// # Resuming
    /// If the attribute already points at this document's CID (a previous
    /// call stopped between the attribute and item writes), the attribute
    /// write is skipped and only the signature item is written. A first
    /// version whose signature is already recorded is a `RecordConflict`.
    pub async fn publish_document(
        &self,
        owner: &Keypair,
        name: &str,
        draft: &IdentityDocument,
        first_version: bool,
    ) -> ChainResult<Cid> {
        draft.validate()?;
        let controller = draft.controller_did()?;
        if controller.address != owner.address() {
            return Err(ChainError::ControllerMismatch {
                controller: draft.controller.clone(),
                signer: format_address(owner.address()),
            });
        }

        // 1-2. Canonical bytes into the content store.
        let bytes = draft.to_bytes()?;
        let cid = within(self.step_timeout, "content.put", self.content.put(&bytes)).await?;
        debug!("{} v{} stored as {}", name, if first_version { "1" } else { "n" }, cid);

        // 3-4. Sign the hash of the content address.
        let digest = cid.digest();
        let signature = owner.sign(&digest)?;

        // 5. Attribute record, unless a previous attempt already wrote it.
        let key = attribute_key(owner.address(), name);
        let current = within(
            self.step_timeout,
            "ledger.read_attribute",
            self.ledger.read_attribute(owner.address(), owner.address(), name),
        )
        .await?;
        let cid_bytes = cid.as_str().as_bytes();

        match current {
            Some(existing) if existing == cid_bytes => {
                // Only a publish that stopped before its signature write may
                // resume; a completed first version stays write-once.
                if first_version && self.is_signed_by(owner, &cid).await? {
                    return Err(ChainError::RecordConflict {
                        namespace: Namespace::Attribute,
                        key,
                        reason: format!("first version already published as {}", cid),
                    });
                }
                info!("{} already points at {}, resuming at signature write", key, cid);
            }
            Some(existing) if first_version => {
                return Err(ChainError::RecordConflict {
                    namespace: Namespace::Attribute,
                    key,
                    reason: format!(
                        "first version already published as {}",
                        String::from_utf8_lossy(&existing)
                    ),
                });
            }
            _ if first_version => {
                within(
                    self.step_timeout,
                    "ledger.insert_attribute",
                    self.ledger.insert_attribute(owner, name, cid_bytes),
                )
                .await?;
            }
            _ => {
                within(
                    self.step_timeout,
                    "ledger.update_attribute",
                    self.ledger.update_attribute(owner, name, cid_bytes),
                )
                .await?;
            }
        }

        // 6. Signature item keyed by CID.
        within(
            self.step_timeout,
            "ledger.upsert_item",
            self.ledger.upsert_item(owner, cid.as_str(), &signature),
        )
        .await?;

        info!("published {} as {}", key, cid);
        Ok(cid)
    }

    /// Whether the item namespace already holds `owner`'s signature for `cid`.
    async fn is_signed_by(&self, owner: &Keypair, cid: &Cid) -> ChainResult<bool> {
        let stored = within(
            self.step_timeout,
            "ledger.read_item",
            self.ledger.read_item(owner.address(), cid.as_str()),
        )
        .await?;
        Ok(stored.map_or(false, |signature| verify(&cid.digest(), &signature, owner.address())))
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Verifies the current version of `(owner, name)`.
    ///
    /// # Arguments
    /// * `owner` - Address whose key must have signed the document
    /// * `name` - Document identifier used at publish time
    /// * `verifier` - Account submitting the read queries; any key works
    ///
    /// # Returns
    /// A report with `valid` and the fetched document. A missing or
    /// mismatched signature is `valid = false`, not an error.
    ///
    /// # Errors
    /// - `NotFound` when nothing is published under `(owner, name)`
    /// - `ContentUnavailable` when the store cannot produce the bytes
    /// - `InvalidDocument` when the stored bytes are not a document
    pub async fn verify_document(
        &self,
        owner: Address,
        name: &str,
        verifier: &Keypair,
    ) -> ChainResult<VerificationReport> {
        let key = attribute_key(owner, name);

        // 1. CID from the attribute namespace.
        let raw_cid = within(
            self.step_timeout,
            "ledger.read_attribute",
            self.ledger.read_attribute(verifier.address(), owner, name),
        )
        .await?
        .ok_or_else(|| ChainError::NotFound {
            namespace: Namespace::Attribute,
            key: key.clone(),
        })?;
        let cid = Cid::new(
            String::from_utf8(raw_cid)
                .map_err(|_| ChainError::InvalidDocument(format!("attribute {} is not a CID", key)))?,
        );

        // 2. Document bytes.
        let bytes = within(self.step_timeout, "content.get", self.content.get(&cid)).await?;
        let document: IdentityDocument = deserialize(&bytes)
            .map_err(|e| ChainError::InvalidDocument(format!("content {}: {}", cid, e)))?;

        // 3. Signature by CID.
        let signature = within(
            self.step_timeout,
            "ledger.read_item",
            self.ledger.read_item(verifier.address(), cid.as_str()),
        )
        .await?;

        // 4-5. Recompute and check.
        let digest = cid.digest();
        let report = match signature {
            None => {
                warn!("{} has no signature for {}", key, cid);
                VerificationReport::invalid(cid, document, VerificationFailure::SignatureMissing)
            }
            Some(signature) => {
                let valid = verify(&digest, &signature, owner);
                let record = SignatureRecord {
                    signer: recover_signer(&digest, &signature),
                    hash_signed: digest,
                    signature,
                };
                if valid {
                    VerificationReport::valid(cid, document, record)
                } else {
                    let failure = match record.signer {
                        Some(_) => VerificationFailure::SignerMismatch,
                        None => VerificationFailure::SignatureMalformed,
                    };
                    warn!("{} signature check failed: {:?}", key, failure);
                    VerificationReport {
                        signature: Some(record),
                        ..VerificationReport::invalid(cid, document, failure)
                    }
                }
            }
        };
        Ok(report)
    }

    /// Appends a new version on top of the verified current head.
    ///
    /// Sets `prev_hash` on `next` to the hash of the head document, keeps
    /// `id` and `controller` fixed, and publishes with update semantics.
    ///
    /// # Errors
    /// - `HeadUnverified` if the current head does not verify
    /// - `ImmutableFieldChanged` if `next` alters `id` or `controller`
    /// - Anything [`publish_document`](Self::publish_document) returns
    pub async fn publish_next_version(
        &self,
        owner: &Keypair,
        name: &str,
        mut next: IdentityDocument,
    ) -> ChainResult<Cid> {
        let head = self.verify_document(owner.address(), name, owner).await?;
        if !head.valid {
            return Err(ChainError::HeadUnverified {
                key: attribute_key(owner.address(), name),
                cid: head.cid.to_string(),
            });
        }
        let previous = head.document;
        if next.id != previous.id {
            return Err(ChainError::ImmutableFieldChanged {
                field: "id",
                previous: previous.id,
                next: next.id,
            });
        }
        if next.controller != previous.controller {
            return Err(ChainError::ImmutableFieldChanged {
                field: "controller",
                previous: previous.controller,
                next: next.controller,
            });
        }
        next.prev_hash = Some(previous.hash_hex()?);
        self.publish_document(owner, name, &next, false).await
    }

    /// Convenience for [`publish_next_version`](Self::publish_next_version):
    /// verifies the head, applies `edit` to a copy of it, and publishes.
    pub async fn amend<F>(&self, owner: &Keypair, name: &str, edit: F) -> ChainResult<Cid>
    where
        F: FnOnce(&mut IdentityDocument),
    {
        let head = self.verify_document(owner.address(), name, owner).await?;
        let mut next = head.document;
        edit(&mut next);
        self.publish_next_version(owner, name, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::memory::MemoryLedger;
    use crate::models::did::Did;
    use crate::storage::memory::MemoryContentStore;
    use crate::utils::crypto::digest_to_hex;
    use crate::utils::crypto::hash_data;
    use tokio_test::assert_ok;

    type Manager = IdentityChainManager<MemoryContentStore, MemoryLedger>;

    fn manager() -> (Manager, Arc<MemoryContentStore>, Arc<MemoryLedger>) {
        let content = Arc::new(MemoryContentStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let manager = IdentityChainManager::new(content.clone(), ledger.clone(), Duration::from_secs(5));
        (manager, content, ledger)
    }

    #[tokio::test]
    async fn publish_then_verify() {
        let (manager, _, _) = manager();
        let owner = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);

        let cid = manager.publish_document(&owner, "train-42", &doc, true).await.unwrap();
        let report = manager
            .verify_document(owner.address(), "train-42", &Keypair::generate())
            .await
            .unwrap();

        assert!(report.valid);
        assert_eq!(report.cid, cid);
        assert_eq!(report.document, doc);
        assert_eq!(report.failure, None);
        let record = report.signature.unwrap();
        assert_eq!(record.signer, Some(owner.address()));
        assert_eq!(record.hash_signed, hash_data(cid.as_str().as_bytes()));
    }

    #[tokio::test]
    async fn identical_documents_share_a_cid() {
        let (manager, content, _) = manager();
        let a = Keypair::generate();
        let b = Keypair::generate();
        let doc_a = IdentityDocument::self_controlled("x", &a);

        let first = manager.publish_document(&a, "train-42", &doc_a, true).await.unwrap();
        let again = manager.publish_document(&a, "train-43", &doc_a, true).await.unwrap();
        manager
            .publish_document(&b, "train-42", &IdentityDocument::self_controlled("x", &b), true)
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(content.len(), 2);
    }

    #[tokio::test]
    async fn tampered_signature_is_invalid() {
        let (manager, _, ledger) = manager();
        let owner = Keypair::generate();
        let intruder = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);
        let cid = manager.publish_document(&owner, "train-42", &doc, true).await.unwrap();

        let forged = intruder.sign(&cid.digest()).unwrap();
        ledger.upsert_item(&intruder, cid.as_str(), &forged).await.unwrap();

        let report = manager
            .verify_document(owner.address(), "train-42", &owner)
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.failure, Some(VerificationFailure::SignerMismatch));
        assert_eq!(report.signature.unwrap().signer, Some(intruder.address()));
        assert_eq!(report.document, doc);
    }

    #[tokio::test]
    async fn garbage_signature_is_invalid() {
        let (manager, _, ledger) = manager();
        let owner = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);
        let cid = manager.publish_document(&owner, "train-42", &doc, true).await.unwrap();
        ledger.upsert_item(&owner, cid.as_str(), &[7u8; 10]).await.unwrap();

        let report = manager.verify_document(owner.address(), "train-42", &owner).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.failure, Some(VerificationFailure::SignatureMalformed));
    }

    #[tokio::test]
    async fn second_first_publish_conflicts() {
        let (manager, _, ledger) = manager();
        let owner = Keypair::generate();
        let v1 = IdentityDocument::self_controlled("x", &owner);
        let other = v1.clone().with_service("#admin", "AdminContact", "ops@example.com");

        assert_ok!(manager.publish_document(&owner, "train-42", &v1, true).await);
        let err = manager.publish_document(&owner, "train-42", &other, true).await.unwrap_err();

        assert!(matches!(err, ChainError::RecordConflict { namespace: Namespace::Attribute, .. }));
        assert_eq!(ledger.attribute_writes(), 1);
    }

    #[tokio::test]
    async fn same_first_version_twice_conflicts() {
        let (manager, _, ledger) = manager();
        let owner = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);

        assert_ok!(manager.publish_document(&owner, "train-42", &doc, true).await);
        let err = manager.publish_document(&owner, "train-42", &doc, true).await.unwrap_err();

        assert!(matches!(err, ChainError::RecordConflict { namespace: Namespace::Attribute, .. }));
        assert_eq!(ledger.attribute_writes(), 1);
        assert_eq!(ledger.item_writes(), 1);
    }

    #[tokio::test]
    async fn foreign_signature_does_not_block_resume() {
        let (manager, _, ledger) = manager();
        let owner = Keypair::generate();
        let intruder = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);

        ledger.fail_next_item_write();
        assert!(manager.publish_document(&owner, "train-42", &doc, true).await.is_err());
        let cid = MemoryContentStore::address_of(&doc.to_bytes().unwrap());
        ledger
            .upsert_item(&intruder, cid.as_str(), &intruder.sign(&cid.digest()).unwrap())
            .await
            .unwrap();

        assert_ok!(manager.publish_document(&owner, "train-42", &doc, true).await);
        assert!(manager.verify_document(owner.address(), "train-42", &owner).await.unwrap().valid);
    }

    #[tokio::test]
    async fn update_before_first_publish_conflicts() {
        let (manager, _, _) = manager();
        let owner = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);

        let err = manager.publish_document(&owner, "train-42", &doc, false).await.unwrap_err();
        assert!(matches!(err, ChainError::RecordConflict { .. }));
    }

    #[tokio::test]
    async fn signer_must_control_document() {
        let (manager, content, _) = manager();
        let owner = Keypair::generate();
        let stranger = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);

        let err = manager.publish_document(&stranger, "train-42", &doc, true).await.unwrap_err();
        assert!(matches!(err, ChainError::ControllerMismatch { .. }));
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn incomplete_draft_is_rejected_before_writes() {
        let (manager, content, _) = manager();
        let owner = Keypair::generate();
        let did = Did::new("x", owner.address()).to_string();
        let draft = IdentityDocument::new(did.clone(), did);

        let err = manager.publish_document(&owner, "train-42", &draft, true).await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidDocument(_)));
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn unknown_identity_is_not_found() {
        let (manager, _, _) = manager();
        let owner = Keypair::generate();

        let err = manager
            .verify_document(owner.address(), "train-42", &owner)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NotFound { namespace: Namespace::Attribute, .. }));
    }

    #[tokio::test]
    async fn evicted_content_is_unavailable() {
        let (manager, content, _) = manager();
        let owner = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);
        let cid = manager.publish_document(&owner, "train-42", &doc, true).await.unwrap();
        content.evict(&cid);

        let err = manager.verify_document(owner.address(), "train-42", &owner).await.unwrap_err();
        assert!(matches!(err, ChainError::ContentUnavailable { .. }));
    }

    #[tokio::test]
    async fn interrupted_publish_resumes_at_item_write() {
        let (manager, _, ledger) = manager();
        let owner = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);

        ledger.fail_next_item_write();
        let err = manager.publish_document(&owner, "train-42", &doc, true).await.unwrap_err();
        assert!(matches!(err, ChainError::Transport { operation: "ledger.upsert_item", .. }));
        assert_eq!(ledger.attribute_writes(), 1);

        // Half-published: attribute present, signature missing.
        let report = manager.verify_document(owner.address(), "train-42", &owner).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.failure, Some(VerificationFailure::SignatureMissing));

        let cid = manager.publish_document(&owner, "train-42", &doc, true).await.unwrap();
        assert_eq!(cid, report.cid);
        assert_eq!(ledger.attribute_writes(), 1);
        assert_eq!(ledger.item_writes(), 1);
        assert!(manager.verify_document(owner.address(), "train-42", &owner).await.unwrap().valid);
    }

    #[tokio::test]
    async fn next_version_links_to_previous_hash() {
        let (manager, _, ledger) = manager();
        let owner = Keypair::generate();
        let v1 = IdentityDocument::self_controlled("x", &owner);
        let v1_cid = manager.publish_document(&owner, "train-42", &v1, true).await.unwrap();

        let v2_draft = v1.clone().with_service("#telemetry", "TelemetryData", "QmReading");
        let v2_cid = manager.publish_next_version(&owner, "train-42", v2_draft).await.unwrap();
        assert_ne!(v1_cid, v2_cid);

        let head = manager.verify_document(owner.address(), "train-42", &owner).await.unwrap();
        assert!(head.valid);
        assert_eq!(head.cid, v2_cid);
        assert_eq!(
            head.document.prev_hash,
            Some(digest_to_hex(&hash_data(&v1.to_bytes().unwrap())))
        );
        assert!(head.document.follows(&v1).unwrap());
        assert_eq!(ledger.attribute_writes(), 2);
    }

    #[tokio::test]
    async fn amend_chains_three_versions() {
        let (manager, _, _) = manager();
        let owner = Keypair::generate();
        let v1 = IdentityDocument::self_controlled("x", &owner);
        manager.publish_document(&owner, "train-42", &v1, true).await.unwrap();

        manager
            .amend(&owner, "train-42", |doc| doc.set_service("#telemetry", "TelemetryData", "QmT0"))
            .await
            .unwrap();
        let v2 = manager.verify_document(owner.address(), "train-42", &owner).await.unwrap().document;
        manager
            .amend(&owner, "train-42", |doc| doc.set_service("#telemetry", "TelemetryData", "QmT1"))
            .await
            .unwrap();
        let v3 = manager.verify_document(owner.address(), "train-42", &owner).await.unwrap().document;

        assert!(v2.follows(&v1).unwrap());
        assert!(v3.follows(&v2).unwrap());
        assert_eq!(v3.service("#telemetry").unwrap().endpoint_or_data, "QmT1");
    }

    #[tokio::test]
    async fn next_version_cannot_change_identity() {
        let (manager, _, _) = manager();
        let owner = Keypair::generate();
        let v1 = IdentityDocument::self_controlled("x", &owner);
        manager.publish_document(&owner, "train-42", &v1, true).await.unwrap();

        let mut renamed = v1.clone();
        renamed.id = Did::new("x", Keypair::generate().address()).to_string();
        let err = manager.publish_next_version(&owner, "train-42", renamed).await.unwrap_err();
        assert!(matches!(err, ChainError::ImmutableFieldChanged { field: "id", .. }));
    }

    #[tokio::test]
    async fn cannot_chain_onto_tampered_head() {
        let (manager, _, ledger) = manager();
        let owner = Keypair::generate();
        let intruder = Keypair::generate();
        let v1 = IdentityDocument::self_controlled("x", &owner);
        let cid = manager.publish_document(&owner, "train-42", &v1, true).await.unwrap();
        ledger
            .upsert_item(&intruder, cid.as_str(), &intruder.sign(&cid.digest()).unwrap())
            .await
            .unwrap();

        let err = manager
            .publish_next_version(&owner, "train-42", v1.with_service("#a", "b", "c"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::HeadUnverified { .. }));
    }

    #[tokio::test]
    async fn independent_identities_publish_concurrently() {
        let (manager, _, ledger) = manager();
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let owner = Keypair::generate();
                    let doc = IdentityDocument::self_controlled("x", &owner);
                    let name = format!("train-{}", i);
                    manager.publish_document(&owner, &name, &doc, true).await?;
                    manager.verify_document(owner.address(), &name, &owner).await
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().unwrap().valid);
        }
        assert_eq!(ledger.attribute_writes(), 8);
    }

    #[tokio::test]
    async fn publish_emits_finalized_progress() {
        let (manager, _, ledger) = manager();
        let mut events = ledger.subscribe();
        let owner = Keypair::generate();
        let doc = IdentityDocument::self_controlled("x", &owner);
        manager.publish_document(&owner, "train-42", &doc, true).await.unwrap();

        let mut finalized = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let crate::blockchain::TxProgress::Finalized { operation, .. } = event {
                finalized.push(operation);
            }
        }
        assert_eq!(finalized, vec!["ledger.insert_attribute", "ledger.upsert_item"]);
    }
}
