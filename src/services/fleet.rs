// src/services/fleet.rs
//! Fleet enrollment.
//!
//! Turns a roster of trains into anchored machine identities. Each train
//! gets a fresh machine keypair and a first-version document that:
//! - is identified by the train's DID (derived from the machine key)
//! - is controlled by the owner's DID
//! - lists the machine key as its verification method
//! - carries the train's admin contact as the `#admin` service
//!
//! Documents are published under the train id as attribute name. Trains
//! already present under the owner are skipped, so a partially applied
//! roster can be re-run.

use crate::blockchain::LedgerRecordStore;
use crate::error::{ChainError, ChainResult};
use crate::models::did::{Did, IdentityDocument};
use crate::services::identity_chain::IdentityChainManager;
use crate::storage::{Cid, ContentStore};
use crate::utils::retry::within;
use crate::wallet::key_management::Keypair;
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

pub const ADMIN_SERVICE_ID: &str = "#admin";
pub const ADMIN_SERVICE_TYPE: &str = "AdminContact";

/// One roster line.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrainEntry {
    pub id: String,
    pub admin: String,
}

/// `{ "trains": [{ "id": "...", "admin": "..." }] }`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Roster {
    pub trains: Vec<TrainEntry>,
}

impl Roster {
    pub fn from_json(bytes: &[u8]) -> ChainResult<Self> {
        let roster: Roster = serde_json::from_slice(bytes)?;
        let mut seen = HashSet::new();
        for train in &roster.trains {
            if train.id.is_empty() {
                return Err(ChainError::Config("roster entry with empty id".to_string()));
            }
            if !seen.insert(train.id.as_str()) {
                return Err(ChainError::Config(format!("duplicate train id {}", train.id)));
            }
        }
        Ok(roster)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ChainResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| ChainError::Config(format!("cannot read roster {}: {}", path.display(), e)))?;
        Self::from_json(&bytes)
    }
}

/// A train anchored by [`FleetRegistrar::enroll`].
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub train_id: String,
    pub did: Did,
    pub cid: Cid,
    pub machine: Keypair,
}

#[derive(Debug, Default)]
pub struct EnrollmentReport {
    pub enrolled: Vec<Enrollment>,
    /// Trains that already had a document under the owner.
    pub skipped: Vec<String>,
}

pub struct FleetRegistrar<C, L> {
    manager: IdentityChainManager<C, L>,
    namespace: String,
}

impl<C: ContentStore, L: LedgerRecordStore> FleetRegistrar<C, L> {
    pub fn new(manager: IdentityChainManager<C, L>, namespace: impl Into<String>) -> Self {
        Self {
            manager,
            namespace: namespace.into(),
        }
    }

    /// Builds the first-version document for one train.
    pub fn machine_document(&self, owner: &Keypair, machine: &Keypair, admin: &str) -> IdentityDocument {
        let owner_did = Did::new(self.namespace.as_str(), owner.address()).to_string();
        let train_did = Did::new(self.namespace.as_str(), machine.address()).to_string();
        IdentityDocument::new(train_did, owner_did.clone())
            .with_verification_method(&owner_did, machine)
            .with_service(ADMIN_SERVICE_ID, ADMIN_SERVICE_TYPE, admin)
    }

    /// Enrolls every train in `roster` under `owner`, one at a time.
    ///
    /// Stops at the first failure; trains enrolled before it stay anchored
    /// and are skipped on the next run.
    pub async fn enroll(&self, owner: &Keypair, roster: &Roster) -> ChainResult<EnrollmentReport> {
        let mut report = EnrollmentReport::default();

        for train in &roster.trains {
            let existing = within(
                self.manager.step_timeout(),
                "ledger.read_attribute",
                self.manager
                    .ledger()
                    .read_attribute(owner.address(), owner.address(), &train.id),
            )
            .await?;
            if existing.is_some() {
                warn!("{} already enrolled, skipping", train.id);
                report.skipped.push(train.id.clone());
                continue;
            }

            let machine = Keypair::generate();
            let document = self.machine_document(owner, &machine, &train.admin);
            let cid = self
                .manager
                .publish_document(owner, &train.id, &document, true)
                .await?;
            info!("enrolled {} as {}", train.id, document.id);

            report.enrolled.push(Enrollment {
                train_id: train.id.clone(),
                did: Did::new(self.namespace.as_str(), machine.address()),
                cid,
                machine,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::memory::MemoryLedger;
    use crate::blockchain::{TxProgress, TxReceipt};
    use crate::storage::memory::MemoryContentStore;
    use ethers::types::Address;
    use std::sync::Arc;
    use std::time::Duration;

    fn registrar() -> FleetRegistrar<MemoryContentStore, MemoryLedger> {
        let manager = IdentityChainManager::new(
            Arc::new(MemoryContentStore::new()),
            Arc::new(MemoryLedger::new()),
            Duration::from_secs(5),
        );
        FleetRegistrar::new(manager, "peaq")
    }

    const ROSTER: &str = r#"{
        "trains": [
            { "id": "train-1", "admin": "depot-a@example.com" },
            { "id": "train-2", "admin": "depot-b@example.com" }
        ]
    }"#;

    #[test]
    fn roster_rejects_duplicates() {
        let roster = r#"{ "trains": [ { "id": "t", "admin": "a" }, { "id": "t", "admin": "b" } ] }"#;
        assert!(matches!(
            Roster::from_json(roster.as_bytes()),
            Err(ChainError::Config(_))
        ));
    }

    #[tokio::test]
    async fn enrolled_trains_verify_under_owner() {
        let registrar = registrar();
        let owner = Keypair::generate();
        let roster = Roster::from_json(ROSTER.as_bytes()).unwrap();

        let report = registrar.enroll(&owner, &roster).await.unwrap();
        assert_eq!(report.enrolled.len(), 2);
        assert!(report.skipped.is_empty());

        for enrollment in &report.enrolled {
            let verified = registrar
                .manager
                .verify_document(owner.address(), &enrollment.train_id, &owner)
                .await
                .unwrap();
            assert!(verified.valid);
            assert_eq!(verified.cid, enrollment.cid);
            assert_eq!(verified.document.id, enrollment.did.to_string());
            assert_eq!(
                verified.document.controller,
                Did::new("peaq", owner.address()).to_string()
            );
            assert_eq!(
                verified.document.verification_methods[0].public_key_material,
                enrollment.machine.public_key_hex()
            );
        }
        assert_eq!(
            registrar.manager.verify_document(owner.address(), "train-2", &owner).await.unwrap()
                .document.service(ADMIN_SERVICE_ID).unwrap().endpoint_or_data,
            "depot-b@example.com"
        );
    }

    /// Ledger whose reads never answer.
    struct StalledLedger;

    #[async_trait::async_trait]
    impl LedgerRecordStore for StalledLedger {
        async fn insert_attribute(&self, _: &Keypair, _: &str, _: &[u8]) -> ChainResult<TxReceipt> {
            std::future::pending().await
        }

        async fn update_attribute(&self, _: &Keypair, _: &str, _: &[u8]) -> ChainResult<TxReceipt> {
            std::future::pending().await
        }

        async fn read_attribute(&self, _: Address, _: Address, _: &str) -> ChainResult<Option<Vec<u8>>> {
            std::future::pending().await
        }

        async fn upsert_item(&self, _: &Keypair, _: &str, _: &[u8]) -> ChainResult<TxReceipt> {
            std::future::pending().await
        }

        async fn read_item(&self, _: Address, _: &str) -> ChainResult<Option<Vec<u8>>> {
            std::future::pending().await
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TxProgress> {
            tokio::sync::broadcast::channel(1).1
        }
    }

    #[tokio::test]
    async fn stalled_ledger_times_out_enrollment() {
        let manager = IdentityChainManager::new(
            Arc::new(MemoryContentStore::new()),
            Arc::new(StalledLedger),
            Duration::from_millis(50),
        );
        let registrar = FleetRegistrar::new(manager, "peaq");
        let roster = Roster::from_json(ROSTER.as_bytes()).unwrap();

        let err = registrar.enroll(&Keypair::generate(), &roster).await.unwrap_err();
        assert!(matches!(err, ChainError::Timeout { operation: "ledger.read_attribute", .. }));
    }

    #[tokio::test]
    async fn rerun_skips_enrolled_trains() {
        let registrar = registrar();
        let owner = Keypair::generate();
        let roster = Roster::from_json(ROSTER.as_bytes()).unwrap();

        registrar.enroll(&owner, &roster).await.unwrap();
        let again = registrar.enroll(&owner, &roster).await.unwrap();

        assert!(again.enrolled.is_empty());
        assert_eq!(again.skipped, vec!["train-1".to_string(), "train-2".to_string()]);
    }
}
