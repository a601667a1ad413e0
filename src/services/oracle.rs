// src/services/oracle.rs
//! Telemetry oracle.
//!
//! Periodically stores a machine's telemetry reading in the content store
//! and appends a new version of the machine's identity document whose
//! `#telemetry` service carries the reading's CID. Each version links to the
//! previous one by hash, so the document history doubles as a tamper-evident
//! log of readings.

use crate::blockchain::LedgerRecordStore;
use crate::error::{ChainError, ChainResult};
use crate::services::identity_chain::IdentityChainManager;
use crate::storage::{Cid, ContentStore};
use crate::utils::retry::within;
use crate::utils::serialization::serialize;
use crate::wallet::key_management::Keypair;
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

pub const TELEMETRY_SERVICE_ID: &str = "#telemetry";
pub const TELEMETRY_SERVICE_TYPE: &str = "TelemetryData";

/// Ordered sequence of readings to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryFeed {
    readings: Vec<Value>,
}

impl TelemetryFeed {
    pub fn new(readings: Vec<Value>) -> Self {
        Self { readings }
    }

    /// Parses either a JSON array of readings or an object keyed by time
    /// label (`t0`, `t1`, ...). Labels are ordered by their numeric suffix.
    pub fn from_json(bytes: &[u8]) -> ChainResult<Self> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Array(readings) => Ok(Self::new(readings)),
            Value::Object(map) => {
                let mut labelled: Vec<(String, Value)> = map.into_iter().collect();
                labelled.sort_by(|(a, _), (b, _)| label_order(a).cmp(&label_order(b)));
                Ok(Self::new(labelled.into_iter().map(|(_, v)| v).collect()))
            }
            other => Err(ChainError::Config(format!(
                "telemetry feed must be an array or object, got {}",
                other
            ))),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> ChainResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| ChainError::Config(format!("cannot read feed {}: {}", path.display(), e)))?;
        Self::from_json(&bytes)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl IntoIterator for TelemetryFeed {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.readings.into_iter()
    }
}

fn label_order(label: &str) -> (u64, String) {
    let digits: String = label.chars().skip_while(|c| !c.is_ascii_digit()).collect();
    (digits.parse().unwrap_or(u64::MAX), label.to_string())
}

/// What gets stored in the content store for each reading.
#[derive(Debug, Serialize)]
struct TelemetryEnvelope<'a> {
    machine: &'a str,
    recorded_at: DateTime<Utc>,
    reading: &'a Value,
}

/// CIDs produced by one oracle step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryUpdate {
    pub reading_cid: Cid,
    pub document_cid: Cid,
}

/// Totals from a [`TelemetryOracle::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OracleStats {
    pub published: usize,
    pub failed: usize,
}

pub struct TelemetryOracle<C, L> {
    manager: IdentityChainManager<C, L>,
    step_timeout: Duration,
}

impl<C: ContentStore, L: LedgerRecordStore> TelemetryOracle<C, L> {
    pub fn new(manager: IdentityChainManager<C, L>, step_timeout: Duration) -> Self {
        Self { manager, step_timeout }
    }

    /// Stores one reading and appends it to the document `name`.
    pub async fn record(&self, owner: &Keypair, name: &str, reading: &Value) -> ChainResult<TelemetryUpdate> {
        let envelope = TelemetryEnvelope {
            machine: name,
            recorded_at: Utc::now(),
            reading,
        };
        let bytes = serialize(&envelope)?;
        let reading_cid = within(
            self.step_timeout,
            "content.put",
            self.manager.content_store().put(&bytes),
        )
        .await?;

        let data = reading_cid.to_string();
        let document_cid = self
            .manager
            .amend(owner, name, |doc| {
                doc.set_service(TELEMETRY_SERVICE_ID, TELEMETRY_SERVICE_TYPE, data)
            })
            .await?;

        info!("{} telemetry {} anchored in {}", name, reading_cid, document_cid);
        Ok(TelemetryUpdate {
            reading_cid,
            document_cid,
        })
    }

    /// Publishes one reading per `interval` until the feed is exhausted or
    /// `shutdown` flips to `true`.
    pub async fn run(
        &self,
        owner: &Keypair,
        name: &str,
        feed: TelemetryFeed,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> OracleStats {
        let mut stats = OracleStats::default();
        let mut ticker = tokio::time::interval(interval);
        let mut readings = feed.into_iter();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("{} oracle stopping", name);
                        break;
                    }
                    continue;
                }
            }

            let Some(reading) = readings.next() else {
                break;
            };
            match self.record(owner, name, &reading).await {
                Ok(_) => stats.published += 1,
                Err(e) => {
                    error!("{} telemetry reading failed: {}", name, e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::memory::MemoryLedger;
    use crate::models::did::IdentityDocument;
    use crate::storage::memory::MemoryContentStore;
    use crate::utils::serialization::deserialize;
    use serde_json::json;
    use std::sync::Arc;

    fn oracle() -> TelemetryOracle<MemoryContentStore, MemoryLedger> {
        let manager = IdentityChainManager::new(
            Arc::new(MemoryContentStore::new()),
            Arc::new(MemoryLedger::new()),
            Duration::from_secs(5),
        );
        TelemetryOracle::new(manager, Duration::from_secs(5))
    }

    #[test]
    fn feed_object_is_ordered_by_label_number() {
        let feed = TelemetryFeed::from_json(br#"{ "t10": 3, "t2": 2, "t0": 1 }"#).unwrap();
        assert_eq!(feed.into_iter().collect::<Vec<_>>(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn feed_rejects_scalars() {
        assert!(TelemetryFeed::from_json(b"42").is_err());
    }

    #[tokio::test]
    async fn reading_is_linked_into_document() {
        let oracle = oracle();
        let owner = Keypair::generate();
        let v1 = IdentityDocument::self_controlled("peaq", &owner);
        oracle.manager.publish_document(&owner, "train-42", &v1, true).await.unwrap();

        let reading = json!({ "speed": 81.5, "location": "km 12" });
        let update = oracle.record(&owner, "train-42", &reading).await.unwrap();

        let head = oracle.manager.verify_document(owner.address(), "train-42", &owner).await.unwrap();
        assert!(head.valid);
        assert_eq!(head.cid, update.document_cid);
        assert!(head.document.follows(&v1).unwrap());
        assert_eq!(
            head.document.service(TELEMETRY_SERVICE_ID).unwrap().endpoint_or_data,
            update.reading_cid.as_str()
        );

        let stored = oracle.manager.content_store().get(&update.reading_cid).await.unwrap();
        let stored: Value = deserialize(&stored).unwrap();
        assert_eq!(stored["reading"], reading);
        assert_eq!(stored["machine"], "train-42");
    }

    #[tokio::test]
    async fn run_publishes_whole_feed() {
        let oracle = oracle();
        let owner = Keypair::generate();
        let v1 = IdentityDocument::self_controlled("peaq", &owner);
        oracle.manager.publish_document(&owner, "train-42", &v1, true).await.unwrap();
        let (_tx, rx) = watch::channel(false);

        let feed = TelemetryFeed::new(vec![json!({"t": 0}), json!({"t": 1}), json!({"t": 2})]);
        let stats = oracle
            .run(&owner, "train-42", feed, Duration::from_millis(1), rx)
            .await;

        assert_eq!(stats, OracleStats { published: 3, failed: 0 });
        let head = oracle.manager.verify_document(owner.address(), "train-42", &owner).await.unwrap();
        assert!(head.valid);
        assert!(head.document.prev_hash.is_some());
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let oracle = oracle();
        let owner = Keypair::generate();
        let (_tx, rx) = watch::channel(false);

        let feed = TelemetryFeed::new(vec![json!(1), json!(2)]);
        let stats = oracle
            .run(&owner, "never-enrolled", feed, Duration::from_millis(1), rx)
            .await;

        assert_eq!(stats, OracleStats { published: 0, failed: 2 });
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let oracle = oracle();
        let owner = Keypair::generate();
        let v1 = IdentityDocument::self_controlled("peaq", &owner);
        oracle.manager.publish_document(&owner, "train-42", &v1, true).await.unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let feed = TelemetryFeed::new(vec![json!(1); 5]);
        let stats = oracle
            .run(&owner, "train-42", feed, Duration::from_secs(3600), rx)
            .await;

        assert!(stats.published <= 1);
        assert_eq!(stats.failed, 0);
    }
}
