//! The snapshot module contains the record and trait for storing aggregate
//! snapshots.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// A stored snapshot, including metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// The stream of the aggregate this snapshot belongs to.
    pub stream_name: String,
    /// The ID of the aggregate this snapshot belongs to.
    pub aggregate_id: String,
    /// The version of the aggregate when this snapshot was taken.
    pub version: i64,
    /// Commit time of the last event included in the snapshot.
    pub timestamp: DateTime<Utc>,
    /// The serialized snapshot.
    pub body: serde_json::Value,
}

/// Restricts which snapshot [`SnapshotStore::load`] may return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    /// Only snapshots at or below this version.
    pub max_version: Option<i64>,
    /// Only snapshots taken at or before this instant.
    pub as_of: Option<DateTime<Utc>>,
}

impl SnapshotFilter {
    /// Returns whether a snapshot passes the filter.
    pub fn matches(&self, snapshot: &SnapshotRecord) -> bool {
        self.max_version.is_none_or(|v| snapshot.version <= v)
            && self.as_of.is_none_or(|t| snapshot.timestamp <= t)
    }
}

/// A snapshot store is responsible for persisting and loading snapshots.
///
/// Snapshots are an optimization to reduce the time it takes to hydrate an
/// aggregate. Instead of replaying all events from the beginning of time, an
/// aggregate can be restored from a recent snapshot and then only replay the
/// events that occurred after it. Stores keep every snapshot so that
/// historical loads can use one too.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Saves a snapshot. Saving the same version twice keeps the latest.
    async fn save(&self, snapshot: SnapshotRecord) -> Result<()>;

    /// Loads the newest snapshot of an aggregate that passes `filter`.
    async fn load(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        filter: SnapshotFilter,
    ) -> Result<Option<SnapshotRecord>>;
}
