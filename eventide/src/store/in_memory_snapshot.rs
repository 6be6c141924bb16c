//! An in-memory snapshot store.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::{
    Result,
    snapshot::{SnapshotFilter, SnapshotRecord, SnapshotStore},
};

use dashmap::DashMap;

/// An in-memory, thread-safe snapshot store.
///
/// Keeps every snapshot of an aggregate ordered by version.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<DashMap<(String, String), Vec<SnapshotRecord>>>,
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    #[instrument(skip(self, snapshot), fields(stream = %snapshot.stream_name, aggregate_id = %snapshot.aggregate_id, version = snapshot.version))]
    async fn save(&self, snapshot: SnapshotRecord) -> Result<()> {
        let key = (snapshot.stream_name.clone(), snapshot.aggregate_id.clone());
        let mut versions = self.snapshots.entry(key).or_default();
        match versions.binary_search_by_key(&snapshot.version, |s| s.version) {
            Ok(index) => versions[index] = snapshot,
            Err(index) => versions.insert(index, snapshot),
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        filter: SnapshotFilter,
    ) -> Result<Option<SnapshotRecord>> {
        let key = (stream_name.to_owned(), aggregate_id.to_owned());
        Ok(self.snapshots.get(&key).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|s| filter.matches(s))
                .cloned()
        }))
    }
}
