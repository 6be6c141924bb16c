use async_trait::async_trait;
use sled::Tree;
use tracing::instrument;

use crate::{
    Result,
    snapshot::{SnapshotFilter, SnapshotRecord, SnapshotStore},
};

use super::sled::{numbered_key, stream_prefix, to_store_error};

/// A persistent, thread-safe snapshot store using `sled`.
///
/// Snapshots are keyed by stream, aggregate and version, so every version is
/// kept and the newest one matching a filter is found by scanning an
/// aggregate's keys backwards.
#[derive(Debug, Clone)]
pub struct SledSnapshotStore {
    tree: Tree,
}

impl SledSnapshotStore {
    /// Creates a new `SledSnapshotStore`.
    ///
    /// It is recommended to open a dedicated `sled::Tree` for snapshots,
    /// separate from the ones used for events.
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl SnapshotStore for SledSnapshotStore {
    #[instrument(skip(self, snapshot), fields(stream = %snapshot.stream_name, aggregate_id = %snapshot.aggregate_id, version = snapshot.version))]
    async fn save(&self, snapshot: SnapshotRecord) -> Result<()> {
        let key = numbered_key(
            &snapshot.stream_name,
            &snapshot.aggregate_id,
            snapshot.version,
        );
        let value = serde_json::to_vec(&snapshot).map_err(to_store_error)?;
        self.tree.insert(key, value).map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        filter: SnapshotFilter,
    ) -> Result<Option<SnapshotRecord>> {
        for entry in self
            .tree
            .scan_prefix(stream_prefix(stream_name, aggregate_id))
            .rev()
        {
            let (_, value) = entry.map_err(to_store_error)?;
            let snapshot: SnapshotRecord =
                serde_json::from_slice(&value).map_err(to_store_error)?;
            if filter.matches(&snapshot) {
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }
}
