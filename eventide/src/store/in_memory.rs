//! An in-memory event store, useful for testing and development.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::{AppendOutcome, EventRecord, EventStore, ReadRange, Result};

use super::{batch_stream, check_contiguous, conflict};

use dashmap::DashMap;

// Type aliases to keep complex generic types readable and satisfy clippy::type-complexity.
type StreamKey = (String, String);

/// Thread-safe map keyed by (stream_name, aggregate_id)
type StoreMap = DashMap<StreamKey, Vec<EventRecord>>;

/// An in-memory, thread-safe event store.
///
/// Appends to one stream are serialised by the map's entry lock, which is
/// what detects concurrent writers here.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    streams: Arc<StoreMap>,
}

impl InMemoryEventStore {
    /// Returns every record of every stream, for inspection in tests.
    pub fn all_records(&self) -> Vec<EventRecord> {
        self.streams
            .iter()
            .flat_map(|stream| stream.value().clone())
            .collect()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn append(&self, records: Vec<EventRecord>) -> Result<AppendOutcome> {
        let Some((stream_name, aggregate_id)) = batch_stream(&records)? else {
            return Ok(AppendOutcome::Appended(0));
        };
        let key = (stream_name.to_owned(), aggregate_id.to_owned());

        let mut stream = self.streams.entry(key).or_default();

        if let Some(etag) = records
            .iter()
            .filter_map(|r| r.etag.as_deref())
            .find(|etag| stream.iter().any(|e| e.etag.as_deref() == Some(*etag)))
        {
            return Ok(AppendOutcome::Duplicate {
                etag: etag.to_owned(),
            });
        }

        let existing: Vec<EventRecord> = stream
            .iter()
            .filter(|e| {
                records
                    .iter()
                    .any(|r| r.sequence_number == e.sequence_number)
            })
            .cloned()
            .collect();
        if !existing.is_empty() {
            return Err(conflict(records, existing));
        }
        check_contiguous(&records, stream.last().map_or(0, |e| e.sequence_number))?;

        let count = records.len();
        stream.extend(records);
        Ok(AppendOutcome::Appended(count))
    }

    #[instrument(skip(self))]
    async fn read(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        range: ReadRange,
    ) -> Result<Vec<EventRecord>> {
        let key = (stream_name.to_owned(), aggregate_id.to_owned());

        match self.streams.get(&key) {
            Some(stream) => Ok(stream
                .iter()
                .filter(|e| range.contains(e))
                .cloned()
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self))]
    async fn find_by_etag(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        etag: &str,
    ) -> Result<Option<EventRecord>> {
        let key = (stream_name.to_owned(), aggregate_id.to_owned());

        Ok(self.streams.get(&key).and_then(|stream| {
            stream
                .iter()
                .find(|e| e.etag.as_deref() == Some(etag))
                .cloned()
        }))
    }
}
