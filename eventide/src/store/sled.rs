//! A persistent `EventStore` implementation using `sled`.

use async_trait::async_trait;
use sled::{
    Transactional, Tree,
    transaction::{ConflictableTransactionError, TransactionError},
};
use tracing::{debug, instrument};

use crate::{AppendOutcome, Error, EventRecord, EventStore, ReadRange, Result};

use super::{batch_stream, conflict};

/// Maps a `sled` error into the crate error.
pub(crate) fn to_store_error(e: impl std::fmt::Display) -> Error {
    Error::Store(e.to_string())
}

/// Key prefix shared by every entry of one aggregate.
pub(crate) fn stream_prefix(stream_name: &str, aggregate_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(stream_name.len() + aggregate_id.len() + 2);
    key.extend_from_slice(stream_name.as_bytes());
    key.push(0);
    key.extend_from_slice(aggregate_id.as_bytes());
    key.push(0);
    key
}

/// Key of a numbered entry. Big-endian so keys sort by number.
pub(crate) fn numbered_key(stream_name: &str, aggregate_id: &str, number: i64) -> Vec<u8> {
    let mut key = stream_prefix(stream_name, aggregate_id);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

fn etag_key(stream_name: &str, aggregate_id: &str, etag: &str) -> Vec<u8> {
    let mut key = stream_prefix(stream_name, aggregate_id);
    key.extend_from_slice(etag.as_bytes());
    key
}

enum AppendAbort {
    Duplicate(String),
    Conflict(Vec<EventRecord>),
    Gap(i64),
    Corrupt(String),
}

/// A persistent, thread-safe event store using `sled`.
///
/// Events live in one ordered tree keyed by stream, aggregate and sequence
/// number, so an aggregate's stream is a contiguous key range. A second tree
/// indexes etags. Appends update both in a single transaction.
#[derive(Debug, Clone)]
pub struct SledEventStore {
    events: Tree,
    etags: Tree,
}

impl SledEventStore {
    /// Creates a new `SledEventStore`, opening its trees in `db`.
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            events: db.open_tree("events").map_err(to_store_error)?,
            etags: db.open_tree("event_etags").map_err(to_store_error)?,
        })
    }

    fn decode(value: &[u8]) -> Result<EventRecord> {
        serde_json::from_slice(value).map_err(to_store_error)
    }
}

#[async_trait]
impl EventStore for SledEventStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn append(&self, records: Vec<EventRecord>) -> Result<AppendOutcome> {
        let Some((stream_name, aggregate_id)) = batch_stream(&records)? else {
            return Ok(AppendOutcome::Appended(0));
        };

        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            let key = numbered_key(stream_name, aggregate_id, record.sequence_number);
            let value = serde_json::to_vec(record).map_err(to_store_error)?;
            let etag = record
                .etag
                .as_deref()
                .map(|etag| (etag.to_owned(), etag_key(stream_name, aggregate_id, etag)));
            rows.push((record.sequence_number, key, value, etag));
        }
        let previous = records
            .first()
            .map(|r| r.sequence_number - 1)
            .filter(|seq| *seq > 0)
            .map(|seq| numbered_key(stream_name, aggregate_id, seq));

        let result = (&self.events, &self.etags).transaction(|(events, etags)| {
            // Etags before sequence numbers.
            for (_, _, _, etag) in &rows {
                if let Some((etag, key)) = etag {
                    if etags.get(key)?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            AppendAbort::Duplicate(etag.clone()),
                        ));
                    }
                }
            }

            let mut existing = Vec::new();
            for (_, key, _, _) in &rows {
                if let Some(value) = events.get(key)? {
                    let record = Self::decode(&value).map_err(|e| {
                        ConflictableTransactionError::Abort(AppendAbort::Corrupt(e.to_string()))
                    })?;
                    existing.push(record);
                }
            }
            if !existing.is_empty() {
                return Err(ConflictableTransactionError::Abort(AppendAbort::Conflict(
                    existing,
                )));
            }
            if let Some(previous) = &previous {
                if events.get(previous)?.is_none() {
                    return Err(ConflictableTransactionError::Abort(AppendAbort::Gap(
                        rows.first().map_or(0, |(seq, ..)| *seq),
                    )));
                }
            }

            for (_, key, value, etag) in &rows {
                events.insert(key.as_slice(), value.as_slice())?;
                if let Some((_, etag_key)) = etag {
                    etags.insert(etag_key.as_slice(), key.as_slice())?;
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                self.events.flush_async().await.map_err(to_store_error)?;
                Ok(AppendOutcome::Appended(records.len()))
            }
            Err(TransactionError::Abort(AppendAbort::Duplicate(etag))) => {
                debug!(%etag, "duplicate etag, nothing appended");
                Ok(AppendOutcome::Duplicate { etag })
            }
            Err(TransactionError::Abort(AppendAbort::Conflict(existing))) => {
                Err(conflict(records, existing))
            }
            Err(TransactionError::Abort(AppendAbort::Gap(first))) => Err(Error::Validation(
                format!("appending at {first} would leave a gap in the stream"),
            )),
            Err(TransactionError::Abort(AppendAbort::Corrupt(e))) => Err(Error::Store(e)),
            Err(TransactionError::Storage(e)) => Err(to_store_error(e)),
        }
    }

    #[instrument(skip(self))]
    async fn read(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        range: ReadRange,
    ) -> Result<Vec<EventRecord>> {
        let first = range.after.saturating_add(1);
        let last = range.up_to.unwrap_or(i64::MAX);
        if last < first {
            return Ok(Vec::new());
        }
        let start = numbered_key(stream_name, aggregate_id, first);
        let end = numbered_key(stream_name, aggregate_id, last);

        let mut records = Vec::new();
        for entry in self.events.range(start..=end) {
            let (_, value) = entry.map_err(to_store_error)?;
            let record = Self::decode(&value)?;
            if range.contains(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn find_by_etag(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        etag: &str,
    ) -> Result<Option<EventRecord>> {
        let Some(key) = self
            .etags
            .get(etag_key(stream_name, aggregate_id, etag))
            .map_err(to_store_error)?
        else {
            return Ok(None);
        };
        self.events
            .get(key)
            .map_err(to_store_error)?
            .map(|value| Self::decode(&value))
            .transpose()
    }
}
