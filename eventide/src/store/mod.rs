//! The store module contains the implementations of the event, snapshot and
//! scheduled command stores.

use crate::{ConcurrencyConflict, Error, EventRecord, Result};

// The in-memory implementations are compiled when the `in-memory` feature is
// enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory event store.
pub mod in_memory;

#[cfg(feature = "in-memory")]
/// An in-memory snapshot store.
pub mod in_memory_snapshot;

#[cfg(feature = "in-memory")]
/// An in-memory scheduled command store.
pub mod in_memory_schedule;

// The persistent `sled` implementations are compiled when the `sled-storage`
// feature is enabled.
#[cfg(feature = "sled-storage")]
/// A persistent event store using `sled`.
pub mod sled;

#[cfg(feature = "sled-storage")]
/// A persistent snapshot store using `sled`.
pub mod sled_snapshot;

#[cfg(feature = "sled-storage")]
/// A persistent scheduled command store using `sled`.
pub mod sled_schedule;

// SQLx / Postgres implementation compiled when the `postgres-storage` feature
// is enabled.
#[cfg(feature = "postgres-storage")]
pub mod sqlx_postgres;

/// Checks that a batch targets a single stream with consecutive sequence
/// numbers, returning its `(stream_name, aggregate_id)`.
pub(crate) fn batch_stream(records: &[EventRecord]) -> Result<Option<(&str, &str)>> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    for (offset, record) in (0..).zip(records) {
        if record.stream_name != first.stream_name || record.aggregate_id != first.aggregate_id {
            return Err(Error::Validation(
                "an append batch must target a single aggregate".to_owned(),
            ));
        }
        if record.sequence_number != first.sequence_number + offset {
            return Err(Error::Validation(format!(
                "sequence numbers must be consecutive, found {} after {}",
                record.sequence_number,
                first.sequence_number + offset - 1
            )));
        }
    }
    if first.sequence_number < 1 {
        return Err(Error::Validation(
            "sequence numbers start at 1".to_owned(),
        ));
    }
    Ok(Some((&first.stream_name, &first.aggregate_id)))
}

/// Checks that a batch starts right after the stream's last sequence number.
pub(crate) fn check_contiguous(records: &[EventRecord], last: i64) -> Result<()> {
    match records.first() {
        Some(first) if first.sequence_number > last + 1 => Err(Error::Validation(format!(
            "appending at {} would leave a gap after {last}",
            first.sequence_number
        ))),
        _ => Ok(()),
    }
}

/// Builds the conflict error for a batch colliding with `existing`.
pub(crate) fn conflict(records: Vec<EventRecord>, existing: Vec<EventRecord>) -> Error {
    let (stream_name, aggregate_id) = records
        .first()
        .map(|r| (r.stream_name.clone(), r.aggregate_id.clone()))
        .unwrap_or_default();
    Error::Conflict(Box::new(ConcurrencyConflict {
        stream_name,
        aggregate_id,
        attempted: records,
        existing,
    }))
}
