//! CloudEvent conversion utilities.
//!
//! [`CloudEvent`] wraps a [`cloudevents::Event`] built from a committed
//! [`EventRecord`], for handing events to transports that speak the
//! CloudEvents format.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use cloudevents::AttributesReader;
//! use eventide::{CloudEvent, EventRecord};
//! use serde_json::json;
//!
//! let record = EventRecord {
//!     stream_name: "order".to_owned(),
//!     aggregate_id: "42".to_owned(),
//!     sequence_number: 3,
//!     event_type: "Shipped".to_owned(),
//!     event_version: 1,
//!     body: json!({ "Shipped": null }),
//!     etag: None,
//!     timestamp: Utc::now(),
//! };
//! let ce = CloudEvent::try_from(&record).unwrap();
//! assert_eq!(ce.into_inner().id(), "order/42/3");
//! ```
//!
//! The CloudEvent `id` is derived from the record's position, so converting
//! the same record twice yields the same id. The `source` attribute defaults
//! to `urn:eventide:<stream>`.

use crate::{Error, EventRecord, Result};
use cloudevents::event::{Data, Event as CeEvent, EventBuilder, EventBuilderV10};
use tracing::instrument;
use url::Url;

/// A committed event in CloudEvents form.
#[derive(Debug, Clone)]
pub struct CloudEvent(pub CeEvent);

impl CloudEvent {
    /// Returns the inner [`cloudevents::Event`].
    #[must_use]
    pub fn into_inner(self) -> CeEvent {
        self.0
    }

    /// Builds a [`CloudEvent`] from a record and an explicit [`Url`] source.
    ///
    /// The stream position, etag and schema version travel as the
    /// `sequence`, `etag` and `eventversion` extensions.
    #[instrument(skip(record), fields(stream = %record.stream_name, sequence = record.sequence_number))]
    pub fn from_record_with_source(record: &EventRecord, source: Url) -> Result<Self> {
        let mut builder = EventBuilderV10::new()
            .id(format!(
                "{}/{}/{}",
                record.stream_name, record.aggregate_id, record.sequence_number
            ))
            .ty(record.event_type.as_str())
            .source(source)
            .subject(record.aggregate_id.as_str())
            .time(record.timestamp)
            .extension("sequence", record.sequence_number)
            .extension("eventversion", i64::from(record.event_version))
            .data("application/json", Data::Json(record.body.clone()));
        if let Some(etag) = &record.etag {
            builder = builder.extension("etag", etag.as_str());
        }

        let ce = builder
            .build()
            .map_err(|e| Error::Validation(format!("failed to build CloudEvent: {e}")))?;

        Ok(Self(ce))
    }
}

impl TryFrom<&EventRecord> for CloudEvent {
    type Error = Error;

    fn try_from(record: &EventRecord) -> Result<Self> {
        let source = Url::parse(&format!("urn:eventide:{}", record.stream_name)).map_err(|e| {
            Error::Validation(format!(
                "stream name {} is not a valid URN segment: {e}",
                record.stream_name
            ))
        })?;
        Self::from_record_with_source(record, source)
    }
}
