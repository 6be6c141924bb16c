//! In-memory aggregate roots: committed history plus pending events.
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    Aggregate, AggregateId, Command, Error, Event, EventRecord, Result, new_etag,
    schedule::{CommandScheduled, Dependency, DeliveryDependency, EventReference, Scheduling},
};

/// Event type under which scheduling requests are stored in a stream.
pub const COMMAND_SCHEDULED: &str = "CommandScheduled";

/// Typed content of one entry in an aggregate's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<E> {
    /// A domain event produced by the aggregate.
    Domain(E),
    /// A command was scheduled for delivery to this aggregate.
    CommandScheduled(CommandScheduled),
}

impl<E: Event> Payload<E> {
    /// The event type stored alongside the payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Payload::Domain(event) => event.event_type(),
            Payload::CommandScheduled(_) => COMMAND_SCHEDULED,
        }
    }

    /// The schema version stored alongside the payload.
    pub fn event_version(&self) -> u16 {
        match self {
            Payload::Domain(event) => event.event_version(),
            Payload::CommandScheduled(_) => 1,
        }
    }

    /// Returns the domain event, if this is one.
    pub fn as_domain(&self) -> Option<&E> {
        match self {
            Payload::Domain(event) => Some(event),
            Payload::CommandScheduled(_) => None,
        }
    }

    pub(crate) fn to_body(&self) -> Result<serde_json::Value> {
        let body = match self {
            Payload::Domain(event) => serde_json::to_value(event)?,
            Payload::CommandScheduled(scheduled) => serde_json::to_value(scheduled)?,
        };
        Ok(body)
    }

    pub(crate) fn from_record(record: &EventRecord) -> Result<Self> {
        if record.event_type == COMMAND_SCHEDULED {
            Ok(Payload::CommandScheduled(serde_json::from_value(
                record.body.clone(),
            )?))
        } else {
            Ok(Payload::Domain(serde_json::from_value(record.body.clone())?))
        }
    }
}

/// A committed event in an aggregate's history.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent<E> {
    aggregate_id: String,
    sequence_number: i64,
    etag: Option<String>,
    timestamp: DateTime<Utc>,
    payload: Payload<E>,
}

impl<E: Event> StoredEvent<E> {
    /// Creates a new stored event.
    pub fn new(
        aggregate_id: String,
        sequence_number: i64,
        etag: Option<String>,
        timestamp: DateTime<Utc>,
        payload: Payload<E>,
    ) -> Self {
        Self {
            aggregate_id,
            sequence_number,
            etag,
            timestamp,
            payload,
        }
    }

    /// Decodes a persisted record into a typed event.
    pub fn decode(record: EventRecord) -> Result<Self> {
        let payload = Payload::from_record(&record)?;
        Ok(Self::new(
            record.aggregate_id,
            record.sequence_number,
            record.etag,
            record.timestamp,
            payload,
        ))
    }

    /// Returns the ID of the aggregate this event belongs to.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }
    /// Returns the position of this event in its stream.
    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }
    /// Returns the idempotency token, if any.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }
    /// Returns when the event was committed.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    /// Returns the event payload.
    pub fn payload(&self) -> &Payload<E> {
        &self.payload
    }
    /// Returns the domain event, if this entry is one.
    pub fn event(&self) -> Option<&E> {
        self.payload.as_domain()
    }
}

/// An event produced since the aggregate was loaded, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent<E> {
    stream_name: Option<&'static str>,
    aggregate_id: Option<String>,
    etag: Option<String>,
    payload: Payload<E>,
}

impl<E: Event> PendingEvent<E> {
    /// Creates an event that is not attached to any aggregate yet.
    pub fn new(event: E) -> Self {
        Self {
            stream_name: None,
            aggregate_id: None,
            etag: None,
            payload: Payload::Domain(event),
        }
    }

    /// Sets the idempotency token.
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Sets the idempotency token of an event already recorded on a root.
    pub fn set_etag(&mut self, etag: impl Into<String>) -> &mut Self {
        self.etag = Some(etag.into());
        self
    }

    /// Returns the stream this event will be written to, once attached.
    pub fn stream_name(&self) -> Option<&'static str> {
        self.stream_name
    }
    /// Returns the aggregate this event belongs to, once attached.
    pub fn aggregate_id(&self) -> Option<&str> {
        self.aggregate_id.as_deref()
    }
    /// Returns the idempotency token, if any.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }
    /// Returns the event payload.
    pub fn payload(&self) -> &Payload<E> {
        &self.payload
    }
}

impl<E: Event> DeliveryDependency for PendingEvent<E> {
    fn reference(&mut self) -> Result<EventReference> {
        let (Some(stream_name), Some(aggregate_id)) = (self.stream_name, self.aggregate_id.clone())
        else {
            return Err(Error::ScheduleDependencyInvalid(format!(
                "{} event has no aggregate id",
                self.payload.event_type()
            )));
        };
        let etag = self.etag.get_or_insert_with(new_etag).clone();
        Ok(EventReference {
            stream_name: stream_name.to_owned(),
            aggregate_id,
            etag,
        })
    }
}

impl DeliveryDependency for EventRecord {
    fn reference(&mut self) -> Result<EventReference> {
        if self.aggregate_id.is_empty() {
            return Err(Error::ScheduleDependencyInvalid(format!(
                "{} event has no aggregate id",
                self.event_type
            )));
        }
        // A committed event cannot be given a token after the fact.
        let Some(etag) = self.etag.clone() else {
            return Err(Error::ScheduleDependencyInvalid(format!(
                "committed event {}/{}#{} has no etag",
                self.stream_name, self.aggregate_id, self.sequence_number
            )));
        };
        Ok(EventReference {
            stream_name: self.stream_name.clone(),
            aggregate_id: self.aggregate_id.clone(),
            etag,
        })
    }
}

/// An aggregate loaded in memory.
///
/// Holds the aggregate's state, the version (highest committed sequence
/// number), the committed history since the last snapshot, and the pending
/// events produced since it was loaded.
#[derive(Debug)]
pub struct Root<A: Aggregate> {
    id: A::Id,
    state: A,
    version: i64,
    history: Vec<StoredEvent<A::Event>>,
    pending: Vec<PendingEvent<A::Event>>,
}

impl<A: Aggregate> Root<A> {
    /// Creates a new aggregate with an empty stream.
    pub fn new(id: A::Id) -> Self {
        Self::restored(id, A::default(), 0)
    }

    /// Creates an aggregate from a restored state at `version`.
    pub(crate) fn restored(id: A::Id, state: A, version: i64) -> Self {
        Self {
            id,
            state,
            version,
            history: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Returns the aggregate ID.
    pub fn id(&self) -> &A::Id {
        &self.id
    }
    /// Returns the aggregate state.
    pub fn state(&self) -> &A {
        &self.state
    }
    /// Returns the highest committed sequence number.
    pub fn version(&self) -> i64 {
        self.version
    }
    /// Returns committed events loaded or saved through this instance.
    pub fn history(&self) -> &[StoredEvent<A::Event>] {
        &self.history
    }
    /// Returns events not yet persisted.
    pub fn pending(&self) -> &[PendingEvent<A::Event>] {
        &self.pending
    }

    /// Returns whether `etag` is already present in history or pending
    /// events.
    pub fn has_etag(&self, etag: &str) -> bool {
        self.history.iter().any(|e| e.etag() == Some(etag))
            || self.pending.iter().any(|e| e.etag() == Some(etag))
    }

    /// Applies an event to the state and adds it to the pending events.
    ///
    /// The returned reference can be used to set an etag or as a delivery
    /// dependency for a scheduled command.
    pub fn record(&mut self, event: A::Event) -> &mut PendingEvent<A::Event> {
        self.state.apply(&event);
        let aggregate_id = self.id.is_assigned().then(|| self.id.to_string());
        self.pending.push(PendingEvent {
            stream_name: Some(A::STREAM_NAME),
            aggregate_id,
            etag: None,
            payload: Payload::Domain(event),
        });
        let last = self.pending.len() - 1;
        &mut self.pending[last]
    }

    /// Handles a command and records the events it produces.
    pub async fn execute(&mut self, command: A::Command) -> std::result::Result<usize, A::Error> {
        let events = self.state.handle(command).await?;
        let produced = events.len();
        for event in events {
            self.record(event);
        }
        Ok(produced)
    }

    /// Handles a command unless `etag` has already been applied.
    ///
    /// The first produced event carries `etag`, so a second delivery of the
    /// same command is recognised here or, for events older than the loaded
    /// history, by the event store. Returns `false` when the command was
    /// skipped.
    pub async fn execute_idempotent(
        &mut self,
        command: A::Command,
        etag: &str,
    ) -> std::result::Result<bool, A::Error> {
        if self.has_etag(etag) {
            return Ok(false);
        }
        let first = self.pending.len();
        self.execute(command).await?;
        if let Some(event) = self.pending.get_mut(first) {
            event.etag = Some(etag.to_owned());
        }
        Ok(true)
    }

    /// Schedules a command for delivery to this aggregate.
    ///
    /// Records a command-scheduled entry in the pending events; saving the
    /// aggregate persists it and creates the scheduled command. A dependency
    /// without an aggregate id, or a pending position that does not exist,
    /// is rejected before anything is recorded, and one without an etag is
    /// assigned a fresh token.
    pub fn schedule(&mut self, scheduling: Scheduling<'_, A::Command>) -> Result<Uuid> {
        if !self.id.is_assigned() {
            return Err(Error::Validation(format!(
                "cannot schedule {} on a {} without an id",
                scheduling.command().command_type(),
                A::STREAM_NAME
            )));
        }
        let (command, due_time, dependency) = scheduling.into_parts();
        let depends_on = match dependency {
            None => None,
            Some(Dependency::Event(event)) => Some(event.reference()?),
            Some(Dependency::Pending(index)) => {
                let Some(event) = self.pending.get_mut(index) else {
                    return Err(Error::ScheduleDependencyInvalid(format!(
                        "{} has no pending event at {index}",
                        A::STREAM_NAME
                    )));
                };
                Some(event.reference()?)
            }
        };
        let scheduled = CommandScheduled {
            scheduled_command_id: Uuid::new_v4(),
            command_type: command.command_type().to_owned(),
            command: serde_json::to_value(&command)?,
            due_time,
            depends_on,
            etag: new_etag(),
        };
        let id = scheduled.scheduled_command_id;
        self.pending.push(PendingEvent {
            stream_name: Some(A::STREAM_NAME),
            aggregate_id: Some(self.id.to_string()),
            etag: None,
            payload: Payload::CommandScheduled(scheduled),
        });
        Ok(id)
    }

    /// Builds the records to append for the pending events.
    pub(crate) fn pending_records(&self, timestamp: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        let aggregate_id = self.id.to_string();
        self.pending
            .iter()
            .zip(self.version + 1..)
            .map(|(event, sequence_number)| {
                Ok(EventRecord {
                    stream_name: A::STREAM_NAME.to_owned(),
                    aggregate_id: aggregate_id.clone(),
                    sequence_number,
                    event_type: event.payload.event_type().to_owned(),
                    event_version: event.payload.event_version(),
                    body: event.payload.to_body()?,
                    etag: event.etag.clone(),
                    timestamp,
                })
            })
            .collect()
    }

    /// Moves the pending events into history once they are persisted.
    pub(crate) fn commit(&mut self, records: &[EventRecord]) {
        let pending = std::mem::take(&mut self.pending);
        for (event, record) in pending.into_iter().zip(records) {
            self.version = record.sequence_number;
            self.history.push(StoredEvent::new(
                record.aggregate_id.clone(),
                record.sequence_number,
                event.etag,
                record.timestamp,
                event.payload,
            ));
        }
    }

    /// Drops the pending events without persisting them.
    pub(crate) fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Applies a committed event loaded from the store.
    pub(crate) fn apply_committed(&mut self, event: StoredEvent<A::Event>) {
        if let Payload::Domain(domain) = &event.payload {
            self.state.apply(domain);
        }
        self.version = event.sequence_number;
        self.history.push(event);
    }
}
