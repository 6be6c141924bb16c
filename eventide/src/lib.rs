//! # Event Sourcing with Scheduled Commands
//!
//! `eventide` persists aggregates as append-only streams of events and lets a
//! command be scheduled for delivery to an aggregate at a later time,
//! optionally gated on another event having been committed first.
//!
//! ## Core Concepts
//!
//! - **[`Aggregate`]**: A consistency boundary that handles commands and
//!   produces events.
//! - **[`Root`]**: An aggregate loaded in memory, with its committed history
//!   and the events it has produced since it was loaded.
//! - **[`EventStore`]**: A durable, append-only store of [`EventRecord`]s.
//! - **[`snapshot::SnapshotStore`]**: An optional store of aggregate
//!   snapshots, used to shortcut replay.
//! - **[`repository::Repository`]**: Loads aggregates (latest, at a version,
//!   or as of a date) and saves their pending events with optimistic
//!   concurrency.
//! - **[`schedule::ScheduledCommandStore`]** and
//!   **[`scheduler::SchedulerEngine`]**: Durable scheduled commands and the
//!   engine that delivers them when they fall due.
//! - **[`clock::Clock`]**: The time source. [`clock::VirtualClock`] makes
//!   time-delayed delivery deterministic in tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventide::{Aggregate, Command, Event, Root, async_trait};
//! use eventide::repository::{GenericRepository, Repository};
//! use eventide::store::in_memory::InMemoryEventStore;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
//! pub enum AccountEvent {
//!     Opened,
//!     Credited { amount: u64 },
//! }
//! impl Event for AccountEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             AccountEvent::Opened => "Opened",
//!             AccountEvent::Credited { .. } => "Credited",
//!         }
//!     }
//!     fn event_version(&self) -> u16 { 1 }
//!     fn event_source(&self) -> &'static str { "urn:eventide:account" }
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub enum AccountCommand {
//!     Deposit { amount: u64 },
//! }
//! impl Command for AccountCommand {
//!     fn command_type(&self) -> &'static str { "Deposit" }
//! }
//!
//! #[derive(Debug, Default)]
//! pub struct Account {
//!     balance: u64,
//! }
//!
//! #[async_trait]
//! impl Aggregate for Account {
//!     type Id = Uuid;
//!     type Event = AccountEvent;
//!     type Command = AccountCommand;
//!     type Snapshot = ();
//!     type Error = std::convert::Infallible;
//!
//!     const STREAM_NAME: &'static str = "account";
//!
//!     fn apply(&mut self, event: &Self::Event) {
//!         if let AccountEvent::Credited { amount } = event {
//!             self.balance += amount;
//!         }
//!     }
//!
//!     async fn handle(&self, command: Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
//!         match command {
//!             AccountCommand::Deposit { amount } => Ok(vec![AccountEvent::Credited { amount }]),
//!         }
//!     }
//! }
//!
//! async fn deposit() -> eventide::Result<()> {
//!     let repo = GenericRepository::<Account>::new(Arc::new(InMemoryEventStore::default()));
//!     let mut account = Root::<Account>::new(Uuid::new_v4());
//!     account.record(AccountEvent::Opened);
//!     account.execute(AccountCommand::Deposit { amount: 10 }).await.ok();
//!     repo.save(&mut account).await?;
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

use std::fmt::{self, Debug};

pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

pub mod bus;
pub mod clock;
pub mod cloudevent;
pub mod repository;
pub mod root;
pub mod schedule;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod upcaster;

pub use cloudevent::CloudEvent;
pub use root::{Payload, PendingEvent, Root, StoredEvent};

/// The error type for this crate.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// Events were appended at sequence numbers that are already taken,
    /// meaning another writer saved the aggregate first.
    #[error("{0}")]
    Conflict(Box<ConcurrencyConflict>),
    /// Occurs when an aggregate could not be found.
    #[error("aggregate not found")]
    NotFound,
    /// Wraps an error from the underlying event, snapshot or scheduled
    /// command store.
    #[error("store error: {0}")]
    Store(String),
    /// An event, command or snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The operation was used in a way its contract does not allow.
    #[error("validation error: {0}")]
    Validation(String),
    /// A delivery dependency cannot be resolved to a concrete event.
    #[error("invalid delivery dependency: {0}")]
    ScheduleDependencyInvalid(String),
    /// No delivery target is registered for an aggregate type.
    #[error("no delivery target registered for aggregate type `{0}`")]
    UnknownAggregateType(String),
    /// The virtual clock was misused (stopped, or moved backwards).
    #[error("clock error: {0}")]
    Clock(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Details of an optimistic concurrency failure.
///
/// Carries both the events that were being appended and the events already
/// stored at the same positions so callers can diagnose the collision before
/// reloading and retrying.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyConflict {
    /// Stream the conflict occurred in.
    pub stream_name: String,
    /// Aggregate the conflict occurred on.
    pub aggregate_id: String,
    /// The records that could not be appended.
    pub attempted: Vec<EventRecord>,
    /// The records already stored at the attempted sequence numbers.
    pub existing: Vec<EventRecord>,
}

impl fmt::Display for ConcurrencyConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self.attempted.first().map_or(0, |r| r.sequence_number);
        write!(
            f,
            "concurrency conflict on {}/{}: {} event(s) already stored from sequence {first}",
            self.stream_name,
            self.aggregate_id,
            self.existing.len()
        )
    }
}

/// A trait for events.
///
/// Events must be serializable, deserializable, clonable, and debuggable.
/// The `Event` derive macro from `eventide-derive` implements this trait for
/// enums.
pub trait Event: Serialize + DeserializeOwned + Clone + Debug + Send + Sync {
    /// Returns a static string slice representing the type of the event.
    fn event_type(&self) -> &'static str;

    /// Returns the version of the event's schema.
    fn event_version(&self) -> u16;

    /// Returns the CloudEvent `source` URI associated with this event.
    fn event_source(&self) -> &'static str;
}

/// A trait for commands.
///
/// Commands are serialized when they are scheduled, so they carry the same
/// bounds as events.
pub trait Command: Serialize + DeserializeOwned + Clone + Debug + Send + Sync {
    /// Returns a stable name for the kind of command.
    fn command_type(&self) -> &'static str;
}

/// Uniquely identifies an aggregate instance.
pub trait AggregateId:
    Eq + std::hash::Hash + Clone + Send + Sync + Debug + fmt::Display + 'static
{
    /// Creates a new, unique aggregate ID.
    fn new() -> Self;

    /// Parses an ID from its stored string form.
    fn parse(raw: &str) -> Result<Self>;

    /// Returns `false` for placeholder values that do not identify any
    /// aggregate (the nil UUID, the empty string).
    fn is_assigned(&self) -> bool {
        true
    }
}

impl AggregateId for Uuid {
    fn new() -> Self {
        Uuid::new_v4()
    }

    fn parse(raw: &str) -> Result<Self> {
        Uuid::parse_str(raw).map_err(|e| Error::Validation(format!("invalid aggregate id: {e}")))
    }

    fn is_assigned(&self) -> bool {
        !self.is_nil()
    }
}

impl AggregateId for String {
    fn new() -> Self {
        Uuid::new_v4().to_string()
    }

    fn parse(raw: &str) -> Result<Self> {
        Ok(raw.to_owned())
    }

    fn is_assigned(&self) -> bool {
        !self.is_empty()
    }
}

/// An aggregate is a consistency boundary. It is the fundamental building block
/// of the domain model.
///
/// The trait is the capability interface the generic repository and
/// scheduler work through: state transitions (`apply`), command handling
/// (`handle`), optional snapshot support, and an optional hook that turns a
/// rejected scheduled command into domain events.
#[async_trait]
pub trait Aggregate: Default + Send + Sync + 'static {
    /// The type of the aggregate's unique identifier.
    type Id: AggregateId;
    /// The type of events that this aggregate produces.
    type Event: Event;
    /// The type of commands that this aggregate can handle.
    type Command: Command;
    /// The type of snapshot that this aggregate can produce. Use `()` when
    /// snapshots are not supported.
    type Snapshot: Snapshot;
    /// The business rejection returned when a command is refused.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Name of the stream this aggregate's events live in. Also used as the
    /// aggregate type of its scheduled commands.
    const STREAM_NAME: &'static str;

    /// Whether the repository should read and write snapshots.
    const SUPPORTS_SNAPSHOTS: bool = false;

    /// Applies an event to the aggregate, changing its state.
    fn apply(&mut self, event: &Self::Event);

    /// Handles a command and returns the events it produces, or a business
    /// rejection.
    async fn handle(
        &self,
        command: Self::Command,
    ) -> std::result::Result<Vec<Self::Event>, Self::Error>;

    /// Restores the aggregate's state from a snapshot.
    fn from_snapshot(snapshot: Self::Snapshot) -> Self {
        let _ = snapshot;
        Self::default()
    }

    /// Creates a snapshot of the aggregate's current state.
    fn snapshot(&self) -> Option<Self::Snapshot> {
        None
    }

    /// Returns events to record when a scheduled command was rejected by
    /// [`Aggregate::handle`]. Returning nothing leaves the failure recorded
    /// only on the scheduled command.
    fn on_scheduled_command_failed(
        &self,
        failure: &schedule::DeliveryFailed<Self::Command>,
    ) -> Vec<Self::Event> {
        let _ = failure;
        Vec::new()
    }

    /// Restores the aggregate's state from a sequence of events.
    fn load<E: Into<Self::Event>, I: IntoIterator<Item = E>>(events: I) -> Self {
        let mut aggregate = Self::default();
        for event in events {
            aggregate.apply(&event.into());
        }
        aggregate
    }
}

/// A marker trait for snapshots.
pub trait Snapshot: Serialize + DeserializeOwned + Clone + Debug + Send + Sync {}

impl Snapshot for () {}

/// A persisted event row, independent of the aggregate type it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// The stream (aggregate type) this event belongs to.
    pub stream_name: String,
    /// The ID of the aggregate this event belongs to.
    pub aggregate_id: String,
    /// Position in the aggregate's stream, starting at 1.
    pub sequence_number: i64,
    /// The type of the event.
    pub event_type: String,
    /// The version of the event's schema.
    pub event_version: u16,
    /// The serialized event payload.
    pub body: serde_json::Value,
    /// Idempotency token, unique per aggregate when present.
    pub etag: Option<String>,
    /// When the event was committed.
    pub timestamp: DateTime<Utc>,
}

/// Bounds applied when reading an aggregate's stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadRange {
    /// Only events with a sequence number greater than this are returned.
    pub after: i64,
    /// Only events with a sequence number up to and including this are
    /// returned.
    pub up_to: Option<i64>,
    /// Only events committed at or before this instant are returned.
    pub as_of: Option<DateTime<Utc>>,
}

impl ReadRange {
    /// The whole stream.
    pub fn all() -> Self {
        Self::default()
    }

    /// Events after the given sequence number.
    pub fn after(sequence_number: i64) -> Self {
        Self {
            after: sequence_number,
            ..Self::default()
        }
    }

    /// Restricts the range to sequence numbers up to `version`.
    pub fn up_to(mut self, version: i64) -> Self {
        self.up_to = Some(version);
        self
    }

    /// Restricts the range to events committed at or before `timestamp`.
    pub fn as_of(mut self, timestamp: DateTime<Utc>) -> Self {
        self.as_of = Some(timestamp);
        self
    }

    /// Returns whether a record falls inside the range.
    pub fn contains(&self, record: &EventRecord) -> bool {
        record.sequence_number > self.after
            && self.up_to.is_none_or(|v| record.sequence_number <= v)
            && self.as_of.is_none_or(|t| record.timestamp <= t)
    }
}

/// Result of a successful call to [`EventStore::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The records were appended.
    Appended(usize),
    /// One of the records carries an etag that is already stored for the
    /// aggregate. Nothing was appended.
    Duplicate {
        /// The colliding etag.
        etag: String,
    },
}

/// The trait for event stores.
///
/// A single store holds the streams of every aggregate type; records are
/// keyed by `(stream_name, aggregate_id, sequence_number)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends records to one aggregate's stream.
    ///
    /// This operation must be atomic. The records must share one stream and
    /// aggregate and carry consecutive sequence numbers. If any record's etag
    /// is already stored for the aggregate, nothing is written and
    /// [`AppendOutcome::Duplicate`] is returned. If any sequence number is
    /// already taken, [`Error::Conflict`] is returned.
    async fn append(&self, records: Vec<EventRecord>) -> Result<AppendOutcome>;

    /// Reads an aggregate's stream in sequence order, restricted to `range`.
    async fn read(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        range: ReadRange,
    ) -> Result<Vec<EventRecord>>;

    /// Finds the event carrying `etag` in an aggregate's stream.
    async fn find_by_etag(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        etag: &str,
    ) -> Result<Option<EventRecord>>;
}

/// Generates a fresh idempotency token.
pub(crate) fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}
