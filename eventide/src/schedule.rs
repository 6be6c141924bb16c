//! Scheduled commands: the scheduling request recorded in a stream, the
//! durable row the scheduler works from, and the store that holds the rows.
use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Command, Result};

/// Identifies an event by aggregate and etag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventReference {
    /// Stream the event is written to.
    pub stream_name: String,
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Idempotency token of the event.
    pub etag: String,
}

/// Something a scheduled command can wait for.
///
/// Resolving the dependency validates it and, for events that are not yet
/// persisted, assigns an etag so the event can be matched once committed.
pub trait DeliveryDependency {
    /// Returns the reference the scheduled command will wait for.
    fn reference(&mut self) -> Result<EventReference>;
}

/// A request to schedule a command, built with [`Scheduling::new`] and
/// passed to [`crate::Root::schedule`].
pub struct Scheduling<'a, C> {
    command: C,
    due_time: Option<DateTime<Utc>>,
    dependency: Option<Dependency<'a>>,
}

/// What a [`Scheduling`] waits for, resolved by [`crate::Root::schedule`].
pub(crate) enum Dependency<'a> {
    /// An event held outside the scheduling aggregate.
    Event(&'a mut dyn DeliveryDependency),
    /// A pending event of the scheduling aggregate, by position.
    Pending(usize),
}

impl<'a, C: Command> Scheduling<'a, C> {
    /// Schedules `command` for delivery as soon as possible.
    pub fn new(command: C) -> Self {
        Self {
            command,
            due_time: None,
            dependency: None,
        }
    }

    /// Delays delivery until `due_time`.
    pub fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    /// Holds delivery until `dependency` has been committed.
    pub fn after(mut self, dependency: &'a mut dyn DeliveryDependency) -> Self {
        self.dependency = Some(Dependency::Event(dependency));
        self
    }

    /// Holds delivery until the scheduling aggregate's own pending event at
    /// `index` (a position in [`crate::Root::pending`]) has been committed.
    pub fn after_pending(mut self, index: usize) -> Self {
        self.dependency = Some(Dependency::Pending(index));
        self
    }

    /// Returns the command being scheduled.
    pub fn command(&self) -> &C {
        &self.command
    }

    pub(crate) fn into_parts(
        self,
    ) -> (C, Option<DateTime<Utc>>, Option<Dependency<'a>>) {
        (self.command, self.due_time, self.dependency)
    }
}

/// Body of the command-scheduled entry recorded in the target's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandScheduled {
    /// ID of the scheduled command row.
    pub scheduled_command_id: Uuid,
    /// Name of the command type.
    pub command_type: String,
    /// The serialized command.
    pub command: serde_json::Value,
    /// When the command falls due; `None` means as soon as possible.
    pub due_time: Option<DateTime<Utc>>,
    /// Event that must be committed before delivery.
    pub depends_on: Option<EventReference>,
    /// Etag the command's effects are tagged with.
    pub etag: String,
}

impl CommandScheduled {
    /// Returns whether the command is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_time.is_none_or(|t| t <= now)
    }

    /// Builds the scheduled command row for an entry in `aggregate_type`'s
    /// stream.
    pub fn into_scheduled_command(
        self,
        aggregate_type: &str,
        aggregate_id: &str,
        created_time: DateTime<Utc>,
    ) -> ScheduledCommand {
        ScheduledCommand {
            id: self.scheduled_command_id,
            aggregate_id: aggregate_id.to_owned(),
            aggregate_type: aggregate_type.to_owned(),
            command_type: self.command_type,
            serialized_command: self.command,
            etag: self.etag,
            due_time: self.due_time,
            depends_on: self.depends_on,
            attempts: 0,
            applied_time: None,
            final_attempt_time: None,
            last_result: None,
            created_time,
            lease_expires: None,
        }
    }
}

/// Where a scheduled command is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Waiting for delivery, possibly after failed attempts.
    Pending,
    /// Delivered successfully.
    Applied,
    /// Given up on; no further delivery is attempted.
    Failed,
}

/// A durable scheduled command. Rows are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    /// Unique ID of the scheduled command.
    pub id: Uuid,
    /// Target aggregate.
    pub aggregate_id: String,
    /// Stream name of the target aggregate type.
    pub aggregate_type: String,
    /// Name of the command type.
    pub command_type: String,
    /// The serialized command.
    pub serialized_command: serde_json::Value,
    /// Etag the command's effects are tagged with.
    pub etag: String,
    /// When the command falls due; `None` means as soon as possible.
    pub due_time: Option<DateTime<Utc>>,
    /// Event that must be committed before delivery.
    pub depends_on: Option<EventReference>,
    /// Number of delivery attempts claimed so far.
    pub attempts: i32,
    /// When the command was applied.
    pub applied_time: Option<DateTime<Utc>>,
    /// When the scheduler gave up on the command.
    pub final_attempt_time: Option<DateTime<Utc>>,
    /// Description of the last attempt's outcome.
    pub last_result: Option<String>,
    /// When the command was scheduled.
    pub created_time: DateTime<Utc>,
    /// An engine holds the command until this instant.
    pub lease_expires: Option<DateTime<Utc>>,
}

impl ScheduledCommand {
    /// Returns the lifecycle status.
    pub fn status(&self) -> CommandStatus {
        if self.applied_time.is_some() {
            CommandStatus::Applied
        } else if self.final_attempt_time.is_some() {
            CommandStatus::Failed
        } else {
            CommandStatus::Pending
        }
    }

    /// Returns whether the command should be delivered by a sweep at
    /// `as_of`.
    pub fn is_due(&self, as_of: DateTime<Utc>) -> bool {
        self.status() == CommandStatus::Pending
            && self.due_time.is_none_or(|t| t <= as_of)
            && self.lease_expires.is_none_or(|t| t <= as_of)
    }

    /// Returns whether a claim expecting `expected_attempts` can succeed at
    /// `now`.
    pub fn is_claimable(&self, expected_attempts: i32, now: DateTime<Utc>) -> bool {
        self.status() == CommandStatus::Pending
            && self.attempts == expected_attempts
            && self.lease_expires.is_none_or(|t| t <= now)
    }

    /// Applies a completed attempt to the row.
    pub fn complete(&mut self, completion: &Completion) {
        self.lease_expires = None;
        match completion {
            Completion::Applied { at } => {
                self.applied_time = Some(*at);
                self.last_result = Some("applied".to_owned());
            }
            Completion::Retry { due_time, result } => {
                self.due_time = Some(*due_time);
                self.last_result = Some(result.clone());
            }
            Completion::Abandoned { at, result } => {
                self.final_attempt_time = Some(*at);
                self.last_result = Some(result.clone());
            }
        }
    }
}

/// Due-query ordering: as-soon-as-possible commands first, then by due time,
/// then by creation.
pub fn due_order(a: &ScheduledCommand, b: &ScheduledCommand) -> Ordering {
    match (a.due_time, b.due_time) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
    .then(a.created_time.cmp(&b.created_time))
}

/// The outcome of a delivery attempt, as written back to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The command was applied.
    Applied {
        /// When it was applied.
        at: DateTime<Utc>,
    },
    /// The attempt failed and the command stays pending.
    Retry {
        /// When the command becomes due again.
        due_time: DateTime<Utc>,
        /// Description of the failure.
        result: String,
    },
    /// The command will not be delivered.
    Abandoned {
        /// When the scheduler gave up.
        at: DateTime<Utc>,
        /// Description of the failure.
        result: String,
    },
}

/// Passed to [`crate::Aggregate::on_scheduled_command_failed`] when the
/// target aggregate rejects a scheduled command.
#[derive(Debug, Clone)]
pub struct DeliveryFailed<C> {
    /// ID of the scheduled command.
    pub scheduled_command_id: Uuid,
    /// The rejected command.
    pub command: C,
    /// The rejection message.
    pub reason: String,
    /// Attempts made, including this one.
    pub attempts: i32,
}

/// Durable storage for scheduled commands.
#[async_trait]
pub trait ScheduledCommandStore: Send + Sync {
    /// Inserts a scheduled command. Inserting an ID that already exists is a
    /// no-op.
    async fn insert(&self, command: ScheduledCommand) -> Result<()>;

    /// Loads one scheduled command.
    async fn get(&self, id: Uuid) -> Result<Option<ScheduledCommand>>;

    /// Returns the pending commands due at `as_of`, in [`due_order`].
    async fn find_due(&self, as_of: DateTime<Utc>) -> Result<Vec<ScheduledCommand>>;

    /// Returns the earliest due time of a pending command in
    /// `(after, until]`.
    async fn next_due_after(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Atomically claims a command for delivery.
    ///
    /// Succeeds only when the command is still pending, unleased at `now`
    /// and has exactly `expected_attempts` attempts. A successful claim
    /// increments the attempt count and leases the command until
    /// `lease_expires`.
    async fn claim(
        &self,
        id: Uuid,
        expected_attempts: i32,
        lease_expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Records the outcome of an attempt and releases the lease.
    async fn complete(&self, id: Uuid, completion: Completion) -> Result<()>;
}
