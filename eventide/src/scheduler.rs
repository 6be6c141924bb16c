//! Delivery of scheduled commands.
//!
//! The [`SchedulerEngine`] picks up commands from a [`ScheduledCommandStore`]
//! and hands each one to the [`DeliveryTarget`] registered for its aggregate
//! type. Three paths lead to a delivery: events published on the bus
//! ([`SchedulerEngine::listen`]), periodic sweeps ([`SchedulerEngine::run`])
//! and a [`crate::clock::VirtualClock`] being advanced. They all end in
//! [`SchedulerEngine::deliver`].
use std::{
    collections::HashMap, future::Future, marker::PhantomData, panic::AssertUnwindSafe,
    sync::Arc, time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    Aggregate, AggregateId, Error, EventRecord, EventStore, Result,
    clock::{Clock, ClockListener},
    repository::Repository,
    root::COMMAND_SCHEDULED,
    schedule::{
        CommandScheduled, CommandStatus, Completion, DeliveryFailed, ScheduledCommand,
        ScheduledCommandStore,
    },
};

/// Tunables of the scheduler engine.
///
/// Deserializable so it can be embedded in an application's configuration;
/// missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Attempts after which a failing command is abandoned.
    pub max_attempts: i32,
    /// Delay before a failed command becomes due again.
    pub retry_delay: Duration,
    /// How long a claimed command is reserved for the claiming engine.
    pub lease: Duration,
    /// Interval between sweeps in [`SchedulerEngine::run`].
    pub sweep_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::ZERO,
            lease: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerSettings {
    /// Sets the number of attempts before a command is abandoned.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the delay before a failed command is retried.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the lease taken on a command while it is delivered.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Sets the interval between periodic sweeps.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

// Durations beyond chrono's range saturate at a century.
fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::weeks(52 * 100))
}

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    /// The aggregate refused the command. Never retried.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Something went wrong around the command. Retried until the attempt
    /// ceiling is reached.
    #[error("failed: {0}")]
    Transient(String),
}

impl From<Error> for DeliveryFailure {
    fn from(e: Error) -> Self {
        DeliveryFailure::Transient(e.to_string())
    }
}

/// What happened to one scheduled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The command was applied.
    Applied,
    /// The aggregate rejected the command; it will not be retried.
    Rejected(String),
    /// The attempt failed and the command stays pending.
    Retrying(String),
    /// The attempt failed and the attempt ceiling was reached.
    Abandoned(String),
    /// The command's dependency has not been committed yet. No attempt was
    /// counted.
    Deferred,
    /// The command was not due, already finished, or claimed by another
    /// engine.
    Skipped,
}

/// Outcomes of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Commands that were looked at, with what happened to them.
    pub delivered: Vec<(Uuid, DeliveryOutcome)>,
    /// Commands whose outcome could not be determined or recorded.
    pub errors: Vec<(Uuid, Error)>,
}

impl SweepReport {
    /// Returns the outcome recorded for `id`.
    pub fn outcome(&self, id: Uuid) -> Option<&DeliveryOutcome> {
        self.delivered
            .iter()
            .find(|(delivered, _)| *delivered == id)
            .map(|(_, outcome)| outcome)
    }
}

/// Applies scheduled commands of one aggregate type.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Applies `command`, whose `attempts` already counts this attempt.
    async fn deliver(&self, command: &ScheduledCommand) -> std::result::Result<(), DeliveryFailure>;
}

/// Delivers scheduled commands to aggregates loaded through a
/// [`Repository`].
pub struct RepositoryTarget<A, R> {
    repository: R,
    _phantom: PhantomData<fn() -> A>,
}

impl<A, R> RepositoryTarget<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    /// Creates a target backed by `repository`.
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<A, R> DeliveryTarget for RepositoryTarget<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    async fn deliver(&self, scheduled: &ScheduledCommand) -> std::result::Result<(), DeliveryFailure> {
        let command: A::Command = serde_json::from_value(scheduled.serialized_command.clone())
            .map_err(|e| {
                DeliveryFailure::Transient(format!(
                    "cannot decode {} command: {e}",
                    scheduled.command_type
                ))
            })?;
        let id = A::Id::parse(&scheduled.aggregate_id)?;
        let Some(mut root) = self.repository.get_latest(&id).await? else {
            return Err(DeliveryFailure::Transient(format!(
                "{} {id} does not exist",
                A::STREAM_NAME
            )));
        };

        match root
            .execute_idempotent(command.clone(), &scheduled.etag)
            .await
        {
            Ok(false) => {
                debug!(etag = %scheduled.etag, "scheduled command already applied");
                Ok(())
            }
            Ok(true) => {
                self.repository.save(&mut root).await?;
                Ok(())
            }
            Err(rejection) => {
                let reason = rejection.to_string();
                let failure = DeliveryFailed {
                    scheduled_command_id: scheduled.id,
                    command,
                    reason: reason.clone(),
                    attempts: scheduled.attempts,
                };
                let events = root.state().on_scheduled_command_failed(&failure);
                let failed_etag = format!("{}-failed", scheduled.etag);
                if !events.is_empty() && !root.has_etag(&failed_etag) {
                    let mut events = events.into_iter();
                    if let Some(first) = events.next() {
                        root.record(first).set_etag(failed_etag);
                    }
                    for event in events {
                        root.record(event);
                    }
                    if let Err(e) = self.repository.save(&mut root).await {
                        warn!(error = %e, "failed to save rejection events");
                    }
                }
                Err(DeliveryFailure::Rejected(reason))
            }
        }
    }
}

/// Delivers scheduled commands when they fall due.
pub struct SchedulerEngine {
    commands: Arc<dyn ScheduledCommandStore>,
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    targets: HashMap<String, Arc<dyn DeliveryTarget>>,
    settings: SchedulerSettings,
}

impl std::fmt::Debug for SchedulerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerEngine")
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SchedulerEngine {
    /// Creates an engine with default settings and no targets.
    pub fn new(
        commands: Arc<dyn ScheduledCommandStore>,
        events: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            commands,
            events,
            clock,
            targets: HashMap::new(),
            settings: SchedulerSettings::default(),
        }
    }

    /// Replaces the engine settings.
    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the engine settings.
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Registers the target for commands scheduled on `aggregate_type`.
    pub fn register(&mut self, aggregate_type: impl Into<String>, target: Arc<dyn DeliveryTarget>) {
        self.targets.insert(aggregate_type.into(), target);
    }

    /// Registers `repository` as the target for commands scheduled on `A`.
    pub fn register_repository<A, R>(&mut self, repository: R)
    where
        A: Aggregate,
        R: Repository<A> + 'static,
    {
        self.register(
            A::STREAM_NAME,
            Arc::new(RepositoryTarget::<A, R>::new(repository)),
        );
    }

    /// Attempts to deliver one scheduled command.
    ///
    /// Errors are only returned when the engine cannot act on the command or
    /// cannot record the outcome; failures of the command itself are
    /// recorded on the row and reported as a [`DeliveryOutcome`].
    #[instrument(skip(self, command), fields(scheduled_command.id = %command.id, aggregate_type = %command.aggregate_type, aggregate.id = %command.aggregate_id))]
    pub async fn deliver(&self, mut command: ScheduledCommand) -> Result<DeliveryOutcome> {
        let now = self.clock.now();
        if command.status() != CommandStatus::Pending || command.due_time.is_some_and(|t| t > now)
        {
            return Ok(DeliveryOutcome::Skipped);
        }
        let target = self
            .targets
            .get(&command.aggregate_type)
            .cloned()
            .ok_or_else(|| Error::UnknownAggregateType(command.aggregate_type.clone()))?;

        if let Some(dependency) = &command.depends_on {
            let committed = self
                .events
                .find_by_etag(
                    &dependency.stream_name,
                    &dependency.aggregate_id,
                    &dependency.etag,
                )
                .await?;
            if committed.is_none() {
                debug!(etag = %dependency.etag, "dependency not committed, deferring");
                return Ok(DeliveryOutcome::Deferred);
            }
        }

        let lease_expires = now + to_delta(self.settings.lease);
        if !self
            .commands
            .claim(command.id, command.attempts, lease_expires, now)
            .await?
        {
            debug!("scheduled command claimed elsewhere");
            return Ok(DeliveryOutcome::Skipped);
        }
        command.attempts += 1;

        let result = match self.already_applied(&command).await {
            Ok(true) => {
                debug!("scheduled command effects already committed");
                Ok(())
            }
            Ok(false) => match AssertUnwindSafe(target.deliver(&command))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(DeliveryFailure::Transient(format!(
                    "delivery panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            },
            Err(e) => Err(DeliveryFailure::from(e)),
        };

        let finished = self.clock.now();
        let (completion, outcome) = match result {
            Ok(()) => (
                Completion::Applied { at: finished },
                DeliveryOutcome::Applied,
            ),
            Err(DeliveryFailure::Rejected(reason)) => (
                Completion::Abandoned {
                    at: finished,
                    result: format!("rejected: {reason}"),
                },
                DeliveryOutcome::Rejected(reason),
            ),
            Err(DeliveryFailure::Transient(reason)) if command.attempts >= self.settings.max_attempts => (
                Completion::Abandoned {
                    at: finished,
                    result: format!("failed: {reason}"),
                },
                DeliveryOutcome::Abandoned(reason),
            ),
            Err(DeliveryFailure::Transient(reason)) => (
                Completion::Retry {
                    due_time: finished + to_delta(self.settings.retry_delay),
                    result: format!("failed: {reason}"),
                },
                DeliveryOutcome::Retrying(reason),
            ),
        };

        match &outcome {
            DeliveryOutcome::Applied => debug!(attempts = command.attempts, "scheduled command applied"),
            DeliveryOutcome::Retrying(reason) => {
                warn!(attempts = command.attempts, %reason, "scheduled command failed, will retry");
            }
            other => warn!(attempts = command.attempts, outcome = ?other, "scheduled command finished without applying"),
        }
        self.commands.complete(command.id, completion).await?;
        Ok(outcome)
    }

    /// Returns whether an event tagged with the command's etag is already
    /// in the target stream.
    async fn already_applied(&self, command: &ScheduledCommand) -> Result<bool> {
        Ok(self
            .events
            .find_by_etag(&command.aggregate_type, &command.aggregate_id, &command.etag)
            .await?
            .is_some())
    }

    /// Loads a scheduled command and delivers it.
    pub async fn deliver_by_id(&self, id: Uuid) -> Result<DeliveryOutcome> {
        match self.commands.get(id).await? {
            Some(command) => self.deliver(command).await,
            None => Err(Error::NotFound),
        }
    }

    /// Delivers every command due now, one at a time.
    ///
    /// A failing or panicking command never stops the sweep.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let due = self.commands.find_due(self.clock.now()).await?;
        let mut report = SweepReport::default();
        for command in due {
            let id = command.id;
            match self.deliver(command).await {
                Ok(outcome) => report.delivered.push((id, outcome)),
                Err(e) => {
                    error!(error = %e, scheduled_command.id = %id, "failed to deliver scheduled command");
                    report.errors.push((id, e));
                }
            }
        }
        if !report.delivered.is_empty() || !report.errors.is_empty() {
            info!(
                delivered = report.delivered.len(),
                errors = report.errors.len(),
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Reacts to one published record.
    ///
    /// Command-scheduled records are stored (a no-op when the repository
    /// stored them on save); those already due are delivered straight away.
    /// Anything else returns `None` and is left to sweeps.
    #[instrument(skip(self, record), fields(stream = %record.stream_name, aggregate.id = %record.aggregate_id, sequence = record.sequence_number))]
    pub async fn handle_published(&self, record: &EventRecord) -> Result<Option<DeliveryOutcome>> {
        if record.event_type != COMMAND_SCHEDULED {
            return Ok(None);
        }
        let scheduled: CommandScheduled = serde_json::from_value(record.body.clone())?;
        let id = scheduled.scheduled_command_id;
        let due = scheduled.is_due(self.clock.now());
        self.commands
            .insert(scheduled.into_scheduled_command(
                &record.stream_name,
                &record.aggregate_id,
                record.timestamp,
            ))
            .await?;
        if !due {
            return Ok(None);
        }
        self.deliver_by_id(id).await.map(Some)
    }

    /// Handles published records until the bus closes.
    ///
    /// Missed records are caught up on with a sweep.
    pub async fn listen(&self, mut receiver: broadcast::Receiver<EventRecord>) {
        loop {
            match receiver.recv().await {
                Ok(record) => {
                    if let Err(e) = self.handle_published(&record).await {
                        error!(error = %e, "failed to handle published event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event bus lagged, sweeping");
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "catch-up sweep failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Sweeps every [`SchedulerSettings::sweep_interval`] until `shutdown`
    /// completes.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.settings.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "sweep failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[async_trait]
impl ClockListener for SchedulerEngine {
    async fn next_due_after(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self.commands.next_due_after(after, until).await {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "failed to query next due time");
                None
            }
        }
    }

    async fn on_clock_advanced(&self, now: DateTime<Utc>) {
        debug!(%now, "clock advanced, sweeping");
        if let Err(e) = self.sweep().await {
            error!(error = %e, "sweep failed");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
