//! Provides a generic repository for loading and saving aggregates.
use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn};

use crate::{
    Aggregate, AppendOutcome, Error, EventRecord, EventStore, ReadRange, Result, Root,
    StoredEvent,
    bus::Publisher,
    clock::{Clock, SystemClock},
    root::COMMAND_SCHEDULED,
    schedule::{CommandScheduled, ScheduledCommandStore},
    snapshot::{SnapshotFilter, SnapshotRecord, SnapshotStore},
    upcaster::UpcasterChain,
};

/// What [`Repository::save`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// This many events were appended.
    Saved(usize),
    /// There were no pending events.
    Unchanged,
    /// A pending event's etag was already stored, so the batch had already
    /// been applied. Nothing was appended, the pending events were
    /// discarded and the root was reloaded from the store.
    Duplicate,
}

/// Defines the standard interface for a repository.
#[async_trait]
pub trait Repository<A: Aggregate>: Send + Sync {
    /// Loads the latest state of an aggregate, or `None` if it has no events
    /// and no snapshot.
    async fn get_latest(&self, id: &A::Id) -> Result<Option<Root<A>>>;

    /// Loads an aggregate as it was at `version`.
    async fn get_version(&self, id: &A::Id, version: i64) -> Result<Option<Root<A>>>;

    /// Loads an aggregate as it was at `timestamp`.
    async fn get_as_of(&self, id: &A::Id, timestamp: DateTime<Utc>) -> Result<Option<Root<A>>>;

    /// Loads the latest state of an aggregate, failing with
    /// [`Error::NotFound`] if it does not exist.
    async fn load(&self, id: &A::Id) -> Result<Root<A>> {
        self.get_latest(id).await?.ok_or(Error::NotFound)
    }

    /// Applies events committed since `root` was loaded. Pending events are
    /// left untouched.
    async fn refresh(&self, root: &mut Root<A>) -> Result<()>;

    /// Persists the pending events of `root`.
    async fn save(&self, root: &mut Root<A>) -> Result<SaveOutcome>;
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Latest,
    Version(i64),
    AsOf(DateTime<Utc>),
}

impl Bound {
    fn snapshot_filter(self) -> SnapshotFilter {
        match self {
            Bound::Latest => SnapshotFilter::default(),
            Bound::Version(v) => SnapshotFilter {
                max_version: Some(v),
                as_of: None,
            },
            Bound::AsOf(t) => SnapshotFilter {
                max_version: None,
                as_of: Some(t),
            },
        }
    }

    fn range_after(self, version: i64) -> ReadRange {
        let range = ReadRange::after(version);
        match self {
            Bound::Latest => range,
            Bound::Version(v) => range.up_to(v),
            Bound::AsOf(t) => range.as_of(t),
        }
    }
}

/// A generic, high-level repository for loading and saving aggregates.
///
/// Orchestrates the [`EventStore`], an optional [`SnapshotStore`], the
/// [`ScheduledCommandStore`] that receives commands scheduled by saved
/// events, and the [`Publisher`] that forwards saved events to the bus.
pub struct GenericRepository<A: Aggregate> {
    store: Arc<dyn EventStore>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    scheduled_commands: Option<Arc<dyn ScheduledCommandStore>>,
    publisher: Option<Publisher>,
    clock: Arc<dyn Clock>,
    upcasters: UpcasterChain,
    snapshot_frequency: Option<usize>,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> GenericRepository<A> {
    /// Creates a new `GenericRepository` reading the system clock.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            snapshot_store: None,
            scheduled_commands: None,
            publisher: None,
            clock: Arc::new(SystemClock),
            upcasters: UpcasterChain::new(),
            snapshot_frequency: None,
            _phantom: PhantomData,
        }
    }

    /// Sets the clock used to timestamp events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the snapshot store. It is only consulted for aggregates with
    /// [`Aggregate::SUPPORTS_SNAPSHOTS`].
    pub fn with_snapshot_store(mut self, snapshot_store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(snapshot_store);
        self
    }

    /// Sets the frequency at which snapshots should be created.
    ///
    /// For example, a value of `Some(100)` means a snapshot will be created
    /// every 100 events.
    pub fn with_snapshot_frequency(mut self, frequency: Option<usize>) -> Self {
        self.snapshot_frequency = frequency.filter(|f| *f > 0);
        self
    }

    /// Sets the upcaster chain for the repository.
    pub fn with_upcasters(mut self, upcasters: UpcasterChain) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Sets the store that receives commands scheduled by saved events.
    pub fn with_scheduled_commands(mut self, store: Arc<dyn ScheduledCommandStore>) -> Self {
        self.scheduled_commands = Some(store);
        self
    }

    /// Sets the publisher saved events are handed to.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn decode(&self, record: EventRecord) -> Result<StoredEvent<A::Event>> {
        StoredEvent::decode(self.upcasters.upcast(record)?)
    }

    #[instrument(skip(self), fields(stream = A::STREAM_NAME, aggregate.id = %id))]
    async fn rehydrate(&self, id: &A::Id, bound: Bound) -> Result<Option<Root<A>>> {
        let aggregate_id = id.to_string();

        // Start from a snapshot when possible so only the delta of events
        // that occurred afterwards is replayed.
        let snapshot = match &self.snapshot_store {
            Some(snapshots) if A::SUPPORTS_SNAPSHOTS => {
                snapshots
                    .load(A::STREAM_NAME, &aggregate_id, bound.snapshot_filter())
                    .await?
            }
            _ => None,
        };
        let has_snapshot = snapshot.is_some();
        let mut root = match snapshot {
            Some(record) => {
                let state: A::Snapshot = serde_json::from_value(record.body)?;
                Root::restored(id.clone(), A::from_snapshot(state), record.version)
            }
            None => Root::new(id.clone()),
        };

        let records = self
            .store
            .read(
                A::STREAM_NAME,
                &aggregate_id,
                bound.range_after(root.version()),
            )
            .await?;

        // Guard against loading a non-existing aggregate.
        if records.is_empty() && !has_snapshot {
            return Ok(None);
        }

        for record in records {
            root.apply_committed(self.decode(record)?);
        }
        Ok(Some(root))
    }

    async fn insert_scheduled_commands(&self, records: &[EventRecord]) {
        let Some(store) = &self.scheduled_commands else {
            return;
        };
        for record in records.iter().filter(|r| r.event_type == COMMAND_SCHEDULED) {
            let scheduled: CommandScheduled = match serde_json::from_value(record.body.clone()) {
                Ok(scheduled) => scheduled,
                Err(e) => {
                    error!(error = %e, sequence = record.sequence_number, "undecodable scheduled command");
                    continue;
                }
            };
            let command = scheduled.into_scheduled_command(
                &record.stream_name,
                &record.aggregate_id,
                record.timestamp,
            );
            let id = command.id;
            // The events are committed; the engine re-inserts the row when it
            // sees the published record, so a failure here is not fatal.
            if let Err(e) = store.insert(command).await {
                error!(error = %e, scheduled_command.id = %id, "failed to store scheduled command");
            }
        }
    }

    async fn take_snapshot(&self, root: &Root<A>, version_before_save: i64) {
        let (Some(snapshots), Some(frequency)) = (&self.snapshot_store, self.snapshot_frequency)
        else {
            return;
        };
        if !A::SUPPORTS_SNAPSHOTS {
            return;
        }
        let frequency = frequency as i64;
        if root.version() / frequency <= version_before_save / frequency {
            return;
        }
        let Some(state) = root.state().snapshot() else {
            return;
        };
        let record = match serde_json::to_value(state) {
            Ok(body) => SnapshotRecord {
                stream_name: A::STREAM_NAME.to_owned(),
                aggregate_id: root.id().to_string(),
                version: root.version(),
                timestamp: root
                    .history()
                    .last()
                    .map_or_else(|| self.clock.now(), |e| e.timestamp()),
                body,
            },
            Err(e) => {
                warn!(error = %e, "failed to serialize snapshot");
                return;
            }
        };
        if let Err(e) = snapshots.save(record).await {
            warn!(error = %e, version = root.version(), "failed to save snapshot");
        }
    }
}

#[async_trait]
impl<A> Repository<A> for GenericRepository<A>
where
    A: Aggregate,
{
    async fn get_latest(&self, id: &A::Id) -> Result<Option<Root<A>>> {
        self.rehydrate(id, Bound::Latest).await
    }

    async fn get_version(&self, id: &A::Id, version: i64) -> Result<Option<Root<A>>> {
        self.rehydrate(id, Bound::Version(version)).await
    }

    async fn get_as_of(&self, id: &A::Id, timestamp: DateTime<Utc>) -> Result<Option<Root<A>>> {
        self.rehydrate(id, Bound::AsOf(timestamp)).await
    }

    #[instrument(skip(self, root), fields(stream = A::STREAM_NAME, aggregate.id = %root.id(), version = root.version()))]
    async fn refresh(&self, root: &mut Root<A>) -> Result<()> {
        let records = self
            .store
            .read(
                A::STREAM_NAME,
                &root.id().to_string(),
                ReadRange::after(root.version()),
            )
            .await?;
        for record in records {
            root.apply_committed(self.decode(record)?);
        }
        Ok(())
    }

    #[instrument(skip(self, root), fields(stream = A::STREAM_NAME, aggregate.id = %root.id(), pending = root.pending().len()))]
    async fn save(&self, root: &mut Root<A>) -> Result<SaveOutcome> {
        if root.pending().is_empty() {
            return Ok(SaveOutcome::Unchanged);
        }

        let version_before_save = root.version();
        let records = root.pending_records(self.clock.now())?;

        match self.store.append(records.clone()).await? {
            AppendOutcome::Appended(count) => {
                debug!(count, "appended events");
            }
            AppendOutcome::Duplicate { etag } => {
                debug!(%etag, "events already applied, reloading aggregate");
                // Pending events were already applied to the state.
                root.discard_pending();
                if let Some(current) = self.rehydrate(root.id(), Bound::Latest).await? {
                    *root = current;
                }
                return Ok(SaveOutcome::Duplicate);
            }
        }
        root.commit(&records);

        self.insert_scheduled_commands(&records).await;
        self.take_snapshot(root, version_before_save).await;

        let saved = records.len();
        if let Some(publisher) = &self.publisher {
            publisher.publish(records);
        }
        Ok(SaveOutcome::Saved(saved))
    }
}

#[async_trait]
impl<A, R> Repository<A> for Arc<R>
where
    A: Aggregate,
    R: Repository<A> + Send + Sync,
{
    async fn get_latest(&self, id: &A::Id) -> Result<Option<Root<A>>> {
        (**self).get_latest(id).await
    }

    async fn get_version(&self, id: &A::Id, version: i64) -> Result<Option<Root<A>>> {
        (**self).get_version(id, version).await
    }

    async fn get_as_of(&self, id: &A::Id, timestamp: DateTime<Utc>) -> Result<Option<Root<A>>> {
        (**self).get_as_of(id, timestamp).await
    }

    async fn refresh(&self, root: &mut Root<A>) -> Result<()> {
        (**self).refresh(root).await
    }

    async fn save(&self, root: &mut Root<A>) -> Result<SaveOutcome> {
        (**self).save(root).await
    }
}
