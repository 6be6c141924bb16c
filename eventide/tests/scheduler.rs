//! Integration tests for scheduled command delivery.
#![allow(missing_docs)]

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rstest::rstest;
use uuid::Uuid;

use eventide::{
    Error, EventStore, ReadRange, Result as StoreResult, Root, async_trait,
    bus::{InMemoryEventBus, Publisher},
    clock::{Clock, VirtualClock},
    repository::{GenericRepository, Repository},
    root::COMMAND_SCHEDULED,
    schedule::{
        CommandStatus, Completion, ScheduledCommand, ScheduledCommandStore, Scheduling,
    },
    scheduler::{
        DeliveryFailure, DeliveryOutcome, DeliveryTarget, SchedulerEngine, SchedulerSettings,
    },
    store::{in_memory::InMemoryEventStore, in_memory_schedule::InMemoryScheduledCommandStore},
};

use common::{
    Harness, InvoiceEvent, Invoice, Order, OrderCommand, OrderEvent, epoch, placed_order,
    scheduled_row,
};

/// Fails the first `failures` deliveries, then succeeds.
struct FlakyTarget {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl DeliveryTarget for FlakyTarget {
    async fn deliver(&self, _command: &ScheduledCommand) -> Result<(), DeliveryFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(DeliveryFailure::Transient(format!("outage {call}")))
        } else {
            Ok(())
        }
    }
}

/// Records every command it is handed.
#[derive(Default)]
struct RecordingTarget {
    delivered: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl DeliveryTarget for RecordingTarget {
    async fn deliver(&self, command: &ScheduledCommand) -> Result<(), DeliveryFailure> {
        tokio::task::yield_now().await;
        self.delivered.lock().push(command.id);
        Ok(())
    }
}

/// Loses the first insert, as a crash between commit and insert would.
#[derive(Default)]
struct LossyInsertStore {
    inner: InMemoryScheduledCommandStore,
    lost_one: AtomicBool,
}

#[async_trait]
impl ScheduledCommandStore for LossyInsertStore {
    async fn insert(&self, command: ScheduledCommand) -> StoreResult<()> {
        if !self.lost_one.swap(true, Ordering::SeqCst) {
            return Err(Error::Store("connection reset".to_owned()));
        }
        self.inner.insert(command).await
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<ScheduledCommand>> {
        self.inner.get(id).await
    }

    async fn find_due(&self, as_of: DateTime<Utc>) -> StoreResult<Vec<ScheduledCommand>> {
        self.inner.find_due(as_of).await
    }

    async fn next_due_after(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.inner.next_due_after(after, until).await
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_attempts: i32,
        lease_expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.claim(id, expected_attempts, lease_expires, now).await
    }

    async fn complete(&self, id: Uuid, completion: Completion) -> StoreResult<()> {
        self.inner.complete(id, completion).await
    }
}

fn standalone_engine(
    settings: SchedulerSettings,
) -> (
    Arc<VirtualClock>,
    Arc<InMemoryScheduledCommandStore>,
    SchedulerEngine,
) {
    let clock = VirtualClock::start(epoch());
    let commands = Arc::new(InMemoryScheduledCommandStore::default());
    let engine = SchedulerEngine::new(
        commands.clone(),
        Arc::new(InMemoryEventStore::default()),
        clock.clone(),
    )
    .with_settings(settings);
    (clock, commands, engine)
}

async fn row(commands: &InMemoryScheduledCommandStore, id: Uuid) -> ScheduledCommand {
    commands
        .get(id)
        .await
        .expect("get scheduled command")
        .expect("scheduled command exists")
}

// -- Delivery ------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn immediate_command_is_delivered_by_sweep() {
    let h = Harness::new();
    let mut order = placed_order(&h).await;
    let id = order
        .schedule(Scheduling::new(OrderCommand::Ship))
        .expect("schedule");
    h.orders.save(&mut order).await.expect("save");

    let report = h.engine.sweep().await.expect("sweep");
    assert_eq!(report.outcome(id), Some(&DeliveryOutcome::Applied));

    let applied = row(&h.commands, id).await;
    assert_eq!(applied.status(), CommandStatus::Applied);
    assert_eq!(applied.attempts, 1);
    assert_eq!(applied.applied_time, Some(epoch()));
    assert_eq!(applied.last_result.as_deref(), Some("applied"));
    assert_eq!(applied.lease_expires, None);

    let shipped = h.orders.load(order.id()).await.expect("load");
    assert!(shipped.state().shipped);

    let again = h.engine.sweep().await.expect("second sweep");
    assert!(again.delivered.is_empty(), "applied commands are not redelivered");
}

#[test_log::test(tokio::test)]
async fn future_command_waits_for_the_clock() {
    let h = Harness::new();
    let mut order = placed_order(&h).await;
    let due = epoch() + TimeDelta::hours(1);
    let id = order
        .schedule(Scheduling::new(OrderCommand::Ship).due_at(due))
        .expect("schedule");
    h.orders.save(&mut order).await.expect("save");

    let report = h.engine.sweep().await.expect("sweep");
    assert_eq!(report.outcome(id), None, "not due yet");

    h.clock
        .advance_by(TimeDelta::minutes(30))
        .await
        .expect("advance");
    assert_eq!(row(&h.commands, id).await.status(), CommandStatus::Pending);

    h.clock
        .advance_by(TimeDelta::minutes(30))
        .await
        .expect("advance");
    let applied = row(&h.commands, id).await;
    assert_eq!(applied.status(), CommandStatus::Applied);
    assert_eq!(applied.applied_time, Some(due));

    let stream = h
        .events
        .read("order", &order.id().to_string(), ReadRange::after(3))
        .await
        .expect("read");
    assert_eq!(stream.len(), 1);
    assert_eq!(stream[0].event_type, "Shipped");
    assert_eq!(stream[0].timestamp, due, "delivered with the clock at its due time");
}

#[test_log::test(tokio::test)]
async fn advancing_the_clock_delivers_in_due_order() {
    let h = Harness::new();
    let mut order = placed_order(&h).await;
    let early = epoch() + TimeDelta::hours(1);
    let late = epoch() + TimeDelta::hours(2);
    order
        .schedule(
            Scheduling::new(OrderCommand::AddItem {
                sku: "late".to_owned(),
                quantity: 1,
            })
            .due_at(late),
        )
        .expect("schedule late");
    order
        .schedule(
            Scheduling::new(OrderCommand::AddItem {
                sku: "early".to_owned(),
                quantity: 1,
            })
            .due_at(early),
        )
        .expect("schedule early");
    h.orders.save(&mut order).await.expect("save");

    let now = h
        .clock
        .advance_by(TimeDelta::hours(3))
        .await
        .expect("advance");
    assert_eq!(now, epoch() + TimeDelta::hours(3));
    assert_eq!(h.clock.now(), now);

    let loaded = h.orders.load(order.id()).await.expect("load");
    let skus: Vec<&str> = loaded.state().items.iter().map(|(sku, _)| sku.as_str()).collect();
    assert_eq!(skus, vec!["tea", "early", "late"]);

    let added: Vec<_> = h
        .events
        .read("order", &order.id().to_string(), ReadRange::after(2))
        .await
        .expect("read")
        .into_iter()
        .filter(|r| r.event_type == "ItemAdded")
        .map(|r| r.timestamp)
        .collect();
    assert_eq!(added, vec![early, late]);
}

#[test_log::test(tokio::test)]
async fn rejection_is_terminal_and_recorded_by_the_aggregate() {
    let h = Harness::new();
    let mut order = placed_order(&h).await;
    order.record(OrderEvent::Cancelled);
    let id = order
        .schedule(Scheduling::new(OrderCommand::Ship))
        .expect("schedule");
    h.orders.save(&mut order).await.expect("save");

    let report = h.engine.sweep().await.expect("sweep");
    assert_eq!(
        report.outcome(id),
        Some(&DeliveryOutcome::Rejected("order is cancelled".to_owned()))
    );

    let failed = row(&h.commands, id).await;
    assert_eq!(failed.status(), CommandStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.final_attempt_time, Some(epoch()));
    assert_eq!(
        failed.last_result.as_deref(),
        Some("rejected: order is cancelled")
    );

    let loaded = h.orders.load(order.id()).await.expect("load");
    assert!(!loaded.state().shipped);
    assert_eq!(loaded.state().shipment_failures, vec!["order is cancelled"]);

    assert!(h.engine.sweep().await.expect("sweep").delivered.is_empty());
}

#[rstest]
#[case::first_try(0, 1, CommandStatus::Applied)]
#[case::recovers(2, 3, CommandStatus::Applied)]
#[case::gives_up(5, 3, CommandStatus::Failed)]
#[tokio::test]
async fn transient_failures_retry_until_the_ceiling(
    #[case] failures: usize,
    #[case] expected_attempts: i32,
    #[case] expected_status: CommandStatus,
) {
    let (_clock, commands, mut engine) =
        standalone_engine(SchedulerSettings::default().with_max_attempts(3));
    let target = Arc::new(FlakyTarget {
        failures,
        calls: AtomicUsize::new(0),
    });
    engine.register("flaky", target.clone());
    let command = scheduled_row("flaky", epoch());
    let id = command.id;
    commands.insert(command).await.expect("insert");

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        let report = engine.sweep().await.expect("sweep");
        outcomes.extend(report.outcome(id).cloned());
    }

    let finished = row(&commands, id).await;
    assert_eq!(finished.attempts, expected_attempts);
    assert_eq!(finished.status(), expected_status);
    assert_eq!(outcomes.len(), expected_attempts as usize);
    assert_eq!(target.calls.load(Ordering::SeqCst), expected_attempts as usize);
    match expected_status {
        CommandStatus::Applied => {
            assert_eq!(outcomes.last(), Some(&DeliveryOutcome::Applied));
        }
        _ => {
            assert_eq!(
                outcomes.last(),
                Some(&DeliveryOutcome::Abandoned("outage 2".to_owned()))
            );
            assert_eq!(finished.last_result.as_deref(), Some("failed: outage 2"));
            assert!(finished.final_attempt_time.is_some());
        }
    }
}

#[test_log::test(tokio::test)]
async fn retries_wait_for_the_retry_delay() {
    let (clock, commands, mut engine) = standalone_engine(
        SchedulerSettings::default().with_retry_delay(Duration::from_secs(600)),
    );
    engine.register(
        "flaky",
        Arc::new(FlakyTarget {
            failures: 1,
            calls: AtomicUsize::new(0),
        }),
    );
    let engine = Arc::new(engine);
    clock.subscribe(engine.clone());
    let command = scheduled_row("flaky", epoch());
    let id = command.id;
    commands.insert(command).await.expect("insert");

    let report = engine.sweep().await.expect("sweep");
    assert_eq!(
        report.outcome(id),
        Some(&DeliveryOutcome::Retrying("outage 0".to_owned()))
    );
    let waiting = row(&commands, id).await;
    assert_eq!(waiting.due_time, Some(epoch() + TimeDelta::minutes(10)));
    assert_eq!(waiting.last_result.as_deref(), Some("failed: outage 0"));
    assert!(engine.sweep().await.expect("sweep").delivered.is_empty());

    clock
        .advance_by(TimeDelta::minutes(10))
        .await
        .expect("advance");
    let applied = row(&commands, id).await;
    assert_eq!(applied.status(), CommandStatus::Applied);
    assert_eq!(applied.attempts, 2);
}

#[test_log::test(tokio::test)]
async fn panicking_handler_does_not_abort_the_sweep() {
    let h = Harness::new();
    let mut exploding = placed_order(&h).await;
    let mut healthy = placed_order(&h).await;
    let boom = exploding
        .schedule(Scheduling::new(OrderCommand::Explode))
        .expect("schedule");
    let ship = healthy
        .schedule(Scheduling::new(OrderCommand::Ship))
        .expect("schedule");
    h.orders.save(&mut exploding).await.expect("save");
    h.orders.save(&mut healthy).await.expect("save");

    let report = h.engine.sweep().await.expect("sweep");

    assert!(
        matches!(
            report.outcome(boom),
            Some(DeliveryOutcome::Retrying(reason)) if reason.contains("order exploded")
        ),
        "got {:?}",
        report.outcome(boom)
    );
    assert_eq!(report.outcome(ship), Some(&DeliveryOutcome::Applied));
    let still_pending = row(&h.commands, boom).await;
    assert_eq!(still_pending.status(), CommandStatus::Pending);
    assert_eq!(still_pending.attempts, 1);
}

// -- Dependencies --------------------------------------------------------

#[test_log::test(tokio::test)]
async fn dependency_gates_delivery_until_committed() {
    let h = Harness::new();
    let mut order = placed_order(&h).await;
    let mut invoice = Root::<Invoice>::new(Uuid::new_v4());
    let issued = invoice.record(InvoiceEvent::Issued {
        order_id: *order.id(),
        amount: 12,
    });
    let id = order
        .schedule(Scheduling::new(OrderCommand::Ship).after(issued))
        .expect("schedule");
    h.orders.save(&mut order).await.expect("save order");

    let row_before = row(&h.commands, id).await;
    let dependency = row_before.depends_on.clone().expect("dependency recorded");
    assert_eq!(dependency.stream_name, "invoice");
    assert_eq!(dependency.aggregate_id, invoice.id().to_string());
    assert_eq!(invoice.pending()[0].etag(), Some(dependency.etag.as_str()));

    let report = h.engine.sweep().await.expect("sweep");
    assert_eq!(report.outcome(id), Some(&DeliveryOutcome::Deferred));
    assert_eq!(row(&h.commands, id).await.attempts, 0, "deferral is not an attempt");

    h.invoices.save(&mut invoice).await.expect("save invoice");
    let report = h.engine.sweep().await.expect("sweep");
    assert_eq!(report.outcome(id), Some(&DeliveryOutcome::Applied));
    assert!(h.orders.load(order.id()).await.expect("load").state().shipped);
}

#[test_log::test(tokio::test)]
async fn command_can_wait_for_an_event_of_its_own_batch() {
    let h = Harness::new();
    let mut order = placed_order(&h).await;
    order.record(OrderEvent::ItemAdded {
        sku: "scarf".to_owned(),
        quantity: 1,
    });
    let id = order
        .schedule(Scheduling::new(OrderCommand::Ship).after_pending(0))
        .expect("schedule");
    h.orders.save(&mut order).await.expect("save");

    let report = h.engine.sweep().await.expect("sweep");
    assert_eq!(report.outcome(id), Some(&DeliveryOutcome::Applied));
    let loaded = h.orders.load(order.id()).await.expect("load");
    assert!(loaded.state().shipped);
    assert_eq!(loaded.state().items.len(), 2);
}

#[test_log::test(tokio::test)]
async fn future_command_survives_a_lost_insert() {
    let clock = VirtualClock::start(epoch());
    let events = Arc::new(InMemoryEventStore::default());
    let commands = Arc::new(LossyInsertStore::default());
    let orders = Arc::new(
        GenericRepository::<Order>::new(events.clone())
            .with_clock(clock.clone())
            .with_scheduled_commands(commands.clone()),
    );
    let mut engine = SchedulerEngine::new(commands.clone(), events.clone(), clock.clone());
    engine.register_repository::<Order, _>(orders.clone());
    let engine = Arc::new(engine);
    clock.subscribe(engine.clone());

    let mut order = Root::<Order>::new(Uuid::new_v4());
    order
        .execute(OrderCommand::Place {
            customer: "kim".to_owned(),
        })
        .await
        .expect("place");
    order
        .execute(OrderCommand::AddItem {
            sku: "tea".to_owned(),
            quantity: 1,
        })
        .await
        .expect("add");
    let id = order
        .schedule(Scheduling::new(OrderCommand::Ship).due_at(epoch() + TimeDelta::hours(1)))
        .expect("schedule");
    orders.save(&mut order).await.expect("save");
    assert!(commands.get(id).await.expect("get").is_none(), "insert was lost");

    let records = events
        .read("order", &order.id().to_string(), ReadRange::all())
        .await
        .expect("read");
    for record in &records {
        assert_eq!(
            engine.handle_published(record).await.expect("handle"),
            None,
            "nothing is due yet"
        );
    }
    let stored = commands.get(id).await.expect("get").expect("row restored");
    assert_eq!(stored.status(), CommandStatus::Pending);

    clock
        .advance_by(TimeDelta::hours(2))
        .await
        .expect("advance");
    assert_eq!(
        commands.get(id).await.expect("get").map(|c| c.status()),
        Some(CommandStatus::Applied)
    );
    assert!(orders.load(order.id()).await.expect("load").state().shipped);
}

// -- Concurrency and idempotency -----------------------------------------

#[test_log::test(tokio::test)]
async fn claims_are_exclusive_until_the_lease_expires() {
    let commands = InMemoryScheduledCommandStore::default();
    let command = scheduled_row("any", epoch());
    let id = command.id;
    commands.insert(command).await.expect("insert");
    let lease = epoch() + TimeDelta::minutes(5);

    assert!(commands.claim(id, 0, lease, epoch()).await.expect("claim"));
    assert!(!commands.claim(id, 0, lease, epoch()).await.expect("stale attempts"));
    assert!(!commands.claim(id, 1, lease, epoch()).await.expect("leased"));
    assert!(
        commands.find_due(epoch()).await.expect("find due").is_empty(),
        "leased commands are not due"
    );

    let later = lease + TimeDelta::seconds(1);
    assert_eq!(commands.find_due(later).await.expect("find due").len(), 1);
    assert!(commands.claim(id, 1, later + TimeDelta::minutes(5), later).await.expect("reclaim"));
    assert_eq!(row(&commands, id).await.attempts, 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_engines_deliver_each_command_once() {
    let clock = VirtualClock::start(epoch());
    let commands = Arc::new(InMemoryScheduledCommandStore::default());
    let events = Arc::new(InMemoryEventStore::default());
    let target = Arc::new(RecordingTarget::default());

    let mut ids = Vec::new();
    for _ in 0..20 {
        let command = scheduled_row("recorded", epoch());
        ids.push(command.id);
        commands.insert(command).await.expect("insert");
    }

    let mut handles = Vec::new();
    for _ in 0..3 {
        let mut engine = SchedulerEngine::new(commands.clone(), events.clone(), clock.clone());
        engine.register("recorded", target.clone());
        handles.push(tokio::spawn(async move { engine.sweep().await }));
    }
    for handle in handles {
        let report = handle.await.expect("join").expect("sweep");
        assert!(report.errors.is_empty());
    }

    let mut delivered = target.delivered.lock().clone();
    delivered.sort();
    ids.sort();
    assert_eq!(delivered, ids, "every command delivered exactly once");
    for id in ids {
        assert_eq!(row(&commands, id).await.attempts, 1);
    }
}

#[test_log::test(tokio::test)]
async fn redelivery_after_a_crash_has_no_second_effect() {
    let h = Harness::new();
    let mut order = placed_order(&h).await;
    let id = order
        .schedule(Scheduling::new(OrderCommand::AddItem {
            sku: "gift".to_owned(),
            quantity: 1,
        }))
        .expect("schedule");
    h.orders.save(&mut order).await.expect("save");
    h.engine.sweep().await.expect("sweep");

    // The same command again, as if the outcome had never been recorded.
    let mut lost = row(&h.commands, id).await;
    lost.id = Uuid::new_v4();
    lost.attempts = 0;
    lost.applied_time = None;
    lost.last_result = None;
    h.commands.insert(lost.clone()).await.expect("insert");

    let report = h.engine.sweep().await.expect("sweep");
    assert_eq!(report.outcome(lost.id), Some(&DeliveryOutcome::Applied));

    let loaded = h.orders.load(order.id()).await.expect("load");
    assert_eq!(loaded.state().items.len(), 2, "the gift was added once");
}

// -- Engine surface ------------------------------------------------------

#[test_log::test(tokio::test)]
async fn unknown_aggregate_types_are_left_pending() {
    let (_clock, commands, engine) = standalone_engine(SchedulerSettings::default());
    let command = scheduled_row("ghost", epoch());
    let id = command.id;
    commands.insert(command).await.expect("insert");

    let err = engine.deliver_by_id(id).await.expect_err("no target");
    assert!(matches!(err, Error::UnknownAggregateType(ref t) if t == "ghost"));
    let report = engine.sweep().await.expect("sweep");
    assert_eq!(report.errors.len(), 1);

    let untouched = row(&commands, id).await;
    assert_eq!(untouched.attempts, 0);
    assert_eq!(untouched.status(), CommandStatus::Pending);

    assert!(matches!(
        engine.deliver_by_id(Uuid::new_v4()).await,
        Err(Error::NotFound)
    ));
}

#[test_log::test(tokio::test)]
async fn due_commands_are_ordered_nulls_first() {
    let commands = InMemoryScheduledCommandStore::default();
    let mut overdue = scheduled_row("any", epoch() - TimeDelta::hours(3));
    overdue.due_time = Some(epoch() - TimeDelta::hours(1));
    let asap_newer = scheduled_row("any", epoch() - TimeDelta::hours(1));
    let asap_older = scheduled_row("any", epoch() - TimeDelta::hours(2));
    let mut future = scheduled_row("any", epoch() - TimeDelta::hours(4));
    future.due_time = Some(epoch() + TimeDelta::hours(1));
    for command in [&overdue, &asap_newer, &asap_older, &future] {
        commands.insert(command.clone()).await.expect("insert");
    }

    let due: Vec<Uuid> = commands
        .find_due(epoch())
        .await
        .expect("find due")
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(due, vec![asap_older.id, asap_newer.id, overdue.id]);

    let next = commands
        .next_due_after(epoch(), epoch() + TimeDelta::days(1))
        .await
        .expect("next due");
    assert_eq!(next, future.due_time);
}

#[test_log::test(tokio::test)]
async fn published_schedules_are_delivered_reactively() {
    let h = Harness::new();
    let mut order = placed_order(&h).await;
    let id = order
        .schedule(Scheduling::new(OrderCommand::Ship))
        .expect("schedule");
    order
        .schedule(
            Scheduling::new(OrderCommand::Cancel).due_at(epoch() + TimeDelta::days(1)),
        )
        .expect("schedule later");
    h.orders.save(&mut order).await.expect("save");

    let records = h
        .events
        .read("order", &order.id().to_string(), ReadRange::all())
        .await
        .expect("read");
    let scheduled: Vec<_> = records
        .iter()
        .filter(|r| r.event_type == COMMAND_SCHEDULED)
        .collect();
    assert_eq!(scheduled.len(), 2);

    assert_eq!(
        h.engine
            .handle_published(&records[0])
            .await
            .expect("domain event"),
        None
    );
    assert_eq!(
        h.engine
            .handle_published(scheduled[0])
            .await
            .expect("due schedule"),
        Some(DeliveryOutcome::Applied)
    );
    assert_eq!(
        h.engine
            .handle_published(scheduled[0])
            .await
            .expect("replayed schedule"),
        Some(DeliveryOutcome::Skipped)
    );
    assert_eq!(
        h.engine
            .handle_published(scheduled[1])
            .await
            .expect("future schedule"),
        None
    );
    assert_eq!(row(&h.commands, id).await.status(), CommandStatus::Applied);
}

#[test_log::test(tokio::test)]
async fn listening_engine_stores_and_delivers_published_schedules() {
    let clock = VirtualClock::start(epoch());
    let bus = Arc::new(InMemoryEventBus::default());
    let receiver = bus.subscribe();
    let settings = SchedulerSettings::default();
    let (publisher, _task) = Publisher::spawn(bus.clone(), 64);
    let events = Arc::new(InMemoryEventStore::default());
    let commands = Arc::new(InMemoryScheduledCommandStore::default());

    // The repository does not write scheduled command rows itself.
    let orders = Arc::new(
        GenericRepository::<Order>::new(events.clone())
            .with_clock(clock.clone())
            .with_publisher(publisher),
    );
    let mut engine = SchedulerEngine::new(commands.clone(), events.clone(), clock.clone())
        .with_settings(settings);
    engine.register_repository::<Order, _>(orders.clone());
    let engine = Arc::new(engine);
    let listener = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.listen(receiver).await })
    };

    let mut order = Root::<Order>::new(Uuid::new_v4());
    order.record(OrderEvent::Placed {
        customer: "lin".to_owned(),
    });
    let id = order
        .schedule(Scheduling::new(OrderCommand::AddItem {
            sku: "welcome-pack".to_owned(),
            quantity: 1,
        }))
        .expect("schedule");
    orders.save(&mut order).await.expect("save");

    let mut applied = false;
    for _ in 0..200 {
        if let Some(command) = commands.get(id).await.expect("get") {
            if command.status() == CommandStatus::Applied {
                applied = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(applied, "command delivered from the bus");
    let loaded = orders.load(order.id()).await.expect("load");
    assert_eq!(loaded.state().items, vec![("welcome-pack".to_owned(), 1)]);

    listener.abort();
}

#[test_log::test(tokio::test)]
async fn run_sweeps_until_shutdown() {
    let h = Harness::with_settings(
        SchedulerSettings::default().with_sweep_interval(Duration::from_millis(10)),
    );
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let runner = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .run(async move {
                    let _ = stopped.await;
                })
                .await;
        })
    };

    let mut order = placed_order(&h).await;
    let id = order
        .schedule(Scheduling::new(OrderCommand::Ship))
        .expect("schedule");
    h.orders.save(&mut order).await.expect("save");

    let mut applied = false;
    for _ in 0..200 {
        if row(&h.commands, id).await.status() == CommandStatus::Applied {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(applied, "periodic sweep delivered the command");

    stop.send(()).expect("runner is listening");
    tokio::time::timeout(Duration::from_secs(1), runner)
        .await
        .expect("runner stops")
        .expect("runner did not panic");
}
