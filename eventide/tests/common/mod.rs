//! Fixtures shared by the integration tests: an `Order` aggregate that
//! supports snapshots and a failure hook, an `Invoice` aggregate living in a
//! second stream, and a harness wiring both to in-memory stores, a virtual
//! clock and a scheduler engine.
#![allow(missing_docs)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eventide::{
    Aggregate, Root, Snapshot, async_trait,
    clock::VirtualClock,
    repository::{GenericRepository, Repository},
    schedule::{DeliveryFailed, ScheduledCommand},
    scheduler::{SchedulerEngine, SchedulerSettings},
    store::{
        in_memory::InMemoryEventStore, in_memory_schedule::InMemoryScheduledCommandStore,
        in_memory_snapshot::InMemorySnapshotStore,
    },
};
use eventide_derive::{Command as DeriveCommand, Event as DeriveEvent};

/// Start of every virtual timeline.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

// -- Order ---------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, DeriveEvent)]
#[event(source = "urn:eventide:order")]
pub enum OrderEvent {
    Placed {
        customer: String,
    },
    #[event(version = 2)]
    ItemAdded {
        sku: String,
        quantity: u32,
    },
    Shipped,
    Cancelled,
    ShipmentFailed {
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, DeriveCommand)]
pub enum OrderCommand {
    Place { customer: String },
    AddItem { sku: String, quantity: u32 },
    Ship,
    Cancel,
    /// Panics inside the handler.
    Explode,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("order is cancelled")]
    Cancelled,
    #[error("order has already shipped")]
    AlreadyShipped,
    #[error("order has no items")]
    Empty,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub customer: Option<String>,
    pub items: Vec<(String, u32)>,
    pub shipped: bool,
    pub cancelled: bool,
    pub shipment_failures: Vec<String>,
}

impl Snapshot for Order {}

#[async_trait]
impl Aggregate for Order {
    type Id = Uuid;
    type Event = OrderEvent;
    type Command = OrderCommand;
    type Snapshot = Order;
    type Error = OrderError;

    const STREAM_NAME: &'static str = "order";
    const SUPPORTS_SNAPSHOTS: bool = true;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Placed { customer } => self.customer = Some(customer.clone()),
            OrderEvent::ItemAdded { sku, quantity } => self.items.push((sku.clone(), *quantity)),
            OrderEvent::Shipped => self.shipped = true,
            OrderEvent::Cancelled => self.cancelled = true,
            OrderEvent::ShipmentFailed { reason } => self.shipment_failures.push(reason.clone()),
        }
    }

    async fn handle(
        &self,
        command: Self::Command,
    ) -> std::result::Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::Place { customer } => Ok(vec![OrderEvent::Placed { customer }]),
            OrderCommand::AddItem { sku, quantity } => {
                if self.cancelled {
                    return Err(OrderError::Cancelled);
                }
                Ok(vec![OrderEvent::ItemAdded { sku, quantity }])
            }
            OrderCommand::Ship => {
                if self.cancelled {
                    return Err(OrderError::Cancelled);
                }
                if self.shipped {
                    return Err(OrderError::AlreadyShipped);
                }
                if self.items.is_empty() {
                    return Err(OrderError::Empty);
                }
                Ok(vec![OrderEvent::Shipped])
            }
            OrderCommand::Cancel => {
                if self.shipped {
                    return Err(OrderError::AlreadyShipped);
                }
                Ok(vec![OrderEvent::Cancelled])
            }
            OrderCommand::Explode => panic!("order exploded"),
        }
    }

    fn from_snapshot(snapshot: Self::Snapshot) -> Self {
        snapshot
    }

    fn snapshot(&self) -> Option<Self::Snapshot> {
        Some(self.clone())
    }

    fn on_scheduled_command_failed(
        &self,
        failure: &DeliveryFailed<Self::Command>,
    ) -> Vec<Self::Event> {
        match failure.command {
            OrderCommand::Ship => vec![OrderEvent::ShipmentFailed {
                reason: failure.reason.clone(),
            }],
            _ => Vec::new(),
        }
    }
}

// -- Invoice -------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, DeriveEvent)]
#[event(source = "urn:eventide:invoice")]
pub enum InvoiceEvent {
    Issued { order_id: Uuid, amount: u64 },
    Paid,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, DeriveCommand)]
pub enum InvoiceCommand {
    Pay,
}

#[derive(Debug, thiserror::Error)]
#[error("invoice was never issued")]
pub struct NotIssued;

#[derive(Debug, Default)]
pub struct Invoice {
    pub amount: Option<u64>,
    pub paid: bool,
}

#[async_trait]
impl Aggregate for Invoice {
    type Id = Uuid;
    type Event = InvoiceEvent;
    type Command = InvoiceCommand;
    type Snapshot = ();
    type Error = NotIssued;

    const STREAM_NAME: &'static str = "invoice";

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::Issued { amount, .. } => self.amount = Some(*amount),
            InvoiceEvent::Paid => self.paid = true,
        }
    }

    async fn handle(
        &self,
        command: Self::Command,
    ) -> std::result::Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::Pay if self.amount.is_some() => Ok(vec![InvoiceEvent::Paid]),
            InvoiceCommand::Pay => Err(NotIssued),
        }
    }
}

// -- Harness -------------------------------------------------------------

/// Repositories, stores and an engine sharing one virtual clock.
pub struct Harness {
    pub clock: Arc<VirtualClock>,
    pub events: Arc<InMemoryEventStore>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub commands: Arc<InMemoryScheduledCommandStore>,
    pub orders: Arc<GenericRepository<Order>>,
    pub invoices: Arc<GenericRepository<Invoice>>,
    pub engine: Arc<SchedulerEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SchedulerSettings::default())
    }

    pub fn with_settings(settings: SchedulerSettings) -> Self {
        let clock = VirtualClock::start(epoch());
        let events = Arc::new(InMemoryEventStore::default());
        let snapshots = Arc::new(InMemorySnapshotStore::default());
        let commands = Arc::new(InMemoryScheduledCommandStore::default());

        let orders = Arc::new(
            GenericRepository::<Order>::new(events.clone())
                .with_clock(clock.clone())
                .with_snapshot_store(snapshots.clone())
                .with_snapshot_frequency(Some(2))
                .with_scheduled_commands(commands.clone()),
        );
        let invoices = Arc::new(
            GenericRepository::<Invoice>::new(events.clone())
                .with_clock(clock.clone())
                .with_scheduled_commands(commands.clone()),
        );

        let mut engine = SchedulerEngine::new(commands.clone(), events.clone(), clock.clone())
            .with_settings(settings);
        engine.register_repository::<Order, _>(orders.clone());
        engine.register_repository::<Invoice, _>(invoices.clone());
        let engine = Arc::new(engine);
        clock.subscribe(engine.clone());

        Self {
            clock,
            events,
            snapshots,
            commands,
            orders,
            invoices,
            engine,
        }
    }
}

/// A pending scheduled command row for `aggregate_type`, due immediately.
pub fn scheduled_row(aggregate_type: &str, created_time: DateTime<Utc>) -> ScheduledCommand {
    ScheduledCommand {
        id: Uuid::new_v4(),
        aggregate_id: Uuid::new_v4().to_string(),
        aggregate_type: aggregate_type.to_owned(),
        command_type: "Noop".to_owned(),
        serialized_command: serde_json::Value::Null,
        etag: Uuid::new_v4().simple().to_string(),
        due_time: None,
        depends_on: None,
        attempts: 0,
        applied_time: None,
        final_attempt_time: None,
        last_result: None,
        created_time,
        lease_expires: None,
    }
}

/// Places an order with one item and saves it at version 2.
pub async fn placed_order(h: &Harness) -> Root<Order> {
    let mut order = Root::<Order>::new(Uuid::new_v4());
    order
        .execute(OrderCommand::Place {
            customer: "ada".to_owned(),
        })
        .await
        .expect("place");
    order
        .execute(OrderCommand::AddItem {
            sku: "tea".to_owned(),
            quantity: 2,
        })
        .await
        .expect("add item");
    h.orders.save(&mut order).await.expect("save order");
    order
}
