//! Publishing committed events.
//!
//! The repository hands saved records to a [`Publisher`], which forwards
//! them to an [`EventBus`] from a background task. Saving never waits on the
//! bus: delivery is best effort and failures are only logged. The event
//! store stays the source of truth, and consumers must tolerate duplicates.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{EventRecord, Result};

/// An at-least-once publish/subscribe transport for committed events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a batch of records.
    async fn publish(&self, events: &[EventRecord]) -> Result<()>;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, events: &[EventRecord]) -> Result<()> {
        (**self).publish(events).await
    }
}

/// In-process broadcast bus. Every subscriber receives every record.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<EventRecord>,
}

impl InMemoryEventBus {
    /// Creates a bus buffering up to `capacity` records per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to records published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, events: &[EventRecord]) -> Result<()> {
        for event in events {
            // Publishing with no subscribers is not an error.
            if self.sender.send(event.clone()).is_err() {
                debug!(event_type = %event.event_type, "no subscribers for published event");
            }
        }
        Ok(())
    }
}

/// Hands batches of records to an [`EventBus`] without blocking the caller.
#[derive(Debug, Clone)]
pub struct Publisher {
    sender: mpsc::Sender<Vec<EventRecord>>,
}

impl Publisher {
    /// Spawns the forwarding task on the current Tokio runtime. At most
    /// `capacity` batches are buffered; the task ends once every `Publisher`
    /// clone is dropped.
    pub fn spawn(bus: Arc<dyn EventBus>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Vec<EventRecord>>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                if let Err(e) = bus.publish(&batch).await {
                    warn!(error = %e, count = batch.len(), "failed to publish events");
                }
            }
        });
        (Self { sender }, handle)
    }

    /// Queues a batch for publishing. Never blocks; a full buffer or a
    /// stopped task drops the batch with a warning.
    pub fn publish(&self, events: Vec<EventRecord>) {
        if events.is_empty() {
            return;
        }
        match self.sender.try_send(events) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                warn!(count = batch.len(), "publish buffer full, dropping events");
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                warn!(count = batch.len(), "publisher stopped, dropping events");
            }
        }
    }
}
