//! Time sources.
//!
//! Every due-time comparison in the repository and scheduler reads from an
//! injected [`Clock`]. Production code uses [`SystemClock`]; tests use a
//! [`VirtualClock`] and move time forward explicitly, which synchronously
//! runs every scheduled command falling due in the advanced interval.
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::{Error, Result};

/// Abstraction over the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reacts to a [`VirtualClock`] being advanced.
#[async_trait]
pub trait ClockListener: Send + Sync {
    /// Returns the earliest instant in `(after, until]` at which the listener
    /// has work due.
    async fn next_due_after(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;

    /// Called after the clock has moved to `now`.
    async fn on_clock_advanced(&self, now: DateTime<Utc>);
}

#[derive(Debug)]
struct VirtualState {
    now: DateTime<Utc>,
    running: bool,
}

/// A clock whose time only moves when told to.
///
/// Advancing steps through the due times reported by subscribed
/// [`ClockListener`]s in order, so each scheduled command is delivered with
/// the clock reading exactly its due time.
pub struct VirtualClock {
    state: RwLock<VirtualState>,
    listeners: Mutex<Vec<Weak<dyn ClockListener>>>,
    advancing: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("state", &*self.state.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl VirtualClock {
    /// Starts a virtual clock reading `at`.
    pub fn start(at: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(VirtualState {
                now: at,
                running: true,
            }),
            listeners: Mutex::new(Vec::new()),
            advancing: tokio::sync::Mutex::new(()),
        })
    }

    /// Stops the clock. Time stays frozen and listeners are dropped; any
    /// further advance fails.
    pub fn stop(&self) {
        self.state.write().running = false;
        self.listeners.lock().clear();
    }

    /// Returns whether the clock can still be advanced.
    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    /// Registers a listener. The clock holds it weakly, so dropping the
    /// listener unsubscribes it.
    pub fn subscribe(&self, listener: Arc<dyn ClockListener>) {
        self.listeners.lock().push(Arc::downgrade(&listener));
    }

    /// Moves the clock forward by `by`.
    pub async fn advance_by(&self, by: TimeDelta) -> Result<DateTime<Utc>> {
        if by < TimeDelta::zero() {
            return Err(Error::Clock(format!("cannot advance by negative {by}")));
        }
        let target = self.now() + by;
        self.advance_to(target).await
    }

    /// Moves the clock forward to `target`, delivering everything that falls
    /// due on the way.
    #[instrument(skip(self))]
    pub async fn advance_to(&self, target: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let _guard = self.advancing.lock().await;
        if !self.is_running() {
            return Err(Error::Clock("virtual clock is stopped".to_owned()));
        }
        let start = self.now();
        if target < start {
            return Err(Error::Clock(format!(
                "cannot move virtual clock back from {start} to {target}"
            )));
        }

        loop {
            let listeners = self.live_listeners();
            let now = self.now();
            let mut next: Option<DateTime<Utc>> = None;
            for listener in &listeners {
                if let Some(due) = listener.next_due_after(now, target).await {
                    next = Some(next.map_or(due, |n| n.min(due)));
                }
            }
            let Some(step) = next.filter(|t| *t > now && *t <= target) else {
                break;
            };
            self.set(step);
            debug!(now = %step, "virtual clock stepped to due time");
            for listener in &listeners {
                listener.on_clock_advanced(step).await;
            }
        }

        self.set(target);
        for listener in self.live_listeners() {
            listener.on_clock_advanced(target).await;
        }
        Ok(target)
    }

    fn set(&self, now: DateTime<Utc>) {
        self.state.write().now = now;
    }

    fn live_listeners(&self) -> Vec<Arc<dyn ClockListener>> {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.read().now
    }
}
