//! An in-memory scheduled command store.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    Error, Result,
    schedule::{Completion, ScheduledCommand, ScheduledCommandStore, due_order},
};

/// An in-memory, thread-safe scheduled command store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryScheduledCommandStore {
    commands: Arc<DashMap<Uuid, ScheduledCommand>>,
}

impl InMemoryScheduledCommandStore {
    /// Returns every scheduled command, in due order.
    pub fn all(&self) -> Vec<ScheduledCommand> {
        let mut all: Vec<_> = self.commands.iter().map(|c| c.value().clone()).collect();
        all.sort_by(due_order);
        all
    }
}

#[async_trait]
impl ScheduledCommandStore for InMemoryScheduledCommandStore {
    #[instrument(skip(self, command), fields(id = %command.id, aggregate_type = %command.aggregate_type))]
    async fn insert(&self, command: ScheduledCommand) -> Result<()> {
        self.commands.entry(command.id).or_insert(command);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledCommand>> {
        Ok(self.commands.get(&id).map(|c| c.value().clone()))
    }

    #[instrument(skip(self))]
    async fn find_due(&self, as_of: DateTime<Utc>) -> Result<Vec<ScheduledCommand>> {
        let mut due: Vec<_> = self
            .commands
            .iter()
            .filter(|c| c.is_due(as_of))
            .map(|c| c.value().clone())
            .collect();
        due.sort_by(due_order);
        Ok(due)
    }

    async fn next_due_after(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .commands
            .iter()
            .filter(|c| c.applied_time.is_none() && c.final_attempt_time.is_none())
            .filter_map(|c| c.due_time)
            .filter(|t| *t > after && *t <= until)
            .min())
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        id: Uuid,
        expected_attempts: i32,
        lease_expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut command) = self.commands.get_mut(&id) else {
            return Ok(false);
        };
        if !command.is_claimable(expected_attempts, now) {
            return Ok(false);
        }
        command.attempts += 1;
        command.lease_expires = Some(lease_expires);
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn complete(&self, id: Uuid, completion: Completion) -> Result<()> {
        let mut command = self
            .commands
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("scheduled command {id} does not exist")))?;
        command.complete(&completion);
        Ok(())
    }
}
