use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{IVec, Tree};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    Error, Result,
    schedule::{Completion, ScheduledCommand, ScheduledCommandStore, due_order},
};

use super::sled::to_store_error;

/// A persistent scheduled command store using `sled`.
///
/// Rows are keyed by ID. Claims and completions are compare-and-swap
/// updates, so engines sharing the database never both claim a row.
#[derive(Debug, Clone)]
pub struct SledScheduledCommandStore {
    tree: Tree,
}

impl SledScheduledCommandStore {
    /// Creates a new `SledScheduledCommandStore` over a dedicated tree.
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    fn decode(value: &[u8]) -> Result<ScheduledCommand> {
        serde_json::from_slice(value).map_err(to_store_error)
    }

    fn all(&self) -> Result<Vec<ScheduledCommand>> {
        self.tree
            .iter()
            .values()
            .map(|value| Self::decode(&value.map_err(to_store_error)?))
            .collect()
    }

    /// Applies `update` to a row with compare-and-swap, retrying when
    /// another writer got there first. `update` returning `false` leaves the
    /// row untouched.
    fn update<F>(&self, id: Uuid, mut update: F) -> Result<Option<bool>>
    where
        F: FnMut(&mut ScheduledCommand) -> bool,
    {
        loop {
            let Some(old) = self.tree.get(id.as_bytes()).map_err(to_store_error)? else {
                return Ok(None);
            };
            let mut command = Self::decode(&old)?;
            if !update(&mut command) {
                return Ok(Some(false));
            }
            let new = IVec::from(serde_json::to_vec(&command).map_err(to_store_error)?);
            match self
                .tree
                .compare_and_swap(id.as_bytes(), Some(old), Some(new))
                .map_err(to_store_error)?
            {
                Ok(()) => return Ok(Some(true)),
                Err(_) => continue,
            }
        }
    }
}

#[async_trait]
impl ScheduledCommandStore for SledScheduledCommandStore {
    #[instrument(skip(self, command), fields(id = %command.id, aggregate_type = %command.aggregate_type))]
    async fn insert(&self, command: ScheduledCommand) -> Result<()> {
        let value = serde_json::to_vec(&command).map_err(to_store_error)?;
        // An existing row wins.
        let _ = self
            .tree
            .compare_and_swap(command.id.as_bytes(), None as Option<&[u8]>, Some(value))
            .map_err(to_store_error)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledCommand>> {
        self.tree
            .get(id.as_bytes())
            .map_err(to_store_error)?
            .map(|value| Self::decode(&value))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn find_due(&self, as_of: DateTime<Utc>) -> Result<Vec<ScheduledCommand>> {
        let mut due: Vec<_> = self
            .all()?
            .into_iter()
            .filter(|c| c.is_due(as_of))
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
            .all()?
            .into_iter()
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
        let claimed = self.update(id, |command| {
            if !command.is_claimable(expected_attempts, now) {
                return false;
            }
            command.attempts += 1;
            command.lease_expires = Some(lease_expires);
            true
        })?;
        Ok(claimed.unwrap_or(false))
    }

    #[instrument(skip(self))]
    async fn complete(&self, id: Uuid, completion: Completion) -> Result<()> {
        match self.update(id, |command| {
            command.complete(&completion);
            true
        })? {
            Some(_) => Ok(()),
            None => Err(Error::Store(format!(
                "scheduled command {id} does not exist"
            ))),
        }
    }
}
