//! A `sqlx` implementation of the `eventide` store traits.
//!
//! This module provides `sqlx`-based implementations of the `EventStore`,
//! `SnapshotStore` and `ScheduledCommandStore` traits, designed for
//! PostgreSQL. Compile it with the `postgres-storage` cargo feature.
#![allow(clippy::missing_errors_doc)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction, types::Json};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    AppendOutcome, Error, EventRecord, EventStore, ReadRange, Result,
    schedule::{Completion, EventReference, ScheduledCommand, ScheduledCommandStore},
    snapshot::{SnapshotFilter, SnapshotRecord, SnapshotStore},
};

use super::{batch_stream, check_contiguous, conflict};

const UNIQUE_VIOLATION: &str = "23505";
const ETAG_INDEX: &str = "events_etag_idx";

/// Maps `sqlx::Error` into this crate's `Error`.
fn to_store_error(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

/// Starts a transaction at READ COMMITTED. Appends rely on the primary key
/// and the etag index rather than on serializable isolation.
async fn begin_read_committed(pool: &PgPool) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await.map_err(to_store_error)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
        .execute(&mut *tx)
        .await
        .map_err(to_store_error)?;
    Ok(tx)
}

#[derive(sqlx::FromRow)]
struct EventRow {
    stream_name: String,
    aggregate_id: String,
    sequence_number: i64,
    event_type: String,
    event_version: i16,
    body: serde_json::Value,
    etag: Option<String>,
    timestamp: DateTime<Utc>,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            stream_name: row.stream_name,
            aggregate_id: row.aggregate_id,
            sequence_number: row.sequence_number,
            event_type: row.event_type,
            event_version: u16::try_from(row.event_version).unwrap_or_default(),
            body: row.body,
            etag: row.etag,
            timestamp: row.timestamp,
        }
    }
}

const EVENT_COLUMNS: &str = "stream_name, aggregate_id, sequence_number, event_type, event_version, body, etag, timestamp";

/// A `sqlx`-backed event store for PostgreSQL.
#[derive(Debug, Clone)]
pub struct SqlxEventStore {
    pool: PgPool,
}

impl SqlxEventStore {
    /// Creates a new `SqlxEventStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensures the `events` table and its etag index exist.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS events (
                    stream_name TEXT NOT NULL,
                    aggregate_id TEXT NOT NULL,
                    sequence_number BIGINT NOT NULL,
                    event_type TEXT NOT NULL,
                    event_version SMALLINT NOT NULL,
                    body JSONB NOT NULL,
                    etag TEXT,
                    timestamp TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (stream_name, aggregate_id, sequence_number)
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
                CREATE UNIQUE INDEX IF NOT EXISTS events_etag_idx
                ON events (stream_name, aggregate_id, etag)
                WHERE etag IS NOT NULL;
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn existing(&self, records: &[EventRecord]) -> Result<Vec<EventRecord>> {
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };
        let sequence_numbers: Vec<i64> = records.iter().map(|r| r.sequence_number).collect();
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE stream_name = $1 AND aggregate_id = $2 AND sequence_number = ANY($3) ORDER BY sequence_number"
        ))
        .bind(&first.stream_name)
        .bind(&first.aggregate_id)
        .bind(&sequence_numbers)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }
}

#[async_trait]
impl EventStore for SqlxEventStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn append(&self, records: Vec<EventRecord>) -> Result<AppendOutcome> {
        let Some((stream_name, aggregate_id)) = batch_stream(&records)? else {
            return Ok(AppendOutcome::Appended(0));
        };
        let (stream_name, aggregate_id) = (stream_name.to_owned(), aggregate_id.to_owned());

        let etags: Vec<String> = records.iter().filter_map(|r| r.etag.clone()).collect();
        let mut tx = begin_read_committed(&self.pool).await?;

        if !etags.is_empty() {
            let duplicate: Option<String> = sqlx::query_scalar(
                "SELECT etag FROM events WHERE stream_name = $1 AND aggregate_id = $2 AND etag = ANY($3) LIMIT 1",
            )
            .bind(&stream_name)
            .bind(&aggregate_id)
            .bind(&etags)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_store_error)?;
            if let Some(etag) = duplicate {
                debug!(%etag, "duplicate etag, nothing appended");
                return Ok(AppendOutcome::Duplicate { etag });
            }
        }

        let last: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM events WHERE stream_name = $1 AND aggregate_id = $2",
        )
        .bind(&stream_name)
        .bind(&aggregate_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(to_store_error)?;
        let last = last.unwrap_or(0);
        if records.first().is_some_and(|r| r.sequence_number <= last) {
            drop(tx);
            let existing = self.existing(&records).await?;
            return Err(conflict(records, existing));
        }
        check_contiguous(&records, last)?;

        let sequence_numbers: Vec<i64> = records.iter().map(|r| r.sequence_number).collect();
        let event_types: Vec<String> = records.iter().map(|r| r.event_type.clone()).collect();
        let event_versions: Vec<i16> = records
            .iter()
            .map(|r| i16::try_from(r.event_version).unwrap_or(i16::MAX))
            .collect();
        let bodies: Vec<serde_json::Value> = records.iter().map(|r| r.body.clone()).collect();
        let record_etags: Vec<Option<String>> = records.iter().map(|r| r.etag.clone()).collect();
        let timestamps: Vec<DateTime<Utc>> = records.iter().map(|r| r.timestamp).collect();

        // Bulk insert.
        let inserted = sqlx::query(
            r#"
            INSERT INTO events (stream_name, aggregate_id, sequence_number, event_type, event_version, body, etag, timestamp)
            SELECT $1, $2, s, t, v, b, e, ts
            FROM UNNEST($3::BIGINT[], $4::TEXT[], $5::SMALLINT[], $6::JSONB[], $7::TEXT[], $8::TIMESTAMPTZ[])
                AS x(s, t, v, b, e, ts)
            "#,
        )
        .bind(&stream_name)
        .bind(&aggregate_id)
        .bind(&sequence_numbers)
        .bind(&event_types)
        .bind(&event_versions)
        .bind(&bodies)
        .bind(&record_etags)
        .bind(&timestamps)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(to_store_error)?;
                Ok(AppendOutcome::Appended(records.len()))
            }
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                // A concurrent writer committed between the checks and the
                // insert.
                drop(tx);
                if db.constraint() == Some(ETAG_INDEX) {
                    let etag = etags.into_iter().next().unwrap_or_default();
                    return Ok(AppendOutcome::Duplicate { etag });
                }
                let existing = self.existing(&records).await?;
                Err(conflict(records, existing))
            }
            Err(e) => Err(to_store_error(e)),
        }
    }

    #[instrument(skip(self))]
    async fn read(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        range: ReadRange,
    ) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events
            WHERE stream_name = $1 AND aggregate_id = $2 AND sequence_number > $3
                AND ($4::BIGINT IS NULL OR sequence_number <= $4)
                AND ($5::TIMESTAMPTZ IS NULL OR timestamp <= $5)
            ORDER BY sequence_number
            "#
        ))
        .bind(stream_name)
        .bind(aggregate_id)
        .bind(range.after)
        .bind(range.up_to)
        .bind(range.as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    #[instrument(skip(self))]
    async fn find_by_etag(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        etag: &str,
    ) -> Result<Option<EventRecord>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE stream_name = $1 AND aggregate_id = $2 AND etag = $3"
        ))
        .bind(stream_name)
        .bind(aggregate_id)
        .bind(etag)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(row.map(EventRecord::from))
    }
}

/// A `sqlx`-backed snapshot store for PostgreSQL.
#[derive(Debug, Clone)]
pub struct SqlxSnapshotStore {
    pool: PgPool,
}

impl SqlxSnapshotStore {
    /// Creates a new `SqlxSnapshotStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensures the `snapshots` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS snapshots (
                    stream_name TEXT NOT NULL,
                    aggregate_id TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    timestamp TIMESTAMPTZ NOT NULL,
                    body JSONB NOT NULL,
                    PRIMARY KEY (stream_name, aggregate_id, version)
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqlxSnapshotStore {
    #[instrument(skip(self, snapshot), fields(stream = %snapshot.stream_name, aggregate_id = %snapshot.aggregate_id, version = snapshot.version))]
    async fn save(&self, snapshot: SnapshotRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (stream_name, aggregate_id, version, timestamp, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stream_name, aggregate_id, version) DO UPDATE
            SET timestamp = EXCLUDED.timestamp,
                body = EXCLUDED.body;
            "#,
        )
        .bind(&snapshot.stream_name)
        .bind(&snapshot.aggregate_id)
        .bind(snapshot.version)
        .bind(snapshot.timestamp)
        .bind(&snapshot.body)
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(
        &self,
        stream_name: &str,
        aggregate_id: &str,
        filter: SnapshotFilter,
    ) -> Result<Option<SnapshotRecord>> {
        let row: Option<(i64, DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT version, timestamp, body FROM snapshots
            WHERE stream_name = $1 AND aggregate_id = $2
                AND ($3::BIGINT IS NULL OR version <= $3)
                AND ($4::TIMESTAMPTZ IS NULL OR timestamp <= $4)
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(stream_name)
        .bind(aggregate_id)
        .bind(filter.max_version)
        .bind(filter.as_of)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_store_error)?;

        Ok(row.map(|(version, timestamp, body)| SnapshotRecord {
            stream_name: stream_name.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            version,
            timestamp,
            body,
        }))
    }
}

#[derive(sqlx::FromRow)]
struct ScheduledCommandRow {
    id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    command_type: String,
    serialized_command: serde_json::Value,
    etag: String,
    due_time: Option<DateTime<Utc>>,
    depends_on: Option<Json<EventReference>>,
    attempts: i32,
    applied_time: Option<DateTime<Utc>>,
    final_attempt_time: Option<DateTime<Utc>>,
    last_result: Option<String>,
    created_time: DateTime<Utc>,
    lease_expires: Option<DateTime<Utc>>,
}

impl From<ScheduledCommandRow> for ScheduledCommand {
    fn from(row: ScheduledCommandRow) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            command_type: row.command_type,
            serialized_command: row.serialized_command,
            etag: row.etag,
            due_time: row.due_time,
            depends_on: row.depends_on.map(|Json(reference)| reference),
            attempts: row.attempts,
            applied_time: row.applied_time,
            final_attempt_time: row.final_attempt_time,
            last_result: row.last_result,
            created_time: row.created_time,
            lease_expires: row.lease_expires,
        }
    }
}

const SCHEDULED_COLUMNS: &str = "id, aggregate_id, aggregate_type, command_type, serialized_command, etag, due_time, depends_on, attempts, applied_time, final_attempt_time, last_result, created_time, lease_expires";

/// A `sqlx`-backed scheduled command store for PostgreSQL.
///
/// Claims are conditional updates, so any number of engines can share the
/// table.
#[derive(Debug, Clone)]
pub struct SqlxScheduledCommandStore {
    pool: PgPool,
}

impl SqlxScheduledCommandStore {
    /// Creates a new `SqlxScheduledCommandStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensures the `scheduled_commands` table and its due index exist.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS scheduled_commands (
                    id UUID PRIMARY KEY,
                    aggregate_id TEXT NOT NULL,
                    aggregate_type TEXT NOT NULL,
                    command_type TEXT NOT NULL,
                    serialized_command JSONB NOT NULL,
                    etag TEXT NOT NULL,
                    due_time TIMESTAMPTZ,
                    depends_on JSONB,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    applied_time TIMESTAMPTZ,
                    final_attempt_time TIMESTAMPTZ,
                    last_result TEXT,
                    created_time TIMESTAMPTZ NOT NULL,
                    lease_expires TIMESTAMPTZ
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
                CREATE INDEX IF NOT EXISTS scheduled_commands_due_idx
                ON scheduled_commands (due_time NULLS FIRST, created_time)
                WHERE applied_time IS NULL AND final_attempt_time IS NULL;
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduledCommandStore for SqlxScheduledCommandStore {
    #[instrument(skip(self, command), fields(id = %command.id, aggregate_type = %command.aggregate_type))]
    async fn insert(&self, command: ScheduledCommand) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO scheduled_commands ({SCHEDULED_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#
        ))
        .bind(command.id)
        .bind(&command.aggregate_id)
        .bind(&command.aggregate_type)
        .bind(&command.command_type)
        .bind(&command.serialized_command)
        .bind(&command.etag)
        .bind(command.due_time)
        .bind(command.depends_on.as_ref().map(Json))
        .bind(command.attempts)
        .bind(command.applied_time)
        .bind(command.final_attempt_time)
        .bind(&command.last_result)
        .bind(command.created_time)
        .bind(command.lease_expires)
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledCommand>> {
        let row: Option<ScheduledCommandRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULED_COLUMNS} FROM scheduled_commands WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(row.map(ScheduledCommand::from))
    }

    #[instrument(skip(self))]
    async fn find_due(&self, as_of: DateTime<Utc>) -> Result<Vec<ScheduledCommand>> {
        let rows: Vec<ScheduledCommandRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SCHEDULED_COLUMNS} FROM scheduled_commands
            WHERE (due_time IS NULL OR due_time <= $1)
                AND applied_time IS NULL
                AND final_attempt_time IS NULL
                AND (lease_expires IS NULL OR lease_expires <= $1)
            ORDER BY due_time ASC NULLS FIRST, created_time ASC
            "#
        ))
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(rows.into_iter().map(ScheduledCommand::from).collect())
    }

    async fn next_due_after(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            r#"
            SELECT MIN(due_time) FROM scheduled_commands
            WHERE applied_time IS NULL AND final_attempt_time IS NULL
                AND due_time > $1 AND due_time <= $2
            "#,
        )
        .bind(after)
        .bind(until)
        .fetch_one(&self.pool)
        .await
        .map_err(to_store_error)
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        id: Uuid,
        expected_attempts: i32,
        lease_expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_commands
            SET attempts = attempts + 1, lease_expires = $3
            WHERE id = $1 AND attempts = $2
                AND applied_time IS NULL AND final_attempt_time IS NULL
                AND (lease_expires IS NULL OR lease_expires <= $4)
            "#,
        )
        .bind(id)
        .bind(expected_attempts)
        .bind(lease_expires)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn complete(&self, id: Uuid, completion: Completion) -> Result<()> {
        let query = match &completion {
            Completion::Applied { at } => sqlx::query(
                "UPDATE scheduled_commands SET applied_time = $2, last_result = 'applied', lease_expires = NULL WHERE id = $1",
            )
            .bind(id)
            .bind(*at),
            Completion::Retry { due_time, result } => sqlx::query(
                "UPDATE scheduled_commands SET due_time = $2, last_result = $3, lease_expires = NULL WHERE id = $1",
            )
            .bind(id)
            .bind(*due_time)
            .bind(result.clone()),
            Completion::Abandoned { at, result } => sqlx::query(
                "UPDATE scheduled_commands SET final_attempt_time = $2, last_result = $3, lease_expires = NULL WHERE id = $1",
            )
            .bind(id)
            .bind(*at)
            .bind(result.clone()),
        };
        let result = query.execute(&self.pool).await.map_err(to_store_error)?;
        if result.rows_affected() == 0 {
            return Err(Error::Store(format!(
                "scheduled command {id} does not exist"
            )));
        }
        Ok(())
    }
}
