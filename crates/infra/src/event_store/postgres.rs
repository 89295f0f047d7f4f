//! Postgres-backed event log implementation.
//!
//! ## Position assignment
//!
//! `append()` runs in one transaction that:
//! 1. reads the current stream version and checks it against the expectation
//! 2. locks the partition's row in `log_heads`, then the `global` row
//!    (always in this order), and takes the next offsets/positions
//! 3. inserts the events and commits
//!
//! Holding the `global` row lock until commit makes global positions follow
//! commit order, so a reader of `read_all` never sees a position filled in
//! behind it. A concurrent append to the same stream that passed step 1 with
//! the same version trips the `(aggregate_id, stream_version)` unique
//! constraint and surfaces as `Concurrency`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | EventStoreError |
//! |------------|-----------------|
//! | unique violation on `(aggregate_id, stream_version)` | `Concurrency` |
//! | unique violation on `event_id` | `InvalidAppend` |
//! | other database errors | `InvalidAppend` |
//! | pool closed / timed out, IO, TLS | `Unavailable` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use factline_core::{AggregateId, CommandId, EventId, ExpectedVersion, PartitionId, Partitioner};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};
use crate::postgres::{PgContext, describe, is_unique_violation};

const EVENT_COLUMNS: &str = "event_id, causation_id, aggregate_id, aggregate_type, stream_version, \
     partition_id, partition_offset, global_position, event_type, event_version, occurred_at, payload";

/// Postgres-backed append-only partitioned log.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    ctx: PgContext,
    partitioner: Partitioner,
}

impl PostgresEventStore {
    pub fn new(ctx: PgContext, partitions: u32) -> Self {
        Self {
            ctx,
            partitioner: Partitioner::new(partitions),
        }
    }

    #[instrument(skip(self, events), fields(aggregate_id = %aggregate_id, event_count = events.len()), err)]
    pub async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let aggregate_type = validate_batch(aggregate_id, &events)?;
        let partition = self.partitioner.partition_for(aggregate_id);

        let mut tx = self
            .ctx
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(stream_version), 0) AS version, MIN(aggregate_type) AS aggregate_type
            FROM events
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;

        let current: i64 = row.try_get("version").map_err(|e| map_sqlx_error("check_stream_version", e))?;
        let existing_type: Option<String> = row
            .try_get("aggregate_type")
            .map_err(|e| map_sqlx_error("check_stream_version", e))?;
        let current = current as u64;

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {aggregate_id}: expected {expected_version:?}, found {current}"
            )));
        }
        if let Some(existing) = existing_type.filter(|t| t != &aggregate_type) {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
            )));
        }

        let n = events.len() as i64;
        let first_offset = take_range(&mut tx, &format!("p{}", partition.index()), n).await?;
        let first_global = take_range(&mut tx, "global", n).await?;

        let mut committed = Vec::with_capacity(events.len());
        for (i, e) in events.into_iter().enumerate() {
            let stored = StoredEvent {
                event_id: e.event_id,
                causation_id: e.causation_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                stream_version: current + 1 + i as u64,
                partition,
                offset: (first_offset + i as i64) as u64,
                global_position: (first_global + i as i64) as u64,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };

            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, causation_id, aggregate_id, aggregate_type, stream_version,
                    partition_id, partition_offset, global_position,
                    event_type, event_version, occurred_at, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(stored.event_id.as_uuid())
            .bind(stored.causation_id.as_uuid())
            .bind(stored.aggregate_id.as_str())
            .bind(&stored.aggregate_type)
            .bind(stored.stream_version as i64)
            .bind(stored.partition.index() as i32)
            .bind(stored.offset as i64)
            .bind(stored.global_position as i64)
            .bind(&stored.event_type)
            .bind(stored.event_version as i32)
            .bind(stored.occurred_at)
            .bind(&stored.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(&stored, e))?;

            committed.push(stored);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(committed)
    }

    pub async fn load_stream_async(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 ORDER BY stream_version ASC"
        ))
        .bind(aggregate_id.as_str())
        .fetch_all(self.ctx.pool())
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn read_async(
        &self,
        partition: PartitionId,
        after: Option<u64>,
        max_batch: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if partition.index() >= self.partitioner.partitions() {
            return Err(EventStoreError::UnknownPartition(partition));
        }
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE partition_id = $1 AND partition_offset > $2 \
             ORDER BY partition_offset ASC LIMIT $3"
        ))
        .bind(partition.index() as i32)
        .bind(after.map_or(-1, |o| o as i64))
        .bind(max_batch as i64)
        .fetch_all(self.ctx.pool())
        .await
        .map_err(|e| map_sqlx_error("read_partition", e))?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn read_all_async(&self, after: Option<u64>, max_batch: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE global_position > $1 ORDER BY global_position ASC LIMIT $2"
        ))
        .bind(after.map_or(-1, |p| p as i64))
        .bind(max_batch as i64)
        .fetch_all(self.ctx.pool())
        .await
        .map_err(|e| map_sqlx_error("read_all", e))?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn head_async(&self, partition: PartitionId) -> Result<Option<u64>, EventStoreError> {
        if partition.index() >= self.partitioner.partitions() {
            return Err(EventStoreError::UnknownPartition(partition));
        }
        let head: Option<i64> = sqlx::query_scalar("SELECT MAX(partition_offset) FROM events WHERE partition_id = $1")
            .bind(partition.index() as i32)
            .fetch_one(self.ctx.pool())
            .await
            .map_err(|e| map_sqlx_error("head", e))?;
        Ok(head.map(|h| h as u64))
    }
}

impl EventStore for PostgresEventStore {
    fn partitions(&self) -> u32 {
        self.partitioner.partitions()
    }

    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.ctx.block_on(self.append_events(aggregate_id, expected_version, events))
    }

    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.ctx.block_on(self.load_stream_async(aggregate_id))
    }

    fn read(
        &self,
        partition: PartitionId,
        after: Option<u64>,
        max_batch: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.ctx.block_on(self.read_async(partition, after, max_batch))
    }

    fn read_all(&self, after: Option<u64>, max_batch: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.ctx.block_on(self.read_all_async(after, max_batch))
    }

    fn head(&self, partition: PartitionId) -> Result<Option<u64>, EventStoreError> {
        self.ctx.block_on(self.head_async(partition))
    }
}

/// Lock the `scope` row of `log_heads` and reserve `n` consecutive values.
async fn take_range(tx: &mut Transaction<'_, Postgres>, scope: &str, n: i64) -> Result<i64, EventStoreError> {
    sqlx::query("INSERT INTO log_heads (scope, next_value) VALUES ($1, 0) ON CONFLICT (scope) DO NOTHING")
        .bind(scope)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("init_log_head", e))?;

    let first: i64 = sqlx::query_scalar("SELECT next_value FROM log_heads WHERE scope = $1 FOR UPDATE")
        .bind(scope)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_log_head", e))?;

    sqlx::query("UPDATE log_heads SET next_value = next_value + $2 WHERE scope = $1")
        .bind(scope)
        .bind(n)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("advance_log_head", e))?;

    Ok(first)
}

fn row_to_event(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let corrupt = |e: sqlx::Error| EventStoreError::InvalidAppend(format!("failed to deserialize event row: {e}"));

    let aggregate_id: String = row.try_get("aggregate_id").map_err(corrupt)?;
    let stream_version: i64 = row.try_get("stream_version").map_err(corrupt)?;
    let partition_id: i32 = row.try_get("partition_id").map_err(corrupt)?;
    let offset: i64 = row.try_get("partition_offset").map_err(corrupt)?;
    let global_position: i64 = row.try_get("global_position").map_err(corrupt)?;
    let event_version: i32 = row.try_get("event_version").map_err(corrupt)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(corrupt)?;
    let event_id: Uuid = row.try_get("event_id").map_err(corrupt)?;
    let causation_id: Uuid = row.try_get("causation_id").map_err(corrupt)?;

    Ok(StoredEvent {
        event_id: EventId::from_uuid(event_id),
        causation_id: CommandId::from_uuid(causation_id),
        aggregate_id: AggregateId::new(aggregate_id)
            .map_err(|e| EventStoreError::InvalidAppend(format!("stored aggregate_id is invalid: {e}")))?,
        aggregate_type: row.try_get("aggregate_type").map_err(corrupt)?,
        stream_version: stream_version as u64,
        partition: PartitionId::new(partition_id as u32),
        offset: offset as u64,
        global_position: global_position as u64,
        event_type: row.try_get("event_type").map_err(corrupt)?,
        event_version: event_version as u32,
        occurred_at,
        payload: row.try_get("payload").map_err(corrupt)?,
    })
}

fn map_insert_error(stored: &StoredEvent, err: sqlx::Error) -> EventStoreError {
    if is_unique_violation(&err) {
        let on_event_id = matches!(
            &err,
            sqlx::Error::Database(db) if db.constraint() == Some("events_event_id_key")
        );
        if on_event_id {
            return EventStoreError::InvalidAppend(format!("event_id {} already in the log", stored.event_id));
        }
        return EventStoreError::Concurrency(format!(
            "concurrent append detected: {} version {} already exists",
            stored.aggregate_id, stored.stream_version
        ));
    }
    map_sqlx_error("insert_event", err)
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(_) if is_unique_violation(&err) => EventStoreError::Concurrency(describe(operation, &err)),
        sqlx::Error::Database(_) | sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. } => {
            EventStoreError::InvalidAppend(describe(operation, &err))
        }
        _ => EventStoreError::Unavailable(describe(operation, &err)),
    }
}
