use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use factline_core::{AggregateId, CommandId, EventId, ExpectedVersion, PartitionId};
use std::sync::Arc;

/// An event ready to be appended to a stream (no position assigned yet).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: produced by the aggregate's `handle()`
/// 2. **UncommittedEvent**: serialized payload plus identity and causation
/// 3. **StoredEvent**: persisted with stream version, partition, offset and global position
/// 4. **EventEnvelope**: typed view handed to projections
///
/// Use [`UncommittedEvent::from_typed`] to build one from a typed domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub causation_id: CommandId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A committed event in the partitioned, append-only log.
///
/// ## Positions
///
/// Every stored event carries three positions, all assigned by the store at
/// append time and never changed afterwards:
///
/// - `stream_version`: 1-based position in the aggregate's own stream
///   (drives optimistic concurrency)
/// - `offset`: 0-based, gapless position inside `partition` (drives projector
///   checkpoints)
/// - `global_position`: 0-based position over the whole log in commit order
///   (drives the coordinator's view of claim ownership)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub causation_id: CommandId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub stream_version: u64,
    pub partition: PartitionId,
    pub offset: u64,
    pub global_position: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Convert a stored event into an envelope with an untyped payload.
    pub fn to_envelope(&self) -> factline_events::EventEnvelope<JsonValue> {
        factline_events::EventEnvelope::new(
            self.event_id,
            self.causation_id,
            self.aggregate_id.clone(),
            self.aggregate_type.clone(),
            self.stream_version,
            self.partition,
            self.offset,
            self.payload.clone(),
        )
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors.
///
/// - **Concurrency**: optimistic concurrency check failed (stale expected version)
/// - **InvalidAppend**: malformed batch (mixed aggregates, duplicate event id)
/// - **UnknownPartition**: read of a partition the log does not have
/// - **Unavailable**: the backing storage could not be reached (retryable)
/// - **Publish**: wake-up publication failed after a successful append
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),

    #[error("event log unavailable: {0}")]
    Unavailable(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }
}

/// Append-only, partitioned event log.
///
/// ## Streams and partitions
///
/// Each aggregate instance owns one stream. Streams are mapped onto a fixed
/// number of partitions by the store's `Partitioner`, so all events of one
/// aggregate land in the same partition in stream order. Within a partition,
/// offsets are strictly increasing and gapless.
///
/// ## Append Semantics
///
/// `append()`:
/// - Rejects batches whose events target another aggregate than `aggregate_id`
/// - Rejects event ids already present in the log
/// - Checks optimistic concurrency against the current stream version
/// - Assigns stream versions, partition offsets and global positions
/// - Persists the batch atomically (all or nothing)
///
/// ## Read Semantics
///
/// `read()` returns the next batch of a partition strictly after an offset;
/// an empty batch means the reader is at the head. `read_all()` does the same
/// over the whole log in global order.
pub trait EventStore: Send + Sync {
    /// Number of partitions in this log.
    fn partitions(&self) -> u32;

    /// Append events to an aggregate stream (append-only, all-or-nothing).
    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream of an aggregate in version order.
    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Up to `max_batch` events of `partition` with offset strictly greater than
    /// `after` (`None` reads from offset 0).
    fn read(
        &self,
        partition: PartitionId,
        after: Option<u64>,
        max_batch: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Up to `max_batch` events with global position strictly greater than `after`.
    fn read_all(&self, after: Option<u64>, max_batch: usize) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Offset of the last event in `partition`, `None` when it is empty.
    fn head(&self, partition: PartitionId) -> Result<Option<u64>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn partitions(&self) -> u32 {
        (**self).partitions()
    }

    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(aggregate_id, expected_version, events)
    }

    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id)
    }

    fn read(
        &self,
        partition: PartitionId,
        after: Option<u64>,
        max_batch: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read(partition, after, max_batch)
    }

    fn read_all(&self, after: Option<u64>, max_batch: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read_all(after, max_batch)
    }

    fn head(&self, partition: PartitionId) -> Result<Option<u64>, EventStoreError> {
        (**self).head(partition)
    }
}

/// Check that a batch targets exactly `aggregate_id` with one aggregate type and
/// no repeated event id; returns the batch's aggregate type.
pub(crate) fn validate_batch(
    aggregate_id: &AggregateId,
    events: &[UncommittedEvent],
) -> Result<String, EventStoreError> {
    let aggregate_type = events.first().map(|e| e.aggregate_type.clone()).unwrap_or_default();
    let mut seen = std::collections::HashSet::with_capacity(events.len());
    for (idx, e) in events.iter().enumerate() {
        if &e.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains a foreign aggregate_id (index {idx})"
            )));
        }
        if e.aggregate_type != aggregate_type {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
        if !seen.insert(e.event_id) {
            return Err(EventStoreError::InvalidAppend(format!(
                "duplicate event_id {} in batch",
                e.event_id
            )));
        }
    }
    Ok(aggregate_type)
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    ///
    /// Keeps infra decoupled from business, while still capturing event metadata
    /// needed for later deserialization.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: EventId,
        causation_id: CommandId,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: factline_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            causation_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
