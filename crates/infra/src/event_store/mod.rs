//! Append-only, partitioned event log boundary.
//!
//! This module defines an infrastructure-facing abstraction for appending
//! aggregate streams and reading partitions without making any storage
//! assumptions.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod reader;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;
pub use reader::PartitionReader;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

use factline_core::{AggregateId, ExpectedVersion, PartitionId};
use factline_events::{EventBus, EventEnvelope};
use serde_json::Value as JsonValue;
use tracing::warn;

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// Publication happens only after the append committed. It only wakes waiting
/// projectors; a failed publish is logged and never turns a committed append
/// into an error, since a caller retrying on that error would append twice.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn partitions(&self) -> u32 {
        self.store.partitions()
    }

    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        // 1) Append (durable step)
        let committed = self.store.append(aggregate_id, expected_version, events)?;

        // 2) Wake subscribers (best-effort)
        for e in &committed {
            if let Err(err) = self.bus.publish(e.to_envelope()) {
                warn!(
                    partition = %e.partition,
                    offset = e.offset,
                    error = %err,
                    "failed to publish committed event; projectors will pick it up on their next poll"
                );
            }
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(aggregate_id)
    }

    fn read(
        &self,
        partition: PartitionId,
        after: Option<u64>,
        max_batch: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.read(partition, after, max_batch)
    }

    fn read_all(&self, after: Option<u64>, max_batch: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.read_all(after, max_batch)
    }

    fn head(&self, partition: PartitionId) -> Result<Option<u64>, EventStoreError> {
        self.store.head(partition)
    }
}
