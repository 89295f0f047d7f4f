use serde::{Deserialize, Serialize};

use factline_core::{AggregateId, CommandId, EventId, PartitionId};

/// Envelope for a committed event, carrying stream and partition metadata.
///
/// Notes:
/// - `stream_version` is the 1-based position in the aggregate's own stream.
/// - `offset` is the 0-based, gapless position inside `partition`; projector
///   checkpoints are expressed in offsets.
/// - `causation_id` is the command that produced the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    causation_id: CommandId,

    aggregate_id: AggregateId,
    aggregate_type: String,
    stream_version: u64,

    partition: PartitionId,
    offset: u64,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: EventId,
        causation_id: CommandId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        stream_version: u64,
        partition: PartitionId,
        offset: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            causation_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            stream_version,
            partition,
            offset,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn causation_id(&self) -> CommandId {
        self.causation_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn stream_version(&self) -> u64 {
        self.stream_version
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Swap the payload, keeping every piece of metadata.
    pub fn try_map<F, T, Err>(self, f: F) -> Result<EventEnvelope<T>, Err>
    where
        F: FnOnce(E) -> Result<T, Err>,
    {
        Ok(EventEnvelope {
            event_id: self.event_id,
            causation_id: self.causation_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            stream_version: self.stream_version,
            partition: self.partition,
            offset: self.offset,
            payload: f(self.payload)?,
        })
    }
}
