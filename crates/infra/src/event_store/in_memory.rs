use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use factline_core::{AggregateId, EventId, ExpectedVersion, PartitionId, Partitioner};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

#[derive(Debug, Default)]
struct Log {
    /// Every event, indexed by global position.
    all: Vec<StoredEvent>,
    /// Global positions per partition, indexed by offset.
    partitions: Vec<Vec<usize>>,
    /// Global positions per aggregate stream, in version order.
    streams: HashMap<AggregateId, Vec<usize>>,
    event_ids: HashSet<EventId>,
}

/// In-memory append-only partitioned event log.
///
/// Intended for tests/dev and single-process deployments. A single write lock
/// serializes appends, so global positions follow commit order.
#[derive(Debug)]
pub struct InMemoryEventStore {
    partitioner: Partitioner,
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new(partitions: u32) -> Self {
        let partitioner = Partitioner::new(partitions);
        let log = Log {
            partitions: vec![Vec::new(); partitioner.partitions() as usize],
            ..Log::default()
        };
        Self {
            partitioner,
            log: RwLock::new(log),
        }
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    /// Total number of events in the log.
    pub fn len(&self) -> usize {
        self.log.read().map(|l| l.all.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::Unavailable("lock poisoned".to_string())
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl EventStore for InMemoryEventStore {
    fn partitions(&self) -> u32 {
        self.partitioner.partitions()
    }

    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let aggregate_type = validate_batch(aggregate_id, &events)?;

        let mut log = self.log.write().map_err(|_| Self::poisoned())?;

        if let Some(dup) = events.iter().find(|e| log.event_ids.contains(&e.event_id)) {
            return Err(EventStoreError::InvalidAppend(format!(
                "event_id {} already in the log",
                dup.event_id
            )));
        }

        let current = log.streams.get(aggregate_id).map_or(0, |s| s.len() as u64);
        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {aggregate_id}: expected {expected_version:?}, found {current}"
            )));
        }

        // Enforce aggregate type stability across the stream.
        if let Some(&first) = log.streams.get(aggregate_id).and_then(|s| s.first()) {
            let existing = &log.all[first].aggregate_type;
            if existing != &aggregate_type {
                return Err(EventStoreError::InvalidAppend(format!(
                    "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        let partition = self.partitioner.partition_for(aggregate_id);
        let mut committed = Vec::with_capacity(events.len());
        for (i, e) in events.into_iter().enumerate() {
            let global_position = log.all.len();
            let offset = log.partitions[partition.index() as usize].len() as u64;
            let stored = StoredEvent {
                event_id: e.event_id,
                causation_id: e.causation_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                stream_version: current + 1 + i as u64,
                partition,
                offset,
                global_position: global_position as u64,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            log.event_ids.insert(stored.event_id);
            log.partitions[partition.index() as usize].push(global_position);
            log.streams.entry(aggregate_id.clone()).or_default().push(global_position);
            log.all.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;
        Ok(log
            .streams
            .get(aggregate_id)
            .map(|positions| positions.iter().map(|&p| log.all[p].clone()).collect())
            .unwrap_or_default())
    }

    fn read(
        &self,
        partition: PartitionId,
        after: Option<u64>,
        max_batch: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;
        let positions = log
            .partitions
            .get(partition.index() as usize)
            .ok_or(EventStoreError::UnknownPartition(partition))?;
        let start = after.map_or(0, |o| o as usize + 1);
        Ok(positions
            .iter()
            .skip(start)
            .take(max_batch)
            .map(|&p| log.all[p].clone())
            .collect())
    }

    fn read_all(&self, after: Option<u64>, max_batch: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;
        let start = after.map_or(0, |p| p as usize + 1);
        Ok(log.all.iter().skip(start).take(max_batch).cloned().collect())
    }

    fn head(&self, partition: PartitionId) -> Result<Option<u64>, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;
        let positions = log
            .partitions
            .get(partition.index() as usize)
            .ok_or(EventStoreError::UnknownPartition(partition))?;
        Ok(positions.len().checked_sub(1).map(|o| o as u64))
    }
}
