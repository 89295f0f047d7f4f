//! Lazy batch iteration over one partition of the log.

use factline_core::PartitionId;

use super::r#trait::{EventStore, EventStoreError, StoredEvent};

/// Iterator over successive `read` batches of a partition.
///
/// Each `next()` performs one read strictly after the last offset yielded so
/// far. Iteration ends at the head (an empty batch) or after the first error;
/// a reader can be restarted from [`PartitionReader::position`] at any time.
#[derive(Debug)]
pub struct PartitionReader<'a, S: ?Sized> {
    store: &'a S,
    partition: PartitionId,
    after: Option<u64>,
    max_batch: usize,
    done: bool,
}

impl<'a, S> PartitionReader<'a, S>
where
    S: EventStore + ?Sized,
{
    pub fn new(store: &'a S, partition: PartitionId, after: Option<u64>, max_batch: usize) -> Self {
        Self {
            store,
            partition,
            after,
            max_batch: max_batch.max(1),
            done: false,
        }
    }

    /// Last offset yielded (or the starting point if nothing was read yet).
    pub fn position(&self) -> Option<u64> {
        self.after
    }
}

impl<S> Iterator for PartitionReader<'_, S>
where
    S: EventStore + ?Sized,
{
    type Item = Result<Vec<StoredEvent>, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.store.read(self.partition, self.after, self.max_batch) {
            Ok(batch) if batch.is_empty() => {
                self.done = true;
                None
            }
            Ok(batch) => {
                self.after = batch.last().map(|e| e.offset);
                Some(Ok(batch))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use factline_core::{AggregateId, CommandId, EventId, ExpectedVersion};
    use serde_json::json;

    use super::*;
    use crate::event_store::{InMemoryEventStore, UncommittedEvent};

    #[test]
    fn yields_batches_until_head_and_remembers_position() {
        let store = InMemoryEventStore::new(1);
        let id = AggregateId::new("a").unwrap();
        let events = (0..5)
            .map(|n| UncommittedEvent {
                event_id: EventId::new(),
                causation_id: CommandId::new(),
                aggregate_id: id.clone(),
                aggregate_type: "test".to_string(),
                event_type: "test.happened".to_string(),
                event_version: 1,
                occurred_at: Utc::now(),
                payload: json!(n),
            })
            .collect();
        store.append(&id, ExpectedVersion::NoStream, events).unwrap();

        let mut reader = PartitionReader::new(&store, PartitionId::new(0), None, 2);
        let sizes: Vec<usize> = reader.by_ref().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(reader.position(), Some(4));

        let resumed = PartitionReader::new(&store, PartitionId::new(0), Some(2), 10);
        let offsets: Vec<u64> = resumed.flat_map(|b| b.unwrap()).map(|e| e.offset).collect();
        assert_eq!(offsets, vec![3, 4]);
    }
}
