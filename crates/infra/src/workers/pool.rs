use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;

use factline_core::PartitionId;
use factline_events::{EventBus, EventEnvelope, Projection};

use super::projection_worker::{ProjectorWorker, WorkerExit, WorkerHandle, WorkerSettings};
use crate::coordinator::PartitionAssignment;
use crate::projector::Projector;

/// One projector worker per partition of an assignment.
#[derive(Debug)]
pub struct ProjectorPool {
    workers: Vec<WorkerHandle>,
}

impl ProjectorPool {
    /// Spawn a worker for every partition in `assignment`.
    ///
    /// `make` builds the projector of a partition; each worker gets its own
    /// bus subscription. If a spawn fails, the already started workers are
    /// shut down before the error is returned.
    pub fn spawn<P, B, F>(
        assignment: &PartitionAssignment,
        bus: Option<Arc<B>>,
        settings: WorkerSettings,
        make: F,
    ) -> std::io::Result<Self>
    where
        P: Projection,
        B: EventBus<EventEnvelope<JsonValue>> + ?Sized,
        F: Fn(PartitionId) -> Projector<P>,
    {
        let mut pool = Self { workers: Vec::new() };
        for &partition in &assignment.partitions {
            let wakeups = bus.as_ref().map(|b| b.subscribe());
            match ProjectorWorker::spawn(make(partition), wakeups, settings) {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(err);
                }
            }
        }
        info!(instance = assignment.instance, workers = pool.workers.len(), "projector pool started");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Names of workers whose thread already ended (failed or panicked).
    pub fn finished(&self) -> Vec<&str> {
        self.workers.iter().filter(|w| w.is_finished()).map(WorkerHandle::name).collect()
    }

    /// Stop every worker and report how each one ended.
    pub fn shutdown(self) -> Vec<(String, WorkerExit)> {
        self.workers
            .into_iter()
            .map(|w| {
                let name = w.name().to_string();
                (name, w.shutdown())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use factline_events::InMemoryEventBus;

    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::{AccountsView, InMemoryCheckpointStore};

    #[test]
    fn one_worker_per_assigned_partition() {
        let log = Arc::new(InMemoryEventStore::new(4));
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let assignment = PartitionAssignment::for_instance(4, 2, 1);

        let pool = ProjectorPool::spawn(&assignment, Some(bus.clone()), WorkerSettings::default(), |p| {
            Projector::<AccountsView>::new(p, log.clone(), checkpoints.clone())
        })
        .unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(bus.subscriber_count(), 2);
        let exits = pool.shutdown();
        assert!(exits.iter().all(|(_, exit)| *exit == WorkerExit::Shutdown));
        assert_eq!(exits[0].0, "projector-accounts@p1");
    }
}
