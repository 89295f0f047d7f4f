use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use factline_events::{EventEnvelope, Projection, Subscription};

use crate::config::EngineConfig;
use crate::projector::{BatchOutcome, Projector};
use crate::retry::Backoff;

/// Why a worker thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested.
    Shutdown,
    /// A non-retryable projector error; the partition needs attention.
    Failed(String),
    /// The thread panicked.
    Panicked,
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<WorkerExit>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// The worker finishes the batch it is in; a half-processed batch is
    /// never committed.
    pub fn shutdown(mut self) -> WorkerExit {
        let _ = self.shutdown.send(());
        match self.join.take() {
            Some(j) => j.join().unwrap_or(WorkerExit::Panicked),
            None => WorkerExit::Shutdown,
        }
    }
}

/// Timing knobs of a projector worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Longest idle wait before the log is polled without a wake-up.
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for WorkerSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval,
            backoff_base: cfg.retry_backoff,
            backoff_max: cfg.retry_backoff_max,
        }
    }
}

/// Single sequential consumer of one `(projection, partition)`.
///
/// - runs batches back to back while the partition has work
/// - when idle, waits for a bus wake-up for its partition or the poll interval
/// - retries infrastructure failures with exponential backoff
/// - stops on undecodable events and offset gaps instead of skipping them
#[derive(Debug)]
pub struct ProjectorWorker;

impl ProjectorWorker {
    pub fn spawn<P: Projection>(
        projector: Projector<P>,
        wakeups: Option<Subscription<EventEnvelope<JsonValue>>>,
        settings: WorkerSettings,
    ) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = format!("projector-{}", projector.projection_id());

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(projector, wakeups, shutdown_rx, settings))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<P: Projection>(
    mut projector: Projector<P>,
    wakeups: Option<Subscription<EventEnvelope<JsonValue>>>,
    shutdown_rx: mpsc::Receiver<()>,
    settings: WorkerSettings,
) -> WorkerExit {
    let mut backoff = Backoff::new(settings.backoff_base, settings.backoff_max);
    info!(projection_id = projector.projection_id(), "projector worker started");

    loop {
        // Shutdown check (non-blocking); a dropped handle also stops the worker.
        if !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty)) {
            break;
        }

        match projector.run_batch() {
            Ok(BatchOutcome::Committed { .. }) => backoff.reset(),
            Ok(BatchOutcome::Idle) => {
                backoff.reset();
                if wait_for_work(&projector, wakeups.as_ref(), &shutdown_rx, settings.poll_interval) {
                    break;
                }
            }
            Err(err) if err.is_retryable() => {
                let delay = backoff.next_delay();
                warn!(
                    projection_id = projector.projection_id(),
                    partition = %projector.partition(),
                    attempt = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "projector batch failed; retrying"
                );
                if !matches!(shutdown_rx.recv_timeout(delay), Err(mpsc::RecvTimeoutError::Timeout)) {
                    break;
                }
            }
            Err(err) => {
                error!(
                    projection_id = projector.projection_id(),
                    partition = %projector.partition(),
                    error = %err,
                    "projector stopped"
                );
                return WorkerExit::Failed(err.to_string());
            }
        }
    }

    info!(projection_id = projector.projection_id(), "projector worker stopped");
    WorkerExit::Shutdown
}

/// Block until a wake-up for our partition, the poll interval, or shutdown.
/// Returns `true` when the worker should stop.
fn wait_for_work<P: Projection>(
    projector: &Projector<P>,
    wakeups: Option<&Subscription<EventEnvelope<JsonValue>>>,
    shutdown_rx: &mpsc::Receiver<()>,
    poll_interval: Duration,
) -> bool {
    let Some(sub) = wakeups else {
        return !matches!(shutdown_rx.recv_timeout(poll_interval), Err(mpsc::RecvTimeoutError::Timeout));
    };

    match sub.recv_timeout(poll_interval) {
        Ok(envelope) => {
            if envelope.partition() == projector.partition() {
                debug!(projection_id = projector.projection_id(), offset = envelope.offset(), "woken");
            }
            // Collapse a burst of wake-ups into one read.
            sub.drain();
            false
        }
        Err(mpsc::RecvTimeoutError::Timeout) => false,
        // Bus gone: fall back to polling.
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            !matches!(shutdown_rx.recv_timeout(poll_interval), Err(mpsc::RecvTimeoutError::Timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use chrono::Utc;
    use factline_accounts::{AGGREGATE_TYPE, AccountEvent, AccountId, Username, UsernameChanged};
    use factline_core::{AggregateId, CommandId, EventId, ExpectedVersion, PartitionId};
    use factline_events::{EventBus, InMemoryEventBus};

    use super::*;
    use crate::event_store::{EventStore, InMemoryEventStore, PublishingEventStore, UncommittedEvent};
    use crate::projections::{AccountsView, CheckpointStore, InMemoryCheckpointStore};

    fn rename(log: &dyn EventStore, account: &str, name: &str) {
        let id = AggregateId::new(account).unwrap();
        let event = AccountEvent::UsernameChanged(UsernameChanged {
            account_id: AccountId::new(id.clone()),
            username: Username::parse(name).unwrap(),
            previous: None,
            occurred_at: Utc::now(),
        });
        let e = UncommittedEvent::from_typed(id.clone(), AGGREGATE_TYPE, EventId::new(), CommandId::new(), &event).unwrap();
        log.append(&id, ExpectedVersion::Any, vec![e]).unwrap();
    }

    fn wait_for(checkpoints: &InMemoryCheckpointStore, id: &str, offset: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if checkpoints.get(id).unwrap() == Some(offset) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn worker_follows_the_log_and_stops_on_shutdown() {
        let bus = Arc::new(InMemoryEventBus::new());
        let log = Arc::new(PublishingEventStore::new(InMemoryEventStore::new(1), bus.clone()));
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());

        let projector = Projector::<AccountsView>::new(PartitionId::new(0), log.clone(), checkpoints.clone());
        let handle = ProjectorWorker::spawn(projector, Some(bus.subscribe()), WorkerSettings::default()).unwrap();

        rename(log.as_ref(), "1", "alice");
        assert!(wait_for(&checkpoints, "accounts@p0", 0));
        rename(log.as_ref(), "2", "bob");
        assert!(wait_for(&checkpoints, "accounts@p0", 1));

        assert_eq!(handle.shutdown(), WorkerExit::Shutdown);
    }

    #[test]
    fn polling_worker_without_a_bus_still_catches_up() {
        let log = Arc::new(InMemoryEventStore::new(1));
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        rename(log.as_ref(), "1", "alice");

        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(10),
            ..WorkerSettings::default()
        };
        let projector = Projector::<AccountsView>::new(PartitionId::new(0), log.clone(), checkpoints.clone());
        let handle = ProjectorWorker::spawn(projector, None, settings).unwrap();

        assert!(wait_for(&checkpoints, "accounts@p0", 0));
        assert_eq!(handle.shutdown(), WorkerExit::Shutdown);
    }
}
