//! Projection rebuild tooling.
//!
//! A rebuild resets a projection's committed pair and replays its partition
//! from offset 0 through the regular projector, so effects stay deduplicated
//! by the idempotency guard. Stop the partition's worker first; a live worker
//! committing concurrently makes the rebuild abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use factline_events::Projection;

use crate::projector::{BatchOutcome, Projector, ProjectorError};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("projector error: {0}")]
    Projector(#[from] ProjectorError),

    #[error("replay cancelled")]
    Cancelled,

    #[error("replay thread panicked")]
    Panicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    Resetting,
    Replaying,
    Complete,
    Failed,
}

/// Progress of a running rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayProgress {
    pub projection_id: String,
    /// Partition head when the rebuild started (`None`: empty partition).
    pub target_offset: Option<u64>,
    pub processed_events: u64,
    /// Last committed offset of the rebuilt projection.
    pub checkpoint: Option<u64>,
    pub phase: ReplayPhase,
    pub error: Option<String>,
}

impl ReplayProgress {
    fn new(projection_id: &str) -> Self {
        Self {
            projection_id: projection_id.to_string(),
            target_offset: None,
            processed_events: 0,
            checkpoint: None,
            phase: ReplayPhase::Resetting,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, ReplayPhase::Complete | ReplayPhase::Failed)
    }
}

/// Shared progress cell plus cancellation flag.
#[derive(Debug, Clone)]
pub struct ReplayControl {
    progress: Arc<Mutex<ReplayProgress>>,
    cancellation: Arc<AtomicBool>,
}

impl ReplayControl {
    pub fn new(projection_id: &str) -> Self {
        Self {
            progress: Arc::new(Mutex::new(ReplayProgress::new(projection_id))),
            cancellation: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn progress(&self) -> ReplayProgress {
        match self.progress.lock() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Cancel; the rebuild stops before its next batch.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    fn update(&self, f: impl FnOnce(&mut ReplayProgress)) {
        match self.progress.lock() {
            Ok(mut p) => f(&mut p),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Rebuild `projector` from scratch on the calling thread.
pub fn rebuild<P: Projection>(projector: &mut Projector<P>, control: &ReplayControl) -> Result<ReplayProgress, ReplayError> {
    let result = run_rebuild(projector, control);
    control.update(|p| match &result {
        Ok(()) => p.phase = ReplayPhase::Complete,
        Err(e) => {
            p.phase = ReplayPhase::Failed;
            p.error = Some(e.to_string());
        }
    });
    result.map(|()| control.progress())
}

fn run_rebuild<P: Projection>(projector: &mut Projector<P>, control: &ReplayControl) -> Result<(), ReplayError> {
    let target = projector.log().head(projector.partition()).map_err(ProjectorError::from)?;
    control.update(|p| p.target_offset = target);

    if control.is_cancelled() {
        return Err(ReplayError::Cancelled);
    }
    projector.reset()?;
    control.update(|p| p.phase = ReplayPhase::Replaying);

    loop {
        if control.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }
        match projector.run_batch()? {
            BatchOutcome::Idle => break,
            BatchOutcome::Committed { events, last_offset, .. } => control.update(|p| {
                p.processed_events += events as u64;
                p.checkpoint = Some(last_offset);
            }),
        }
    }

    info!(
        projection_id = projector.projection_id(),
        processed = control.progress().processed_events,
        "projection rebuilt"
    );
    Ok(())
}

/// A rebuild running on its own thread.
#[derive(Debug)]
pub struct ReplayHandle {
    control: ReplayControl,
    join: Option<thread::JoinHandle<Result<ReplayProgress, ReplayError>>>,
}

impl ReplayHandle {
    pub fn progress(&self) -> ReplayProgress {
        self.control.progress()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Wait for the rebuild to finish.
    pub fn wait(mut self) -> Result<ReplayProgress, ReplayError> {
        match self.join.take() {
            Some(join) => join.join().map_err(|_| ReplayError::Panicked)?,
            None => Ok(self.control.progress()),
        }
    }
}

/// Start a rebuild of `projector` on a background thread.
pub fn spawn_rebuild<P: Projection>(mut projector: Projector<P>) -> std::io::Result<ReplayHandle> {
    let control = ReplayControl::new(projector.projection_id());
    let thread_control = control.clone();
    let join = thread::Builder::new()
        .name(format!("rebuild-{}", projector.projection_id()))
        .spawn(move || rebuild(&mut projector, &thread_control))?;

    Ok(ReplayHandle {
        control,
        join: Some(join),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use factline_accounts::{AGGREGATE_TYPE, AccountEvent, AccountId, Username, UsernameChanged};
    use factline_core::{AggregateId, CommandId, EventId, ExpectedVersion, PartitionId};

    use super::*;
    use crate::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
    use crate::projections::{AccountsView, InMemoryCheckpointStore};

    fn seeded(n: usize) -> Arc<InMemoryEventStore> {
        let log = Arc::new(InMemoryEventStore::new(1));
        for i in 0..n {
            let id = AggregateId::new(format!("acct-{i}")).unwrap();
            let event = AccountEvent::UsernameChanged(UsernameChanged {
                account_id: AccountId::new(id.clone()),
                username: Username::parse(&format!("user_{i}")).unwrap(),
                previous: None,
                occurred_at: Utc::now(),
            });
            let e = UncommittedEvent::from_typed(id.clone(), AGGREGATE_TYPE, EventId::new(), CommandId::new(), &event)
                .unwrap();
            log.append(&id, ExpectedVersion::NoStream, vec![e]).unwrap();
        }
        log
    }

    #[test]
    fn rebuild_matches_incremental_state() {
        let log = seeded(5);
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let mut live = Projector::<AccountsView>::new(PartitionId::new(0), log.clone(), checkpoints.clone());
        live.catch_up().unwrap();
        let before = live.committed().unwrap().clone();

        let projector =
            Projector::<AccountsView>::new(PartitionId::new(0), log.clone(), checkpoints.clone()).with_batch_size(2);
        let progress = spawn_rebuild(projector).unwrap().wait().unwrap();

        assert_eq!(progress.phase, ReplayPhase::Complete);
        assert_eq!(progress.processed_events, 5);
        assert_eq!(progress.target_offset, Some(4));
        live.invalidate();
        assert_eq!(live.committed().unwrap(), &before);
    }

    #[test]
    fn cancelled_rebuild_reports_failure() {
        let log = seeded(3);
        let mut projector =
            Projector::<AccountsView>::new(PartitionId::new(0), log, Arc::new(InMemoryCheckpointStore::new()));
        let control = ReplayControl::new(projector.projection_id());
        control.cancel();

        assert!(matches!(rebuild(&mut projector, &control), Err(ReplayError::Cancelled)));
        let progress = control.progress();
        assert_eq!(progress.phase, ReplayPhase::Failed);
        assert!(progress.is_finished());
    }
}
