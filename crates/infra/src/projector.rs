//! Partition projector: fold a log partition into a read model and commit
//! state and checkpoint as one unit.
//!
//! ## Batch protocol
//!
//! 1. read the partition strictly after the committed checkpoint
//! 2. fold a staged copy of the committed state (pure; effects are described,
//!    not executed)
//! 3. execute the described effects through the idempotency guard, keyed by
//!    `(event id, effect kind)`
//! 4. commit `(state, checkpoint)` conditionally on the checkpoint read in 1
//!
//! A failure at any step discards the staged state; the committed pair stays
//! where it was and the next batch starts over from the same offset. Effects
//! that already ran are answered by the guard on the retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use factline_core::{EventId, PartitionId};
use factline_events::{Effect, Projection, ProjectionError, ProjectionRunner};

use crate::event_store::{EventStore, EventStoreError, StoredEvent};
use crate::idempotency::{EffectKey, GuardError, IdempotencyGuard};
use crate::projections::{CheckpointError, CheckpointStore};

/// Projection id of `P` over `partition`, e.g. `accounts@p3`.
pub fn projection_id<P: Projection>(partition: PartitionId) -> String {
    format!("{}@{}", P::NAME, partition)
}

#[derive(Debug, Error)]
pub enum ProjectorError {
    #[error("reading the log failed: {0}")]
    Log(#[from] EventStoreError),

    /// An event payload did not decode into the projection's event type.
    #[error("cannot decode event at offset {offset}: {message}")]
    Decode { offset: u64, message: String },

    #[error(transparent)]
    Gap(#[from] ProjectionError),

    #[error("effect {kind} of event {event_id} failed: {message}")]
    Effect {
        event_id: EventId,
        kind: String,
        message: String,
    },

    #[error("idempotency guard unavailable: {0}")]
    GuardUnavailable(String),

    #[error("loading the checkpoint failed: {0}")]
    Checkpoint(CheckpointError),

    #[error("committing the checkpoint failed: {0}")]
    CheckpointCommitFailure(CheckpointError),

    #[error("state serialization failed: {0}")]
    Serialize(String),
}

impl ProjectorError {
    /// `false` for failures that will repeat forever at the same offset
    /// (undecodable events, gaps); those stop the projector.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProjectorError::Log(e) => matches!(e, EventStoreError::Unavailable(_)),
            ProjectorError::Effect { .. }
            | ProjectorError::GuardUnavailable(_)
            | ProjectorError::CheckpointCommitFailure(_) => true,
            ProjectorError::Checkpoint(e) => matches!(e, CheckpointError::Unavailable(_)),
            ProjectorError::Decode { .. } | ProjectorError::Gap(_) | ProjectorError::Serialize(_) => false,
        }
    }
}

/// Executes side-effect descriptions against the outside world.
///
/// The key is the idempotency key of this execution; implementations that
/// call systems with their own deduplication should forward it.
pub trait EffectDispatcher<E: Effect>: Send + Sync {
    fn dispatch(&self, key: &EffectKey, effect: &E) -> Result<JsonValue, String>;
}

impl<E, D> EffectDispatcher<E> for Arc<D>
where
    E: Effect,
    D: EffectDispatcher<E> + ?Sized,
{
    fn dispatch(&self, key: &EffectKey, effect: &E) -> Result<JsonValue, String> {
        (**self).dispatch(key, effect)
    }
}

/// Dispatcher that records every call; stands in for a notification channel.
#[derive(Debug)]
pub struct RecordingDispatcher<E> {
    calls: Mutex<Vec<(EffectKey, E)>>,
}

impl<E> Default for RecordingDispatcher<E> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> RecordingDispatcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(EffectKey, E)> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl<E: Effect> EffectDispatcher<E> for RecordingDispatcher<E> {
    fn dispatch(&self, key: &EffectKey, effect: &E) -> Result<JsonValue, String> {
        let mut calls = self.calls.lock().map_err(|_| "recording dispatcher poisoned".to_string())?;
        calls.push((key.clone(), effect.clone()));
        Ok(JsonValue::Bool(true))
    }
}

/// Committed checkpoint and decoded state.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<P> {
    pub checkpoint: Option<u64>,
    pub state: P,
}

/// What one `run_batch` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing past the checkpoint.
    Idle,
    Committed {
        first_offset: u64,
        last_offset: u64,
        events: usize,
        effects: usize,
    },
}

struct EffectRuntime<E> {
    guard: IdempotencyGuard,
    dispatcher: Arc<dyn EffectDispatcher<E>>,
}

/// One projection instance over one partition.
///
/// A projector built without [`with_effects`](Projector::with_effects) only
/// maintains state: effect descriptions are dropped (read replicas, benches),
/// with a warning on the first one.
pub struct Projector<P: Projection> {
    partition: PartitionId,
    projection_id: String,
    log: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    effects: Option<EffectRuntime<P::Effect>>,
    dropped_effects: AtomicBool,
    batch_size: usize,
    committed: Option<Committed<P>>,
}

impl<P: Projection> core::fmt::Debug for Projector<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Projector")
            .field("projection_id", &self.projection_id)
            .field("batch_size", &self.batch_size)
            .field("checkpoint", &self.committed.as_ref().map(|c| c.checkpoint))
            .finish_non_exhaustive()
    }
}

impl<P: Projection> Projector<P> {
    pub fn new(partition: PartitionId, log: Arc<dyn EventStore>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            partition,
            projection_id: projection_id::<P>(partition),
            log,
            checkpoints,
            effects: None,
            dropped_effects: AtomicBool::new(false),
            batch_size: 128,
            committed: None,
        }
    }

    pub fn with_effects(mut self, guard: IdempotencyGuard, dispatcher: Arc<dyn EffectDispatcher<P::Effect>>) -> Self {
        self.effects = Some(EffectRuntime { guard, dispatcher });
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn projection_id(&self) -> &str {
        &self.projection_id
    }

    pub fn log(&self) -> &Arc<dyn EventStore> {
        &self.log
    }

    /// Committed `(checkpoint, state)`, loaded from the store on first use.
    pub fn committed(&mut self) -> Result<&Committed<P>, ProjectorError> {
        if self.committed.is_none() {
            self.committed = Some(load_committed(self.checkpoints.as_ref(), &self.projection_id)?);
        }
        match &self.committed {
            Some(c) => Ok(c),
            None => Err(ProjectorError::Checkpoint(CheckpointError::Unavailable(
                "committed state missing after load".to_string(),
            ))),
        }
    }

    /// Drop the cached committed pair; the next batch reloads it.
    pub fn invalidate(&mut self) {
        self.committed = None;
    }

    /// Forget the committed pair in the store (rebuild from offset 0).
    pub fn reset(&mut self) -> Result<(), ProjectorError> {
        self.committed = None;
        self.checkpoints
            .reset(&self.projection_id)
            .map_err(ProjectorError::Checkpoint)
    }

    /// Process at most one batch.
    pub fn run_batch(&mut self) -> Result<BatchOutcome, ProjectorError> {
        let (checkpoint, state) = {
            let committed = self.committed()?;
            (committed.checkpoint, committed.state.clone())
        };

        let batch = self.log.read(self.partition, checkpoint, self.batch_size)?;
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(BatchOutcome::Idle);
        };
        let (first_offset, last_offset) = (first.offset, last.offset);

        let mut runner = ProjectionRunner::resume(self.partition, checkpoint, state);
        let mut described = Vec::new();
        for stored in &batch {
            described.extend(self.fold(&mut runner, stored)?);
        }

        let executed = described.len();
        for (event_id, kind, effect) in described {
            self.execute(event_id, &kind, &effect)?;
        }

        let new_checkpoint = runner.cursor().last_offset().unwrap_or(last_offset);
        let state = runner.into_projection();
        let json = serde_json::to_value(&state).map_err(|e| ProjectorError::Serialize(e.to_string()))?;

        if let Err(err) = self
            .checkpoints
            .commit(&self.projection_id, checkpoint, new_checkpoint, &json)
        {
            warn!(
                projection_id = %self.projection_id,
                partition = %self.partition,
                offset = first_offset,
                error = %err,
                "batch aborted; staged state discarded"
            );
            self.committed = None;
            return Err(ProjectorError::CheckpointCommitFailure(err));
        }

        debug!(
            projection_id = %self.projection_id,
            partition = %self.partition,
            from = first_offset,
            to = new_checkpoint,
            effects = executed,
            "batch committed"
        );
        self.committed = Some(Committed {
            checkpoint: Some(new_checkpoint),
            state,
        });

        Ok(BatchOutcome::Committed {
            first_offset,
            last_offset,
            events: batch.len(),
            effects: executed,
        })
    }

    /// Run batches until the partition head; returns the number of events processed.
    pub fn catch_up(&mut self) -> Result<usize, ProjectorError> {
        let mut processed = 0;
        loop {
            match self.run_batch()? {
                BatchOutcome::Idle => return Ok(processed),
                BatchOutcome::Committed { events, .. } => processed += events,
            }
        }
    }

    /// Fold one stored event into the staged state; returns its effects with
    /// their idempotency kinds.
    fn fold(
        &self,
        runner: &mut ProjectionRunner<P>,
        stored: &StoredEvent,
    ) -> Result<Vec<(EventId, String, P::Effect)>, ProjectorError> {
        if !P::handles(&stored.aggregate_type) {
            runner.pass(stored.partition, stored.offset)?;
            return Ok(Vec::new());
        }

        let envelope = stored
            .to_envelope()
            .try_map(serde_json::from_value::<P::Ev>)
            .map_err(|e| {
                warn!(
                    projection_id = %self.projection_id,
                    offset = stored.offset,
                    error = %e,
                    "undecodable event; projector stops here"
                );
                ProjectorError::Decode {
                    offset: stored.offset,
                    message: e.to_string(),
                }
            })?;

        let effects = runner.apply(&envelope)?;
        Ok(effect_keys(envelope.event_id(), effects))
    }

    fn execute(&self, event_id: EventId, kind: &str, effect: &P::Effect) -> Result<(), ProjectorError> {
        let Some(runtime) = &self.effects else {
            // `NoEffect` is uninhabited, so reaching this means real effects are lost.
            if !self.dropped_effects.swap(true, Ordering::Relaxed) {
                warn!(
                    projection_id = %self.projection_id,
                    event_id = %event_id,
                    kind,
                    "projector has no effect dispatcher; effects of this projection are dropped"
                );
            } else {
                debug!(projection_id = %self.projection_id, event_id = %event_id, kind, "state-only projector; effect dropped");
            }
            return Ok(());
        };

        let outcome = runtime
            .guard
            .execute_once::<JsonValue, String, _>(*event_id.as_uuid(), kind, |key| {
                runtime.dispatcher.dispatch(key, effect)
            });

        match outcome {
            Ok(_) => Ok(()),
            Err(GuardError::Effect(message)) => Err(ProjectorError::Effect {
                event_id,
                kind: kind.to_string(),
                message,
            }),
            Err(GuardError::InFlight(key)) => Err(ProjectorError::GuardUnavailable(format!("{key} is in flight"))),
            Err(GuardError::Unavailable(m)) => Err(ProjectorError::GuardUnavailable(m)),
            Err(GuardError::Decode(m)) => Err(ProjectorError::Serialize(m)),
        }
    }
}

/// Attach idempotency kinds; the second effect of the same kind from one
/// event becomes `kind#1`, the third `kind#2`, and so on.
fn effect_keys<E: Effect>(event_id: EventId, effects: Vec<E>) -> Vec<(EventId, String, E)> {
    let mut seen: HashMap<&'static str, usize> = HashMap::new();
    effects
        .into_iter()
        .map(|effect| {
            let kind = effect.kind();
            let n = seen.entry(kind).or_insert(0);
            let key = if *n == 0 { kind.to_string() } else { format!("{kind}#{n}") };
            *n += 1;
            (event_id, key, effect)
        })
        .collect()
}

fn load_committed<P: Projection>(store: &dyn CheckpointStore, projection_id: &str) -> Result<Committed<P>, ProjectorError> {
    match store.load(projection_id).map_err(ProjectorError::Checkpoint)? {
        None => Ok(Committed {
            checkpoint: None,
            state: P::default(),
        }),
        Some(c) => {
            let state = serde_json::from_value(c.state).map_err(|e| {
                ProjectorError::Checkpoint(CheckpointError::Corrupt(format!("{projection_id}: {e}")))
            })?;
            Ok(Committed {
                checkpoint: c.checkpoint,
                state,
            })
        }
    }
}

/// Query-side access to committed projection state.
pub struct ProjectionReader<P> {
    checkpoints: Arc<dyn CheckpointStore>,
    _projection: core::marker::PhantomData<fn() -> P>,
}

impl<P: Projection> ProjectionReader<P> {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            checkpoints,
            _projection: core::marker::PhantomData,
        }
    }

    pub fn load(&self, partition: PartitionId) -> Result<Committed<P>, ProjectorError> {
        load_committed(self.checkpoints.as_ref(), &projection_id::<P>(partition))
    }

    /// Committed state of every partition, in partition order.
    pub fn load_all(&self, partitions: u32) -> Result<Vec<Committed<P>>, ProjectorError> {
        (0..partitions).map(|p| self.load(PartitionId::new(p))).collect()
    }
}
