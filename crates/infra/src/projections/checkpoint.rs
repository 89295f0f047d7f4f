//! Projection checkpoint + state persistence.
//!
//! A projector's read model and its checkpoint are one unit: `commit` writes
//! both or neither. This gives:
//! - exactly-once folding of every offset into the committed state
//! - resume after a crash from the last committed `(checkpoint, state)`
//! - deterministic rebuilds (`reset`, then replay from offset 0)

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Last committed offset of one projection instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub projection_id: String,
    /// `None` when nothing has been committed yet.
    pub last_committed_offset: Option<u64>,
}

/// Committed `(checkpoint, state)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedState {
    pub checkpoint: Option<u64>,
    pub state: JsonValue,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The stored checkpoint moved since it was read (another writer, a
    /// rewind). Nothing was written.
    #[error("commit of {projection_id} aborted: expected checkpoint {expected:?}, found {found:?}")]
    Aborted {
        projection_id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("checkpoint data corrupt: {0}")]
    Corrupt(String),
}

/// Persists projection checkpoints together with their serialized state.
pub trait CheckpointStore: Send + Sync {
    /// Last committed offset (`None` if never committed).
    fn get(&self, projection_id: &str) -> Result<Option<u64>, CheckpointError>;

    /// Committed checkpoint and state, `None` if never committed.
    fn load(&self, projection_id: &str) -> Result<Option<CommittedState>, CheckpointError>;

    /// Atomically replace state and checkpoint, provided the stored checkpoint
    /// still equals `expected`.
    fn commit(
        &self,
        projection_id: &str,
        expected: Option<u64>,
        checkpoint: u64,
        state: &JsonValue,
    ) -> Result<(), CheckpointError>;

    /// Move the checkpoint back to `to`, keeping the state. Offsets after `to`
    /// are delivered again, so this is only sound for folds that tolerate
    /// reapplying an event; it reproduces a crash between state and checkpoint
    /// writes in a split-storage deployment.
    fn rewind(&self, projection_id: &str, to: Option<u64>) -> Result<(), CheckpointError>;

    /// Forget checkpoint and state (rebuild from scratch).
    fn reset(&self, projection_id: &str) -> Result<(), CheckpointError>;
}

impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    fn get(&self, projection_id: &str) -> Result<Option<u64>, CheckpointError> {
        (**self).get(projection_id)
    }

    fn load(&self, projection_id: &str) -> Result<Option<CommittedState>, CheckpointError> {
        (**self).load(projection_id)
    }

    fn commit(
        &self,
        projection_id: &str,
        expected: Option<u64>,
        checkpoint: u64,
        state: &JsonValue,
    ) -> Result<(), CheckpointError> {
        (**self).commit(projection_id, expected, checkpoint, state)
    }

    fn rewind(&self, projection_id: &str, to: Option<u64>) -> Result<(), CheckpointError> {
        (**self).rewind(projection_id, to)
    }

    fn reset(&self, projection_id: &str) -> Result<(), CheckpointError> {
        (**self).reset(projection_id)
    }
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<HashMap<String, CommittedState>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All checkpoints, sorted by projection id.
    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let guard = self.inner.read().map_err(|_| poisoned())?;
        let mut all: Vec<_> = guard
            .iter()
            .map(|(id, c)| Checkpoint {
                projection_id: id.clone(),
                last_committed_offset: c.checkpoint,
            })
            .collect();
        all.sort_by(|a, b| a.projection_id.cmp(&b.projection_id));
        Ok(all)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn get(&self, projection_id: &str) -> Result<Option<u64>, CheckpointError> {
        let guard = self.inner.read().map_err(|_| poisoned())?;
        Ok(guard.get(projection_id).and_then(|c| c.checkpoint))
    }

    fn load(&self, projection_id: &str) -> Result<Option<CommittedState>, CheckpointError> {
        let guard = self.inner.read().map_err(|_| poisoned())?;
        Ok(guard.get(projection_id).cloned())
    }

    fn commit(
        &self,
        projection_id: &str,
        expected: Option<u64>,
        checkpoint: u64,
        state: &JsonValue,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        let found = guard.get(projection_id).and_then(|c| c.checkpoint);
        if found != expected {
            return Err(CheckpointError::Aborted {
                projection_id: projection_id.to_string(),
                expected,
                found,
            });
        }
        guard.insert(
            projection_id.to_string(),
            CommittedState {
                checkpoint: Some(checkpoint),
                state: state.clone(),
            },
        );
        Ok(())
    }

    fn rewind(&self, projection_id: &str, to: Option<u64>) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        if let Some(committed) = guard.get_mut(projection_id) {
            committed.checkpoint = match (committed.checkpoint, to) {
                (Some(current), Some(to)) => Some(current.min(to)),
                _ => None,
            };
        }
        Ok(())
    }

    fn reset(&self, projection_id: &str) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        guard.remove(projection_id);
        Ok(())
    }
}

fn poisoned() -> CheckpointError {
    CheckpointError::Unavailable("checkpoint store lock poisoned".to_string())
}
