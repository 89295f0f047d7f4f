use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use factline_core::Clock;

use super::store::{CheckOutcome, EffectKey, IdempotencyError, IdempotencyStore};

/// Result of a guarded execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution<T> {
    pub value: T,
    /// `true` when the value came from the store and the effect did not run.
    pub replayed: bool,
}

#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The store could not be reached; retry later. The effect did not run
    /// unguarded.
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    #[error("effect {0} is in flight elsewhere")]
    InFlight(EffectKey),

    /// The effect itself failed; its pending marker was released.
    #[error("effect failed: {0}")]
    Effect(E),

    #[error("recorded result could not be decoded: {0}")]
    Decode(String),
}

/// Runs a closure at most once per `(id, kind)`.
///
/// ## Protocol
///
/// 1. `check_and_reserve`: a stored result is returned as-is (`replayed`);
///    a live pending marker held by someone else is `InFlight`
/// 2. run the closure
/// 3. `record` its result (success), or `abandon` the marker (failure)
///
/// A crash between 2 and 3 leaves a pending marker that lapses after
/// `pending_ttl`, after which the effect may run again. Effects that must not
/// repeat even then should pass the [`EffectKey`] on to the external system
/// as its own idempotency key.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    pending_ttl: Duration,
}

impl core::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("pending_ttl", &self.pending_ttl)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, clock: Arc<dyn Clock>, pending_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            pending_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    pub fn execute_once<T, E, F>(&self, id: Uuid, kind: &str, f: F) -> Result<Execution<T>, GuardError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&EffectKey) -> Result<T, E>,
    {
        let key = EffectKey::new(id, kind);
        let now = self.clock.now();

        match self.store.check_and_reserve(&key, now + self.pending_ttl, now) {
            Ok(CheckOutcome::AlreadyDone(result)) => {
                debug!(key = %key, "effect already recorded; returning stored result");
                let value = serde_json::from_value(result).map_err(|e| GuardError::Decode(e.to_string()))?;
                return Ok(Execution { value, replayed: true });
            }
            Ok(CheckOutcome::Fresh) => {}
            Err(IdempotencyError::InFlight(k)) => return Err(GuardError::InFlight(k)),
            Err(e) => return Err(GuardError::Unavailable(e.to_string())),
        }

        let value = match f(&key) {
            Ok(v) => v,
            Err(e) => {
                if let Err(abandon_err) = self.store.abandon(&key) {
                    warn!(key = %key, error = %abandon_err, "failed to release pending marker; it will lapse");
                }
                return Err(GuardError::Effect(e));
            }
        };

        let result = serde_json::to_value(&value).map_err(|e| GuardError::Decode(e.to_string()))?;
        self.store
            .record(&key, &result, self.clock.now())
            .map_err(|e| GuardError::Unavailable(e.to_string()))?;

        Ok(Execution { value, replayed: false })
    }

    /// Purge completed records older than `retention`.
    pub fn purge(&self, retention: Duration) -> Result<usize, IdempotencyError> {
        self.store.purge_completed_before(self.clock.now() - retention)
    }
}
