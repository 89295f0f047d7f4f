use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Identity of one guarded effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectKey {
    pub id: Uuid,
    pub kind: String,
}

impl EffectKey {
    pub fn new(id: Uuid, kind: impl Into<String>) -> Self {
        Self { id, kind: kind.into() }
    }
}

impl core::fmt::Display for EffectKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.id, self.kind)
    }
}

/// A completed effect and its recorded result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub effect_kind: String,
    pub result: JsonValue,
    pub completed_at: DateTime<Utc>,
}

/// Outcome of [`IdempotencyStore::check_and_reserve`].
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// No record; the caller now holds the pending marker and may run the effect.
    Fresh,
    /// The effect already completed with this result.
    AlreadyDone(JsonValue),
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    /// Another executor holds a live pending marker for this key.
    #[error("effect {0} is in flight elsewhere")]
    InFlight(EffectKey),

    #[error("idempotency record corrupt: {0}")]
    Corrupt(String),
}

/// Durable record of completed effects.
///
/// ## Atomicity
///
/// `check_and_reserve` must be a single atomic check-and-set: two callers
/// racing on the same key see exactly one `Fresh`. The pending marker carries a
/// lease (`pending_until`); once it lapses the key can be reserved again, which
/// covers executors that crashed mid-effect.
pub trait IdempotencyStore: Send + Sync {
    fn check_and_reserve(
        &self,
        key: &EffectKey,
        pending_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, IdempotencyError>;

    /// Store the result of a completed effect, clearing the pending marker.
    fn record(&self, key: &EffectKey, result: &JsonValue, now: DateTime<Utc>) -> Result<(), IdempotencyError>;

    /// Drop the pending marker of an effect that failed (completed records are kept).
    fn abandon(&self, key: &EffectKey) -> Result<(), IdempotencyError>;

    fn get(&self, key: &EffectKey) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Delete completed records older than `cutoff`, and pending markers whose
    /// lease ran out before it (left by executors that died); returns how many
    /// were removed.
    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, IdempotencyError>;
}

impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    fn check_and_reserve(
        &self,
        key: &EffectKey,
        pending_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, IdempotencyError> {
        (**self).check_and_reserve(key, pending_until, now)
    }

    fn record(&self, key: &EffectKey, result: &JsonValue, now: DateTime<Utc>) -> Result<(), IdempotencyError> {
        (**self).record(key, result, now)
    }

    fn abandon(&self, key: &EffectKey) -> Result<(), IdempotencyError> {
        (**self).abandon(key)
    }

    fn get(&self, key: &EffectKey) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        (**self).get(key)
    }

    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        (**self).purge_completed_before(cutoff)
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Pending { until: DateTime<Utc> },
    Done(IdempotencyRecord),
}

/// In-memory idempotency store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<EffectKey, Entry>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed records.
    pub fn completed(&self) -> usize {
        self.entries
            .lock()
            .map(|m| m.values().filter(|e| matches!(e, Entry::Done(_))).count())
            .unwrap_or(0)
    }

    fn poisoned() -> IdempotencyError {
        IdempotencyError::Unavailable("lock poisoned".to_string())
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn check_and_reserve(
        &self,
        key: &EffectKey,
        pending_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, IdempotencyError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        match entries.get(key) {
            Some(Entry::Done(record)) => return Ok(CheckOutcome::AlreadyDone(record.result.clone())),
            Some(Entry::Pending { until }) if *until > now => {
                return Err(IdempotencyError::InFlight(key.clone()));
            }
            _ => {}
        }
        entries.insert(key.clone(), Entry::Pending { until: pending_until });
        Ok(CheckOutcome::Fresh)
    }

    fn record(&self, key: &EffectKey, result: &JsonValue, now: DateTime<Utc>) -> Result<(), IdempotencyError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.insert(
            key.clone(),
            Entry::Done(IdempotencyRecord {
                id: key.id,
                effect_kind: key.kind.clone(),
                result: result.clone(),
                completed_at: now,
            }),
        );
        Ok(())
    }

    fn abandon(&self, key: &EffectKey) -> Result<(), IdempotencyError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        if matches!(entries.get(key), Some(Entry::Pending { .. })) {
            entries.remove(key);
        }
        Ok(())
    }

    fn get(&self, key: &EffectKey) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(match entries.get(key) {
            Some(Entry::Done(record)) => Some(record.clone()),
            _ => None,
        })
    }

    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let before = entries.len();
        entries.retain(|_, e| match e {
            Entry::Done(r) => r.completed_at >= cutoff,
            Entry::Pending { until } => *until >= cutoff,
        });
        Ok(before - entries.len())
    }
}
