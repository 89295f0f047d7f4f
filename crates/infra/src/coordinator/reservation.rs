use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use factline_core::{AggregateId, CommandId};
use factline_events::{ClaimChange, ClaimKey};

use super::CoordinatorError;

/// Ownership state of a claim key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    /// Tentatively held by an in-flight command, until `expires_at`.
    Leased { token: CommandId, expires_at: DateTime<Utc> },
    /// Confirmed by a committed event the coordinator has observed.
    Owned,
}

/// At most one per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub key: ClaimKey,
    pub holder: AggregateId,
    pub state: LeaseState,
}

impl Reservation {
    pub fn is_owned(&self) -> bool {
        matches!(self.state, LeaseState::Owned)
    }

    fn is_live_lease(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, LeaseState::Leased { expires_at, .. } if expires_at > now)
    }
}

/// Answer of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// A lease was granted (or refreshed) for the caller's token.
    Leased,
    /// The caller's aggregate already owns the key; no lease needed.
    AlreadyOwned,
    /// Someone else owns the key or holds a live lease on it.
    Held { holder: AggregateId },
}

/// Answer of [`ReservationStore::commit_fenced`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fenced {
    /// `commit` succeeded; the keys are now owned by the holder.
    Committed,
    /// `commit` ran and failed; the leases are left as they were.
    Aborted,
    /// This key was no longer leased under the caller's token; `commit` never ran.
    LeaseLost(ClaimKey),
}

/// A committed claim that could not take effect because the key was already
/// owned by another aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimConflict {
    pub key: ClaimKey,
    pub owner: AggregateId,
    pub claimant: AggregateId,
}

/// Durable reservation table plus the coordinator's log cursor.
///
/// ## Atomicity
///
/// Every method is one atomic step. In particular `apply_committed` applies a
/// committed event's claim changes and advances the cursor together, and is a
/// no-op for positions at or below the cursor, so replaying the log into the
/// table is idempotent.
pub trait ReservationStore: Send + Sync {
    fn try_reserve(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoordinatorError>;

    /// Extend a lease still held under `token`. Returns `false` when the lease
    /// was lost (taken over after expiry, or released).
    fn renew(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError>;

    /// Drop an unconfirmed lease held under `token`; anything else is left alone.
    fn release(&self, key: &ClaimKey, token: CommandId) -> Result<(), CoordinatorError>;

    /// Run `commit` while every key in `keys` is still leased to `holder` under
    /// `token` (or owned by it). No reservation on those keys can change until
    /// `commit` returns; when it returns `true` the keys become owned by `holder`.
    fn commit_fenced(
        &self,
        keys: &[ClaimKey],
        holder: &AggregateId,
        token: CommandId,
        now: DateTime<Utc>,
        commit: &mut dyn FnMut() -> bool,
    ) -> Result<Fenced, CoordinatorError>;

    fn apply_committed(
        &self,
        global_position: u64,
        holder: &AggregateId,
        changes: &[ClaimChange],
    ) -> Result<Vec<ClaimConflict>, CoordinatorError>;

    /// Global position of the last committed event applied, `None` before the first.
    fn observed_position(&self) -> Result<Option<u64>, CoordinatorError>;

    fn get(&self, key: &ClaimKey) -> Result<Option<Reservation>, CoordinatorError>;

    /// Delete leases that expired before `now`; returns how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError>;
}

impl<S> ReservationStore for Arc<S>
where
    S: ReservationStore + ?Sized,
{
    fn try_reserve(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoordinatorError> {
        (**self).try_reserve(key, holder, token, expires_at, now)
    }

    fn renew(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        (**self).renew(key, holder, token, expires_at)
    }

    fn release(&self, key: &ClaimKey, token: CommandId) -> Result<(), CoordinatorError> {
        (**self).release(key, token)
    }

    fn commit_fenced(
        &self,
        keys: &[ClaimKey],
        holder: &AggregateId,
        token: CommandId,
        now: DateTime<Utc>,
        commit: &mut dyn FnMut() -> bool,
    ) -> Result<Fenced, CoordinatorError> {
        (**self).commit_fenced(keys, holder, token, now, commit)
    }

    fn apply_committed(
        &self,
        global_position: u64,
        holder: &AggregateId,
        changes: &[ClaimChange],
    ) -> Result<Vec<ClaimConflict>, CoordinatorError> {
        (**self).apply_committed(global_position, holder, changes)
    }

    fn observed_position(&self) -> Result<Option<u64>, CoordinatorError> {
        (**self).observed_position()
    }

    fn get(&self, key: &ClaimKey) -> Result<Option<Reservation>, CoordinatorError> {
        (**self).get(key)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        (**self).purge_expired(now)
    }
}

/// Decide a reservation attempt against the current entry for the key.
pub(crate) fn decide_reserve(
    current: Option<&Reservation>,
    holder: &AggregateId,
    now: DateTime<Utc>,
) -> ReserveOutcome {
    match current {
        None => ReserveOutcome::Leased,
        Some(r) if r.is_owned() && &r.holder == holder => ReserveOutcome::AlreadyOwned,
        Some(r) if r.is_owned() => ReserveOutcome::Held { holder: r.holder.clone() },
        Some(r) if &r.holder != holder && r.is_live_lease(now) => ReserveOutcome::Held { holder: r.holder.clone() },
        // Own lease (possibly from an earlier attempt) or an expired one.
        Some(_) => ReserveOutcome::Leased,
    }
}

/// Whether `current` still lets `holder` commit under `token` at `now`.
pub(crate) fn holds_lease(
    current: Option<&Reservation>,
    holder: &AggregateId,
    token: CommandId,
    now: DateTime<Utc>,
) -> bool {
    match current {
        Some(r) if &r.holder != holder => false,
        Some(Reservation { state: LeaseState::Owned, .. }) => true,
        Some(Reservation {
            state: LeaseState::Leased { token: t, expires_at },
            ..
        }) => *t == token && *expires_at > now,
        None => false,
    }
}

#[derive(Debug, Default)]
struct Table {
    reservations: HashMap<ClaimKey, Reservation>,
    observed: Option<u64>,
}

/// In-memory reservation store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    table: Mutex<Table>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> CoordinatorError {
        CoordinatorError::Unavailable("lock poisoned".to_string())
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn try_reserve(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoordinatorError> {
        let mut table = self.table.lock().map_err(|_| Self::poisoned())?;
        let outcome = decide_reserve(table.reservations.get(key), holder, now);
        if outcome == ReserveOutcome::Leased {
            table.reservations.insert(
                key.clone(),
                Reservation {
                    key: key.clone(),
                    holder: holder.clone(),
                    state: LeaseState::Leased { token, expires_at },
                },
            );
        }
        Ok(outcome)
    }

    fn renew(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        let mut table = self.table.lock().map_err(|_| Self::poisoned())?;
        match table.reservations.get_mut(key) {
            Some(r) if &r.holder == holder && r.is_owned() => Ok(true),
            Some(r) if matches!(r.state, LeaseState::Leased { token: t, .. } if t == token) => {
                r.state = LeaseState::Leased { token, expires_at };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &ClaimKey, token: CommandId) -> Result<(), CoordinatorError> {
        let mut table = self.table.lock().map_err(|_| Self::poisoned())?;
        if matches!(
            table.reservations.get(key),
            Some(Reservation { state: LeaseState::Leased { token: t, .. }, .. }) if *t == token
        ) {
            table.reservations.remove(key);
        }
        Ok(())
    }

    fn commit_fenced(
        &self,
        keys: &[ClaimKey],
        holder: &AggregateId,
        token: CommandId,
        now: DateTime<Utc>,
        commit: &mut dyn FnMut() -> bool,
    ) -> Result<Fenced, CoordinatorError> {
        // The table stays locked across `commit`.
        let mut table = self.table.lock().map_err(|_| Self::poisoned())?;
        if let Some(lost) = keys
            .iter()
            .find(|key| !holds_lease(table.reservations.get(*key), holder, token, now))
        {
            return Ok(Fenced::LeaseLost(lost.clone()));
        }
        if !commit() {
            return Ok(Fenced::Aborted);
        }
        for key in keys {
            table.reservations.insert(
                key.clone(),
                Reservation {
                    key: key.clone(),
                    holder: holder.clone(),
                    state: LeaseState::Owned,
                },
            );
        }
        Ok(Fenced::Committed)
    }

    fn apply_committed(
        &self,
        global_position: u64,
        holder: &AggregateId,
        changes: &[ClaimChange],
    ) -> Result<Vec<ClaimConflict>, CoordinatorError> {
        let mut guard = self.table.lock().map_err(|_| Self::poisoned())?;
        let table = &mut *guard;
        if table.observed.is_some_and(|p| global_position <= p) {
            return Ok(Vec::new());
        }

        let mut conflicts = Vec::new();
        for change in changes {
            match change {
                ClaimChange::Acquire(key) => match table.reservations.get(key) {
                    Some(r) if r.is_owned() && &r.holder != holder => conflicts.push(ClaimConflict {
                        key: key.clone(),
                        owner: r.holder.clone(),
                        claimant: holder.clone(),
                    }),
                    _ => {
                        table.reservations.insert(
                            key.clone(),
                            Reservation {
                                key: key.clone(),
                                holder: holder.clone(),
                                state: LeaseState::Owned,
                            },
                        );
                    }
                },
                ClaimChange::Release(key) => {
                    if table.reservations.get(key).is_some_and(|r| r.is_owned() && &r.holder == holder) {
                        table.reservations.remove(key);
                    }
                }
            }
        }
        table.observed = Some(global_position);
        Ok(conflicts)
    }

    fn observed_position(&self) -> Result<Option<u64>, CoordinatorError> {
        Ok(self.table.lock().map_err(|_| Self::poisoned())?.observed)
    }

    fn get(&self, key: &ClaimKey) -> Result<Option<Reservation>, CoordinatorError> {
        Ok(self.table.lock().map_err(|_| Self::poisoned())?.reservations.get(key).cloned())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        let mut table = self.table.lock().map_err(|_| Self::poisoned())?;
        let before = table.reservations.len();
        table
            .reservations
            .retain(|_, r| !matches!(r.state, LeaseState::Leased { expires_at, .. } if expires_at <= now));
        Ok(before - table.reservations.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn agg(raw: &str) -> AggregateId {
        AggregateId::new(raw).unwrap()
    }

    fn foo() -> ClaimKey {
        ClaimKey::new("username", "foo")
    }

    #[test]
    fn live_leases_block_other_holders_until_expiry() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let ttl = now + Duration::seconds(30);

        assert_eq!(store.try_reserve(&foo(), &agg("1"), CommandId::new(), ttl, now).unwrap(), ReserveOutcome::Leased);
        assert_eq!(
            store.try_reserve(&foo(), &agg("2"), CommandId::new(), ttl, now).unwrap(),
            ReserveOutcome::Held { holder: agg("1") }
        );

        let later = now + Duration::seconds(31);
        assert_eq!(
            store.try_reserve(&foo(), &agg("2"), CommandId::new(), later + Duration::seconds(30), later).unwrap(),
            ReserveOutcome::Leased
        );
    }

    #[test]
    fn release_only_drops_the_matching_lease() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let token = CommandId::new();
        store.try_reserve(&foo(), &agg("1"), token, now + Duration::seconds(30), now).unwrap();

        store.release(&foo(), CommandId::new()).unwrap();
        assert!(store.get(&foo()).unwrap().is_some());

        store.release(&foo(), token).unwrap();
        assert!(store.get(&foo()).unwrap().is_none());
    }

    #[test]
    fn lost_lease_cannot_be_renewed() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let first = CommandId::new();
        store.try_reserve(&foo(), &agg("1"), first, now + Duration::seconds(1), now).unwrap();

        let later = now + Duration::seconds(5);
        store.try_reserve(&foo(), &agg("2"), CommandId::new(), later + Duration::seconds(30), later).unwrap();

        assert!(!store.renew(&foo(), &agg("1"), first, later + Duration::seconds(30)).unwrap());
    }

    #[test]
    fn fenced_commit_runs_only_under_a_live_lease() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let token = CommandId::new();
        store.try_reserve(&foo(), &agg("1"), token, now + Duration::seconds(30), now).unwrap();

        let mut ran = 0;
        let late = now + Duration::seconds(31);
        let outcome = store
            .commit_fenced(&[foo()], &agg("1"), token, late, &mut || {
                ran += 1;
                true
            })
            .unwrap();
        assert_eq!(outcome, Fenced::LeaseLost(foo()));

        let outcome = store
            .commit_fenced(&[foo()], &agg("1"), CommandId::new(), now, &mut || {
                ran += 1;
                true
            })
            .unwrap();
        assert_eq!(outcome, Fenced::LeaseLost(foo()));
        assert_eq!(ran, 0);

        assert_eq!(store.commit_fenced(&[foo()], &agg("1"), token, now, &mut || false).unwrap(), Fenced::Aborted);
        assert!(!store.get(&foo()).unwrap().unwrap().is_owned());

        assert_eq!(store.commit_fenced(&[foo()], &agg("1"), token, now, &mut || true).unwrap(), Fenced::Committed);
        let owned = store.get(&foo()).unwrap().unwrap();
        assert!(owned.is_owned());
        assert_eq!(owned.holder, agg("1"));
    }

    #[test]
    fn a_taken_over_lease_fails_the_fence() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let first = CommandId::new();
        store.try_reserve(&foo(), &agg("1"), first, now + Duration::seconds(1), now).unwrap();

        let later = now + Duration::seconds(5);
        let second = CommandId::new();
        store.try_reserve(&foo(), &agg("2"), second, later + Duration::seconds(30), later).unwrap();
        assert_eq!(store.commit_fenced(&[foo()], &agg("2"), second, later, &mut || true).unwrap(), Fenced::Committed);

        assert_eq!(
            store.commit_fenced(&[foo()], &agg("1"), first, now, &mut || true).unwrap(),
            Fenced::LeaseLost(foo())
        );
        assert_eq!(store.get(&foo()).unwrap().map(|r| r.holder), Some(agg("2")));
    }

    #[test]
    fn committed_claims_confirm_ownership_and_keep_the_first_owner() {
        let store = InMemoryReservationStore::new();
        store.apply_committed(0, &agg("1"), &[ClaimChange::Acquire(foo())]).unwrap();
        let conflicts = store.apply_committed(1, &agg("2"), &[ClaimChange::Acquire(foo())]).unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(store.get(&foo()).unwrap().map(|r| r.holder), Some(agg("1")));
        assert_eq!(store.observed_position().unwrap(), Some(1));
    }

    #[test]
    fn replayed_positions_are_ignored() {
        let store = InMemoryReservationStore::new();
        store.apply_committed(0, &agg("1"), &[ClaimChange::Acquire(foo())]).unwrap();
        store.apply_committed(1, &agg("1"), &[ClaimChange::Release(foo())]).unwrap();
        store.apply_committed(0, &agg("1"), &[ClaimChange::Acquire(foo())]).unwrap();

        assert!(store.get(&foo()).unwrap().is_none());
    }

    #[test]
    fn purge_removes_only_expired_leases() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let bar = ClaimKey::new("username", "bar");
        store.try_reserve(&foo(), &agg("1"), CommandId::new(), now + Duration::seconds(1), now).unwrap();
        store.apply_committed(0, &agg("2"), &[ClaimChange::Acquire(bar.clone())]).unwrap();

        assert_eq!(store.purge_expired(now + Duration::seconds(2)).unwrap(), 1);
        assert!(store.get(&bar).unwrap().is_some());
    }
}
