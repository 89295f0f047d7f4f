//! Cross-partition uniqueness arbitration and partition assignment.
//!
//! Partitions are consumed independently, so no projector can see every
//! claim on a value such as a username. The coordinator closes that gap:
//!
//! - command handlers **reserve** the keys they are about to acquire and get a
//!   short lease tagged with their command id
//! - ownership is **confirmed** only from committed events, read from the log
//!   in global order by the coordinator itself
//! - every `reserve` first **catches up** with the log, so a key released by a
//!   committed event (or a lease that expired) is visible to the next claimant
//!   only once the log says so
//! - the append that acquires the keys runs **fenced** by the leases: it only
//!   happens while they are still held under the command's token, and nobody
//!   can take them over until it returns
//!
//! A committed acquire of a key already owned by someone else is logged and
//! ignored (the first owner keeps it); the reservation protocol makes that
//! unreachable in normal operation.

pub mod assignment;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod reservation;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, info};

use factline_core::{AggregateId, Clock, CommandId};
use factline_events::{ClaimChange, ClaimKey, UniqueClaims};

use crate::event_store::{EventStore, EventStoreError, StoredEvent};

pub use assignment::PartitionAssignment;
#[cfg(feature = "postgres")]
pub use postgres::PostgresReservationStore;
pub use reservation::{
    ClaimConflict, Fenced, InMemoryReservationStore, LeaseState, Reservation, ReservationStore, ReserveOutcome,
};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Another aggregate owns the key or holds a live lease on it.
    #[error("{key} is held by {holder}")]
    Held { key: ClaimKey, holder: AggregateId },

    /// The lease expired and changed hands (or was released) before the commit.
    #[error("lease on {key} was lost before the commit")]
    LeaseLost { key: ClaimKey },

    #[error("reservation store unavailable: {0}")]
    Unavailable(String),

    #[error("reading the log failed: {0}")]
    Log(#[from] EventStoreError),

    /// A committed event's claims could not be extracted. The coordinator stops
    /// at that position instead of skipping it.
    #[error("cannot extract claims at global position {global_position}: {message}")]
    Decode { global_position: u64, message: String },
}

/// Successful answer of [`Coordinator::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserved {
    /// A lease was granted under the caller's token.
    Leased,
    /// The caller already owns the key.
    AlreadyOwned,
}

type ClaimExtractor = Arc<dyn Fn(&StoredEvent) -> Result<Vec<ClaimChange>, String> + Send + Sync>;

/// Arbitrates claim keys across all partitions.
pub struct Coordinator {
    store: Arc<dyn ReservationStore>,
    log: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    extractors: HashMap<String, ClaimExtractor>,
    batch_size: usize,
    catch_up_lock: Mutex<()>,
}

impl core::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coordinator")
            .field("aggregate_types", &self.extractors.keys().collect::<Vec<_>>())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(store: Arc<dyn ReservationStore>, log: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            log,
            clock,
            extractors: HashMap::new(),
            batch_size: 256,
            catch_up_lock: Mutex::new(()),
        }
    }

    /// Register the claims carried by events of `aggregate_type`.
    pub fn with_claims<E>(mut self, aggregate_type: &str) -> Self
    where
        E: UniqueClaims + DeserializeOwned,
    {
        let extractor: ClaimExtractor = Arc::new(|stored: &StoredEvent| {
            serde_json::from_value::<E>(stored.payload.clone())
                .map(|e| e.claim_changes())
                .map_err(|e| e.to_string())
        });
        self.extractors.insert(aggregate_type.to_string(), extractor);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Apply every committed event past the observed position, in global order.
    ///
    /// Returns the number of events observed by this call. Concurrent callers
    /// serialize; the store's cursor makes a repeated application a no-op.
    pub fn catch_up(&self) -> Result<usize, CoordinatorError> {
        let _serial = self
            .catch_up_lock
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("catch-up lock poisoned".to_string()))?;

        let mut observed = 0;
        loop {
            let after = self.store.observed_position()?;
            let batch = self.log.read_all(after, self.batch_size)?;
            if batch.is_empty() {
                return Ok(observed);
            }
            for event in &batch {
                let changes = match self.extractors.get(&event.aggregate_type) {
                    Some(extract) => extract(event).map_err(|message| CoordinatorError::Decode {
                        global_position: event.global_position,
                        message,
                    })?,
                    None => Vec::new(),
                };
                let conflicts = self
                    .store
                    .apply_committed(event.global_position, &event.aggregate_id, &changes)?;
                for c in conflicts {
                    error!(
                        key = %c.key,
                        owner = %c.owner,
                        claimant = %c.claimant,
                        global_position = event.global_position,
                        "committed claim on a key owned by another aggregate; keeping the first owner"
                    );
                }
                observed += 1;
            }
            debug!(observed, up_to = ?batch.last().map(|e| e.global_position), "coordinator caught up");
        }
    }

    /// Reserve `key` for `holder` under `token` for `ttl`, after catching up with the log.
    pub fn reserve(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        ttl: Duration,
    ) -> Result<Reserved, CoordinatorError> {
        self.catch_up()?;
        let now = self.clock.now();
        match self.store.try_reserve(key, holder, token, now + ttl, now)? {
            ReserveOutcome::Leased => Ok(Reserved::Leased),
            ReserveOutcome::AlreadyOwned => Ok(Reserved::AlreadyOwned),
            ReserveOutcome::Held { holder: current } => {
                info!(key = %key, holder = %current, claimant = %holder, command_id = %token, "claim held");
                Err(CoordinatorError::Held {
                    key: key.clone(),
                    holder: current,
                })
            }
        }
    }

    /// Extend a lease; `false` means it was lost and the command must start over.
    pub fn renew(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        self.store.renew(key, holder, token, self.clock.now() + ttl)
    }

    /// Run `commit` (the log append) fenced by the leases on `keys`.
    ///
    /// Returns what `commit` returned. When a lease is no longer held under
    /// `token`, `commit` does not run and [`CoordinatorError::LeaseLost`] is
    /// returned instead.
    pub fn commit_fenced(
        &self,
        keys: &[ClaimKey],
        holder: &AggregateId,
        token: CommandId,
        commit: &mut dyn FnMut() -> bool,
    ) -> Result<bool, CoordinatorError> {
        if keys.is_empty() {
            return Ok(commit());
        }
        // A fence that died after its append leaves ownership only in the log.
        self.catch_up()?;
        match self.store.commit_fenced(keys, holder, token, self.clock.now(), commit)? {
            Fenced::Committed => Ok(true),
            Fenced::Aborted => Ok(false),
            Fenced::LeaseLost(key) => {
                info!(key = %key, claimant = %holder, command_id = %token, "lease lost before commit");
                Err(CoordinatorError::LeaseLost { key })
            }
        }
    }

    pub fn release(&self, key: &ClaimKey, token: CommandId) -> Result<(), CoordinatorError> {
        self.store.release(key, token)
    }

    /// Confirmed owner of `key` as of the last catch-up.
    pub fn owner_of(&self, key: &ClaimKey) -> Result<Option<AggregateId>, CoordinatorError> {
        Ok(self.store.get(key)?.filter(Reservation::is_owned).map(|r| r.holder))
    }

    pub fn observed_position(&self) -> Result<Option<u64>, CoordinatorError> {
        self.store.observed_position()
    }

    /// Drop expired leases.
    pub fn purge_expired(&self) -> Result<usize, CoordinatorError> {
        self.store.purge_expired(self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use factline_core::{ExpectedVersion, ManualClock};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::event_store::{InMemoryEventStore, UncommittedEvent};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Claimed {
        name: String,
        previous: Option<String>,
    }

    impl UniqueClaims for Claimed {
        fn claim_changes(&self) -> Vec<ClaimChange> {
            let mut changes: Vec<_> = self
                .previous
                .iter()
                .map(|p| ClaimChange::Release(ClaimKey::new("name", p)))
                .collect();
            changes.push(ClaimChange::Acquire(ClaimKey::new("name", &self.name)));
            changes
        }
    }

    struct Fixture {
        log: Arc<InMemoryEventStore>,
        clock: Arc<ManualClock>,
        coordinator: Coordinator,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(InMemoryEventStore::new(4));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = Coordinator::new(Arc::new(InMemoryReservationStore::new()), log.clone(), clock.clone())
            .with_claims::<Claimed>("named");
        Fixture { log, clock, coordinator }
    }

    fn commit(log: &InMemoryEventStore, aggregate: &str, name: &str, previous: Option<&str>) {
        let id = AggregateId::new(aggregate).unwrap();
        let payload = json!({ "name": name, "previous": previous });
        log.append(
            &id,
            ExpectedVersion::Any,
            vec![UncommittedEvent {
                event_id: factline_core::EventId::new(),
                causation_id: CommandId::new(),
                aggregate_id: id.clone(),
                aggregate_type: "named".to_string(),
                event_type: "named.claimed".to_string(),
                event_version: 1,
                occurred_at: Utc::now(),
                payload,
            }],
        )
        .unwrap();
    }

    fn agg(raw: &str) -> AggregateId {
        AggregateId::new(raw).unwrap()
    }

    #[test]
    fn reserve_sees_committed_ownership() {
        let f = fixture();
        commit(&f.log, "1", "foo", None);

        let err = f
            .coordinator
            .reserve(&ClaimKey::new("name", "foo"), &agg("2"), CommandId::new(), Duration::seconds(30))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Held { holder, .. } if holder == agg("1")));
    }

    #[test]
    fn released_keys_become_available_once_observed() {
        let f = fixture();
        let foo = ClaimKey::new("name", "foo");
        commit(&f.log, "1", "foo", None);
        f.coordinator.catch_up().unwrap();
        commit(&f.log, "1", "bar", Some("foo"));

        let reserved = f.coordinator.reserve(&foo, &agg("2"), CommandId::new(), Duration::seconds(30)).unwrap();
        assert_eq!(reserved, Reserved::Leased);
        assert_eq!(f.coordinator.owner_of(&ClaimKey::new("name", "bar")).unwrap(), Some(agg("1")));
    }

    #[test]
    fn owner_reserving_again_is_already_owned() {
        let f = fixture();
        commit(&f.log, "1", "foo", None);
        let r = f
            .coordinator
            .reserve(&ClaimKey::new("name", "foo"), &agg("1"), CommandId::new(), Duration::seconds(30))
            .unwrap();
        assert_eq!(r, Reserved::AlreadyOwned);
    }

    #[test]
    fn expired_lease_yields_to_the_next_claimant() {
        let f = fixture();
        let foo = ClaimKey::new("name", "foo");
        let ttl = Duration::seconds(30);
        f.coordinator.reserve(&foo, &agg("1"), CommandId::new(), ttl).unwrap();
        assert!(f.coordinator.reserve(&foo, &agg("2"), CommandId::new(), ttl).is_err());

        f.clock.advance(Duration::seconds(31));
        assert_eq!(f.coordinator.reserve(&foo, &agg("2"), CommandId::new(), ttl).unwrap(), Reserved::Leased);
        assert_eq!(f.coordinator.purge_expired().unwrap(), 0);
    }

    #[test]
    fn fenced_commit_confirms_ownership_before_the_log_is_observed() {
        let f = fixture();
        let foo = ClaimKey::new("name", "foo");
        let token = CommandId::new();
        f.coordinator.reserve(&foo, &agg("1"), token, Duration::seconds(30)).unwrap();

        let committed = f
            .coordinator
            .commit_fenced(std::slice::from_ref(&foo), &agg("1"), token, &mut || {
                commit(&f.log, "1", "foo", None);
                true
            })
            .unwrap();
        assert!(committed);
        assert_eq!(f.coordinator.owner_of(&foo).unwrap(), Some(agg("1")));

        // Long after the lease would have expired, the key is still owned.
        f.clock.advance(Duration::seconds(120));
        assert!(f.coordinator.reserve(&foo, &agg("2"), CommandId::new(), Duration::seconds(30)).is_err());
    }

    #[test]
    fn expired_lease_cannot_commit() {
        let f = fixture();
        let foo = ClaimKey::new("name", "foo");
        let token = CommandId::new();
        f.coordinator.reserve(&foo, &agg("1"), token, Duration::seconds(30)).unwrap();
        f.clock.advance(Duration::seconds(31));

        let mut ran = false;
        let err = f
            .coordinator
            .commit_fenced(std::slice::from_ref(&foo), &agg("1"), token, &mut || {
                ran = true;
                true
            })
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::LeaseLost { key } if key == foo));
        assert!(!ran);
        assert!(f.log.is_empty());
    }

    #[test]
    fn undecodable_claims_stop_catch_up() {
        let f = fixture();
        let id = agg("1");
        f.log
            .append(
                &id,
                ExpectedVersion::Any,
                vec![UncommittedEvent {
                    event_id: factline_core::EventId::new(),
                    causation_id: CommandId::new(),
                    aggregate_id: id.clone(),
                    aggregate_type: "named".to_string(),
                    event_type: "named.claimed".to_string(),
                    event_version: 1,
                    occurred_at: Utc::now(),
                    payload: json!({ "unexpected": true }),
                }],
            )
            .unwrap();

        assert!(matches!(
            f.coordinator.catch_up(),
            Err(CoordinatorError::Decode { global_position: 0, .. })
        ));
        assert_eq!(f.coordinator.observed_position().unwrap(), None);
    }
}
