//! Command execution pipeline (application-level orchestration).
//!
//! ## Command Execution Flow
//!
//! ```text
//! Command (Received)
//!   ↓
//! 0. Idempotency guard: a recorded outcome for this command id is returned as-is
//!   ↓
//! 1. Load the aggregate stream; an event caused by this command id means it
//!    was already applied
//!   ↓
//! 2. Rehydrate + handle (Validating): pure decision logic produces events
//!   ↓
//! 3. Reserve every claim the events acquire at the coordinator
//!   ↓
//! 4. Renew leases, then append with an exact expected version, fenced by the
//!    leases so a lease lost in between fails the append (Accepted)
//!   ↓
//! 5. Let the coordinator observe the committed events
//! ```
//!
//! Any rejection (domain error, claim held elsewhere) ends in `Rejected`
//! without touching the log. Rejections and acceptances are both recorded by
//! the guard; infrastructure failures and concurrency conflicts are not, so
//! retrying the same command id after one of those runs the pipeline again.
//!
//! Wake-ups for projector workers are not published here: wrap the store in a
//! [`PublishingEventStore`](crate::event_store::PublishingEventStore).

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use factline_core::{Aggregate, AggregateId, CommandId, DomainError, EventId, ExpectedVersion, PartitionId};
use factline_events::{ClaimChange, ClaimKey, Command, Event, UniqueClaims};

use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, CoordinatorError, Reserved};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::idempotency::{GuardError, IdempotencyGuard};

/// Effect kind under which command outcomes are recorded by the guard.
pub const DISPATCH_EFFECT_KIND: &str = "command.dispatch";

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale version, lost lease).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Domain invariant failure, including a unique claim held by another aggregate.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("aggregate not found")]
    NotFound,

    /// Historical payloads (or a recorded outcome) could not be decoded.
    #[error("deserialize failed: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(EventStoreError),

    #[error("idempotency guard unavailable: {0}")]
    GuardUnavailable(String),

    /// Another dispatcher is executing the same command id right now.
    #[error("command {0} is already being processed")]
    InProgress(CommandId),

    #[error(transparent)]
    Coordinator(CoordinatorError),
}

impl DispatchError {
    /// `true` for failures where resubmitting the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Concurrency(_)
            | DispatchError::Store(_)
            | DispatchError::GuardUnavailable(_)
            | DispatchError::InProgress(_)
            | DispatchError::Coordinator(_) => true,
            DispatchError::Validation(_)
            | DispatchError::InvariantViolation(_)
            | DispatchError::NotFound
            | DispatchError::Deserialize(_) => false,
        }
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

impl From<CoordinatorError> for DispatchError {
    fn from(value: CoordinatorError) -> Self {
        match value {
            CoordinatorError::Held { key, holder } => {
                DispatchError::InvariantViolation(format!("{key} is already held by {holder}"))
            }
            CoordinatorError::LeaseLost { key } => {
                DispatchError::Concurrency(format!("lease on {key} was lost before append"))
            }
            other => DispatchError::Coordinator(other),
        }
    }
}

/// Position of one committed event, as reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedRef {
    pub event_id: EventId,
    pub partition: PartitionId,
    pub offset: u64,
}

/// Outcome of an accepted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    /// Stream version after the command (unchanged when it decided no events).
    pub new_version: u64,
    pub events: Vec<CommittedRef>,
    /// `true` when the command had already been applied and nothing was appended now.
    #[serde(skip)]
    pub replayed: bool,
}

impl CommandReceipt {
    fn from_committed(command_id: CommandId, aggregate_id: AggregateId, committed: &[StoredEvent], base: u64) -> Self {
        Self {
            command_id,
            aggregate_id,
            new_version: committed.last().map(|e| e.stream_version).unwrap_or(base),
            events: committed
                .iter()
                .map(|e| CommittedRef {
                    event_id: e.event_id,
                    partition: e.partition,
                    offset: e.offset,
                })
                .collect(),
            replayed: false,
        }
    }
}

/// What the guard remembers about a command: its terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum RecordedOutcome {
    Accepted(CommandReceipt),
    Validation(String),
    InvariantViolation(String),
    NotFound,
}

impl RecordedOutcome {
    /// Terminal errors are recorded; `None` means the error is worth a retry.
    fn rejection(err: &DispatchError) -> Option<Self> {
        match err {
            DispatchError::Validation(m) => Some(RecordedOutcome::Validation(m.clone())),
            DispatchError::InvariantViolation(m) => Some(RecordedOutcome::InvariantViolation(m.clone())),
            DispatchError::NotFound => Some(RecordedOutcome::NotFound),
            _ => None,
        }
    }

    fn into_result(self, replayed: bool) -> Result<CommandReceipt, DispatchError> {
        match self {
            RecordedOutcome::Accepted(mut receipt) => {
                receipt.replayed = receipt.replayed || replayed;
                Ok(receipt)
            }
            RecordedOutcome::Validation(m) => Err(DispatchError::Validation(m)),
            RecordedOutcome::InvariantViolation(m) => Err(DispatchError::InvariantViolation(m)),
            RecordedOutcome::NotFound => Err(DispatchError::NotFound),
        }
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Pin the expected stream version (e.g. the version a client read).
    /// A pinned command is never retried on conflict.
    pub expected_version: Option<ExpectedVersion>,
}

impl DispatchOptions {
    pub fn expect(version: ExpectedVersion) -> Self {
        Self {
            expected_version: Some(version),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub lease_ttl: chrono::Duration,
    /// Attempts per command when appends keep conflicting (at least one).
    pub max_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for DispatcherConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            lease_ttl: cfg.lease_ttl_chrono(),
            max_attempts: cfg.max_command_attempts.max(1),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Both the guard and the coordinator are optional: without a guard,
/// duplicate submissions are still caught by the causation scan of the
/// stream; without a coordinator, claims are not arbitrated at all.
pub struct CommandDispatcher<S> {
    store: S,
    guard: Option<IdempotencyGuard>,
    coordinator: Option<Arc<Coordinator>>,
    config: DispatcherConfig,
}

impl<S: core::fmt::Debug> core::fmt::Debug for CommandDispatcher<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("store", &self.store)
            .field("guarded", &self.guard.is_some())
            .field("coordinated", &self.coordinator.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            guard: None,
            coordinator: None,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_guard(mut self, guard: IdempotencyGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> CommandDispatcher<S>
where
    S: EventStore,
{
    /// Dispatch with default options (expected version taken from the loaded stream).
    pub fn dispatch<A>(
        &self,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl Fn(AggregateId) -> A,
    ) -> Result<CommandReceipt, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: Event + UniqueClaims + Serialize + DeserializeOwned,
    {
        self.dispatch_with(aggregate_type, command, make_aggregate, DispatchOptions::default())
    }

    pub fn dispatch_with<A>(
        &self,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl Fn(AggregateId) -> A,
        options: DispatchOptions,
    ) -> Result<CommandReceipt, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: Event + UniqueClaims + Serialize + DeserializeOwned,
    {
        let Some(guard) = &self.guard else {
            return self.execute(aggregate_type, &command, &make_aggregate, options);
        };

        let command_id = command.command_id();
        let outcome = guard.execute_once(*command_id.as_uuid(), DISPATCH_EFFECT_KIND, |_| {
            match self.execute(aggregate_type, &command, &make_aggregate, options) {
                Ok(receipt) => Ok(RecordedOutcome::Accepted(receipt)),
                Err(err) => RecordedOutcome::rejection(&err).ok_or(err),
            }
        });

        match outcome {
            Ok(execution) => {
                if execution.replayed {
                    debug!(command_id = %command_id, "returning recorded command outcome");
                }
                execution.value.into_result(execution.replayed)
            }
            Err(GuardError::Effect(err)) => Err(err),
            Err(GuardError::InFlight(_)) => Err(DispatchError::InProgress(command_id)),
            Err(GuardError::Unavailable(msg)) => Err(DispatchError::GuardUnavailable(msg)),
            Err(GuardError::Decode(msg)) => Err(DispatchError::Deserialize(msg)),
        }
    }

    fn execute<A>(
        &self,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: &impl Fn(AggregateId) -> A,
        options: DispatchOptions,
    ) -> Result<CommandReceipt, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: Event + UniqueClaims + Serialize + DeserializeOwned,
    {
        let command_id = command.command_id();
        let aggregate_id = command.target_aggregate_id();
        let max_attempts = if options.expected_version.is_some() {
            1
        } else {
            self.config.max_attempts.max(1)
        };

        let mut attempt = 0;
        loop {
            attempt += 1;

            // 1) Load history; the log is the atomic record of an applied command.
            let history = self.store.load_stream(&aggregate_id)?;
            validate_loaded_stream(&aggregate_id, &history)?;
            let current = history.last().map(|e| e.stream_version).unwrap_or(0);

            let caused: Vec<StoredEvent> = history.iter().filter(|e| e.causation_id == command_id).cloned().collect();
            if !caused.is_empty() {
                debug!(command_id = %command_id, aggregate_id = %aggregate_id, "command already applied");
                let mut receipt = CommandReceipt::from_committed(command_id, aggregate_id, &caused, current);
                receipt.replayed = true;
                return Ok(receipt);
            }

            let expected = options.expected_version.unwrap_or(ExpectedVersion::Exact(current));
            if !expected.matches(current) {
                return Err(DispatchError::Concurrency(format!(
                    "expected {expected:?}, stream {aggregate_id} is at version {current}"
                )));
            }

            // 2) Rehydrate and decide.
            let mut aggregate = make_aggregate(aggregate_id.clone());
            apply_history::<A>(&mut aggregate, &history)?;
            let decided = aggregate.handle(command)?;
            if decided.is_empty() {
                return Ok(CommandReceipt::from_committed(command_id, aggregate_id, &[], current));
            }

            let uncommitted = decided
                .iter()
                .map(|ev| UncommittedEvent::from_typed(aggregate_id.clone(), aggregate_type, EventId::new(), command_id, ev))
                .collect::<Result<Vec<_>, _>>()?;

            // 3) Reserve acquired claims.
            let acquired: BTreeSet<ClaimKey> = decided
                .iter()
                .flat_map(UniqueClaims::claim_changes)
                .filter_map(|c| match c {
                    ClaimChange::Acquire(key) => Some(key),
                    ClaimChange::Release(_) => None,
                })
                .collect();
            let leases = self.reserve_all(&aggregate_id, command_id, &acquired)?;

            // 4) Renew, then append under the lease fence.
            let appended = self
                .renew_all(&aggregate_id, command_id, &leases)
                .and_then(|()| self.append_fenced(&aggregate_id, command_id, &leases, expected, uncommitted));

            match appended {
                Ok(committed) => {
                    // 5) Confirm ownership from the log.
                    if let Some(coordinator) = &self.coordinator {
                        if let Err(err) = coordinator.catch_up() {
                            warn!(command_id = %command_id, error = %err, "coordinator catch-up after append failed");
                        }
                    }
                    debug!(
                        command_id = %command_id,
                        aggregate_id = %aggregate_id,
                        events = committed.len(),
                        "command accepted"
                    );
                    return Ok(CommandReceipt::from_committed(command_id, aggregate_id, &committed, current));
                }
                Err(err) => {
                    self.release_all(command_id, &leases);
                    if matches!(err, DispatchError::Concurrency(_)) && attempt < max_attempts {
                        debug!(command_id = %command_id, attempt, error = %err, "retrying after conflict");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn reserve_all(
        &self,
        holder: &AggregateId,
        command_id: CommandId,
        keys: &BTreeSet<ClaimKey>,
    ) -> Result<Vec<ClaimKey>, DispatchError> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(Vec::new());
        };

        let mut leased = Vec::new();
        for key in keys {
            match coordinator.reserve(key, holder, command_id, self.config.lease_ttl) {
                Ok(Reserved::Leased) => leased.push(key.clone()),
                Ok(Reserved::AlreadyOwned) => {}
                Err(err) => {
                    self.release_all(command_id, &leased);
                    if matches!(err, CoordinatorError::Held { .. }) {
                        info!(command_id = %command_id, key = %key, "command rejected: claim held");
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(leased)
    }

    fn renew_all(&self, holder: &AggregateId, command_id: CommandId, leases: &[ClaimKey]) -> Result<(), DispatchError> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(());
        };
        for key in leases {
            if !coordinator.renew(key, holder, command_id, self.config.lease_ttl)? {
                return Err(DispatchError::Concurrency(format!("lease on {key} was lost before append")));
            }
        }
        Ok(())
    }

    fn append_fenced(
        &self,
        aggregate_id: &AggregateId,
        command_id: CommandId,
        leases: &[ClaimKey],
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let coordinator = match &self.coordinator {
            Some(coordinator) if !leases.is_empty() => coordinator,
            _ => return Ok(self.store.append(aggregate_id, expected, events)?),
        };

        let mut events = Some(events);
        let mut appended = None;
        coordinator.commit_fenced(leases, aggregate_id, command_id, &mut || {
            let result = self.store.append(aggregate_id, expected, events.take().unwrap_or_default());
            let ok = result.is_ok();
            appended = Some(result);
            ok
        })?;

        match appended {
            Some(result) => Ok(result?),
            None => Err(DispatchError::Concurrency(format!(
                "append for command {command_id} did not run under its leases"
            ))),
        }
    }

    fn release_all(&self, command_id: CommandId, leases: &[ClaimKey]) {
        let Some(coordinator) = &self.coordinator else {
            return;
        };
        for key in leases {
            if let Err(err) = coordinator.release(key, command_id) {
                warn!(command_id = %command_id, key = %key, error = %err, "lease release failed; it will expire");
            }
        }
    }
}

fn validate_loaded_stream(aggregate_id: &AggregateId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    // A buggy backend must not leak other streams into a rehydration.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if &e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.stream_version <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic stream_version in loaded stream (last={last}, found={})",
                e.stream_version
            ))));
        }
        last = e.stream_version;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event =
            serde_json::from_value(stored.payload.clone()).map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use factline_accounts::{AGGREGATE_TYPE, Account, AccountCommand, AccountEvent, AccountId, ChangeUsername};
    use factline_core::ManualClock;

    use std::sync::Mutex;

    use chrono::DateTime;
    use factline_events::ClaimChange;

    use super::*;
    use crate::coordinator::{
        ClaimConflict, Fenced, InMemoryReservationStore, Reservation, ReservationStore, ReserveOutcome,
    };
    use crate::event_store::InMemoryEventStore;
    use crate::idempotency::InMemoryIdempotencyStore;

    type Stall = Box<dyn FnOnce() + Send>;

    /// Reservations that run `stall` once, right before the first fenced commit.
    #[derive(Default)]
    struct StallBeforeCommit {
        inner: InMemoryReservationStore,
        stall: Mutex<Option<Stall>>,
    }

    impl ReservationStore for StallBeforeCommit {
        fn try_reserve(
            &self,
            key: &ClaimKey,
            holder: &AggregateId,
            token: CommandId,
            expires_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<ReserveOutcome, CoordinatorError> {
            self.inner.try_reserve(key, holder, token, expires_at, now)
        }

        fn renew(
            &self,
            key: &ClaimKey,
            holder: &AggregateId,
            token: CommandId,
            expires_at: DateTime<Utc>,
        ) -> Result<bool, CoordinatorError> {
            self.inner.renew(key, holder, token, expires_at)
        }

        fn release(&self, key: &ClaimKey, token: CommandId) -> Result<(), CoordinatorError> {
            self.inner.release(key, token)
        }

        fn commit_fenced(
            &self,
            keys: &[ClaimKey],
            holder: &AggregateId,
            token: CommandId,
            now: DateTime<Utc>,
            commit: &mut dyn FnMut() -> bool,
        ) -> Result<Fenced, CoordinatorError> {
            let stall = self.stall.lock().unwrap().take();
            if let Some(stall) = stall {
                stall();
            }
            self.inner.commit_fenced(keys, holder, token, now, commit)
        }

        fn apply_committed(
            &self,
            global_position: u64,
            holder: &AggregateId,
            changes: &[ClaimChange],
        ) -> Result<Vec<ClaimConflict>, CoordinatorError> {
            self.inner.apply_committed(global_position, holder, changes)
        }

        fn observed_position(&self) -> Result<Option<u64>, CoordinatorError> {
            self.inner.observed_position()
        }

        fn get(&self, key: &ClaimKey) -> Result<Option<Reservation>, CoordinatorError> {
            self.inner.get(key)
        }

        fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
            self.inner.purge_expired(now)
        }
    }

    fn change(account: &str, name: &str) -> AccountCommand {
        AccountCommand::ChangeUsername(ChangeUsername {
            command_id: CommandId::new(),
            account_id: AccountId::parse(account).unwrap(),
            username: name.to_string(),
            occurred_at: Utc::now(),
        })
    }

    fn make(id: AggregateId) -> Account {
        Account::empty(AccountId::new(id))
    }

    fn dispatcher() -> CommandDispatcher<Arc<InMemoryEventStore>> {
        CommandDispatcher::new(Arc::new(InMemoryEventStore::new(4)))
    }

    #[test]
    fn accepted_command_appends_and_reports_positions() {
        let d = dispatcher();
        let receipt = d.dispatch(AGGREGATE_TYPE, change("1", "alice"), make).unwrap();

        assert_eq!(receipt.new_version, 1);
        assert_eq!(receipt.events.len(), 1);
        assert_eq!(receipt.events[0].offset, 0);
        assert!(!receipt.replayed);

        let stream = d.store().load_stream(&receipt.aggregate_id).unwrap();
        let ev: AccountEvent = serde_json::from_value(stream[0].payload.clone()).unwrap();
        assert!(matches!(ev, AccountEvent::UsernameChanged(e) if e.username.as_str() == "alice"));
    }

    #[test]
    fn resubmitting_a_command_id_appends_nothing() {
        let d = dispatcher();
        let cmd = change("1", "alice");
        let first = d.dispatch(AGGREGATE_TYPE, cmd.clone(), make).unwrap();
        let second = d.dispatch(AGGREGATE_TYPE, cmd, make).unwrap();

        assert!(second.replayed);
        assert_eq!(second.events, first.events);
        assert_eq!(d.store().len(), 1);
    }

    #[test]
    fn domain_rejections_leave_the_log_untouched() {
        let d = dispatcher();
        let err = d.dispatch(AGGREGATE_TYPE, change("1", "x"), make).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(!err.is_retryable());
        assert!(d.store().is_empty());
    }

    #[test]
    fn pinned_stale_version_is_a_concurrency_error() {
        let d = dispatcher();
        d.dispatch(AGGREGATE_TYPE, change("1", "alice"), make).unwrap();

        let err = d
            .dispatch_with(AGGREGATE_TYPE, change("1", "bob"), make, DispatchOptions::expect(ExpectedVersion::NoStream))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Concurrency(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn guard_replays_recorded_rejections() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let guard = IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            clock,
            chrono::Duration::seconds(30),
        );
        let d = dispatcher().with_guard(guard);

        let cmd = change("1", "x");
        let first = d.dispatch(AGGREGATE_TYPE, cmd.clone(), make).unwrap_err();
        let second = d.dispatch(AGGREGATE_TYPE, cmd, make).unwrap_err();
        assert!(matches!(first, DispatchError::Validation(_)));
        assert!(matches!(second, DispatchError::Validation(_)));
    }

    #[test]
    fn coordinator_rejects_a_name_owned_elsewhere() {
        let log = Arc::new(InMemoryEventStore::new(4));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = Arc::new(
            Coordinator::new(Arc::new(InMemoryReservationStore::new()), log.clone(), clock)
                .with_claims::<AccountEvent>(AGGREGATE_TYPE),
        );
        let d = CommandDispatcher::new(log).with_coordinator(coordinator.clone());

        d.dispatch(AGGREGATE_TYPE, change("1", "foo"), make).unwrap();
        let err = d.dispatch(AGGREGATE_TYPE, change("2", "foo"), make).unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_)));

        d.dispatch(AGGREGATE_TYPE, change("1", "bar"), make).unwrap();
        d.dispatch(AGGREGATE_TYPE, change("2", "foo"), make).unwrap();
        assert_eq!(
            coordinator.owner_of(&ClaimKey::new("username", "foo")).unwrap(),
            Some(AggregateId::new("2").unwrap())
        );
    }

    #[test]
    fn an_append_stalled_past_its_lease_loses_to_the_next_claimant() {
        let log = Arc::new(InMemoryEventStore::new(4));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let reservations = Arc::new(StallBeforeCommit::default());
        let coordinator = Arc::new(
            Coordinator::new(reservations.clone(), log.clone(), clock.clone())
                .with_claims::<AccountEvent>(AGGREGATE_TYPE),
        );
        let config = DispatcherConfig {
            lease_ttl: chrono::Duration::seconds(30),
            max_attempts: 3,
        };
        let d = Arc::new(
            CommandDispatcher::new(log.clone())
                .with_coordinator(coordinator.clone())
                .with_config(config),
        );

        // While user 1 sits between renewing and appending, its lease expires
        // and user 2 claims the same name.
        let rival_won = Arc::new(Mutex::new(None));
        let (rival, seen, stalled_clock) = (d.clone(), rival_won.clone(), clock.clone());
        *reservations.stall.lock().unwrap() = Some(Box::new(move || {
            stalled_clock.advance(chrono::Duration::seconds(31));
            let outcome = rival.dispatch(AGGREGATE_TYPE, change("2", "foo"), make);
            *seen.lock().unwrap() = Some(outcome.is_ok());
        }));

        let err = d.dispatch(AGGREGATE_TYPE, change("1", "foo"), make).unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_) | DispatchError::Concurrency(_)));
        assert_eq!(*rival_won.lock().unwrap(), Some(true));

        let owners: Vec<AggregateId> = log
            .read_all(None, 100)
            .unwrap()
            .into_iter()
            .filter(|e| {
                let ev: AccountEvent = serde_json::from_value(e.payload.clone()).unwrap();
                matches!(ev, AccountEvent::UsernameChanged(c) if c.username.as_str() == "foo")
            })
            .map(|e| e.aggregate_id)
            .collect();
        assert_eq!(owners, vec![AggregateId::new("2").unwrap()]);
        assert_eq!(
            coordinator.owner_of(&ClaimKey::new("username", "foo")).unwrap(),
            Some(AggregateId::new("2").unwrap())
        );
    }
}
