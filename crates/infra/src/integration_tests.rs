//! Integration tests for the full pipeline.
//!
//! Tests: Command → EventStore → Projector → ReadModel (+ Coordinator, guard)
//!
//! Verifies:
//! - Commands produce events that update read models correctly
//! - Duplicate command ids and replays never duplicate events or effects
//! - Optimistic concurrency conflicts are detected
//! - Usernames stay globally unique across partitions

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use factline_accounts::{
        AGGREGATE_TYPE, Account, AccountCommand, AccountEvent, AccountId, ChangeUsername, Username, UsernameChanged,
    };
    use factline_core::{AggregateId, CommandId, EventId, ExpectedVersion, ManualClock, Partitioner, PartitionId};
    use factline_events::ClaimKey;

    use crate::command_dispatcher::{CommandDispatcher, CommandReceipt, DispatchError, DispatchOptions};
    use crate::coordinator::{Coordinator, InMemoryReservationStore};
    use crate::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
    use crate::idempotency::{IdempotencyGuard, InMemoryIdempotencyStore};
    use crate::projections::{
        AccountNotification, AccountsView, CheckpointStore, InMemoryCheckpointStore, UsernameIndex,
    };
    use crate::projector::{ProjectionReader, Projector, RecordingDispatcher};

    const PARTITIONS: u32 = 4;

    struct Engine {
        log: Arc<InMemoryEventStore>,
        clock: Arc<ManualClock>,
        guard: IdempotencyGuard,
        checkpoints: Arc<InMemoryCheckpointStore>,
        coordinator: Arc<Coordinator>,
    }

    impl Engine {
        fn new() -> Self {
            let log = Arc::new(InMemoryEventStore::new(PARTITIONS));
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let guard = IdempotencyGuard::new(
                Arc::new(InMemoryIdempotencyStore::new()),
                clock.clone(),
                Duration::seconds(30),
            );
            let coordinator = Arc::new(
                Coordinator::new(Arc::new(InMemoryReservationStore::new()), log.clone(), clock.clone())
                    .with_claims::<AccountEvent>(AGGREGATE_TYPE),
            );
            Self {
                log,
                clock,
                guard,
                checkpoints: Arc::new(InMemoryCheckpointStore::new()),
                coordinator,
            }
        }

        fn dispatcher(&self) -> CommandDispatcher<Arc<InMemoryEventStore>> {
            CommandDispatcher::new(self.log.clone())
                .with_guard(self.guard.clone())
                .with_coordinator(self.coordinator.clone())
        }

        fn naive_dispatcher(&self) -> CommandDispatcher<Arc<InMemoryEventStore>> {
            CommandDispatcher::new(self.log.clone())
        }

        fn partition_of(&self, account: &str) -> PartitionId {
            Partitioner::new(PARTITIONS).partition_for(&AggregateId::new(account).unwrap())
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

    #[test]
    fn change_username_flows_to_the_read_model_and_survives_a_rewind() {
        let engine = Engine::new();
        let receipt = engine
            .dispatcher()
            .dispatch(AGGREGATE_TYPE, change("1", "alice"), make)
            .unwrap();
        assert_eq!(receipt.events.len(), 1);
        assert_eq!(receipt.events[0].offset, 0);

        let partition = receipt.events[0].partition;
        let notifications = Arc::new(RecordingDispatcher::<AccountNotification>::new());
        let mut projector = Projector::<AccountsView>::new(partition, engine.log.clone(), engine.checkpoints.clone())
            .with_effects(engine.guard.clone(), notifications.clone());
        projector.catch_up().unwrap();

        let reader = ProjectionReader::<AccountsView>::new(engine.checkpoints.clone());
        let first = reader.load(partition).unwrap();
        let row = first.state.get(&AccountId::parse("1").unwrap()).unwrap();
        assert_eq!(row.name.as_deref(), Some("alice"));
        assert!(row.active);
        assert_eq!(first.checkpoint, Some(0));

        // Crash between state and checkpoint writes: the checkpoint falls back.
        engine.checkpoints.rewind(projector.projection_id(), None).unwrap();
        projector.invalidate();
        projector.catch_up().unwrap();

        let second = reader.load(partition).unwrap();
        assert_eq!(second, first);
        assert_eq!(notifications.calls().len(), 1);
    }

    #[test]
    fn the_same_command_id_twice_appends_one_event() {
        let engine = Engine::new();
        let dispatcher = engine.dispatcher();
        let cmd = change("1", "alice");

        let first = dispatcher.dispatch(AGGREGATE_TYPE, cmd.clone(), make).unwrap();
        let second = dispatcher.dispatch(AGGREGATE_TYPE, cmd, make).unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.events, second.events);
        assert_eq!(engine.log.len(), 1);
    }

    #[test]
    fn concurrent_commands_with_a_stale_version_admit_one_winner() {
        let engine = Engine::new();
        engine
            .dispatcher()
            .dispatch(AGGREGATE_TYPE, change("1", "alice"), make)
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let outcomes: Vec<_> = ["bob", "carol"]
            .into_iter()
            .map(|name| {
                let dispatcher = engine.naive_dispatcher();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    dispatcher.dispatch_with(
                        AGGREGATE_TYPE,
                        change("1", name),
                        make,
                        DispatchOptions::expect(ExpectedVersion::Exact(1)),
                    )
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        let won = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(won, 1);
        assert!(
            outcomes
                .iter()
                .any(|o| matches!(o, Err(DispatchError::Concurrency(_))))
        );
        assert_eq!(engine.log.len(), 2);
    }

    #[test]
    fn per_partition_checks_admit_duplicate_owners() {
        let engine = Engine::new();
        let (p1, p2) = (engine.partition_of("1"), engine.partition_of("2"));
        assert_ne!(p1, p2);

        let dispatcher = engine.naive_dispatcher();
        dispatcher.dispatch(AGGREGATE_TYPE, change("1", "foo"), make).unwrap();
        dispatcher.dispatch(AGGREGATE_TYPE, change("2", "foo"), make).unwrap();

        let owners: Vec<_> = [p1, p2]
            .into_iter()
            .map(|p| {
                let mut index = Projector::<UsernameIndex>::new(p, engine.log.clone(), engine.checkpoints.clone());
                index.catch_up().unwrap();
                index.committed().unwrap().state.owner_of("foo").cloned()
            })
            .collect();

        assert_eq!(
            owners,
            vec![Some(AccountId::parse("1").unwrap()), Some(AccountId::parse("2").unwrap())]
        );
    }

    /// Users 1 and 2 ask for "foo" at the same moment, from different partitions.
    fn claim_foo_concurrently(engine: &Engine, coordinated: bool) -> Vec<Result<CommandReceipt, DispatchError>> {
        let barrier = Arc::new(Barrier::new(2));
        ["1", "2"]
            .into_iter()
            .map(|account| {
                let dispatcher = if coordinated {
                    engine.dispatcher()
                } else {
                    engine.naive_dispatcher()
                };
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    dispatcher.dispatch(AGGREGATE_TYPE, change(account, "foo"), make)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    }

    #[test]
    fn concurrent_claims_through_the_coordinator_admit_one_owner() {
        for _ in 0..25 {
            let engine = Engine::new();
            assert_ne!(engine.partition_of("1"), engine.partition_of("2"));

            let outcomes = claim_foo_concurrently(&engine, true);
            let winners: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1);
            assert!(
                outcomes
                    .iter()
                    .any(|o| matches!(o, Err(DispatchError::InvariantViolation(_))))
            );
            assert_eq!(engine.log.len(), 1);

            let foo = Username::parse("foo").unwrap().claim_key();
            assert_eq!(engine.coordinator.owner_of(&foo).unwrap(), Some(winners[0].aggregate_id.clone()));
        }
    }

    #[test]
    fn concurrent_claims_without_the_coordinator_both_commit() {
        let engine = Engine::new();
        let outcomes = claim_foo_concurrently(&engine, false);
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(engine.log.len(), 2);

        let owners: Vec<_> = ["1", "2"]
            .into_iter()
            .map(|account| {
                let mut index = Projector::<UsernameIndex>::new(
                    engine.partition_of(account),
                    engine.log.clone(),
                    engine.checkpoints.clone(),
                );
                index.catch_up().unwrap();
                index.committed().unwrap().state.owner_of("foo").cloned()
            })
            .collect();
        assert_eq!(
            owners,
            vec![Some(AccountId::parse("1").unwrap()), Some(AccountId::parse("2").unwrap())]
        );
    }

    #[test]
    fn coordinator_keeps_usernames_globally_unique() {
        let engine = Engine::new();
        let dispatcher = engine.dispatcher();

        dispatcher.dispatch(AGGREGATE_TYPE, change("1", "foo"), make).unwrap();
        let rejected = dispatcher.dispatch(AGGREGATE_TYPE, change("2", "foo"), make).unwrap_err();
        assert!(matches!(rejected, DispatchError::InvariantViolation(_)));

        dispatcher.dispatch(AGGREGATE_TYPE, change("1", "bar"), make).unwrap();
        dispatcher.dispatch(AGGREGATE_TYPE, change("2", "foo"), make).unwrap();

        let foo = Username::parse("foo").unwrap().claim_key();
        let bar = Username::parse("bar").unwrap().claim_key();
        assert_eq!(engine.coordinator.owner_of(&foo).unwrap(), Some(AggregateId::new("2").unwrap()));
        assert_eq!(engine.coordinator.owner_of(&bar).unwrap(), Some(AggregateId::new("1").unwrap()));
    }

    #[test]
    fn an_abandoned_lease_blocks_until_it_expires() {
        let engine = Engine::new();
        let foo = ClaimKey::new("username", "foo");

        // A command that reserved and then died before appending.
        engine
            .coordinator
            .reserve(&foo, &AggregateId::new("1").unwrap(), CommandId::new(), Duration::seconds(30))
            .unwrap();

        let dispatcher = engine.dispatcher();
        let blocked = dispatcher.dispatch(AGGREGATE_TYPE, change("2", "foo"), make).unwrap_err();
        assert!(matches!(blocked, DispatchError::InvariantViolation(_)));

        engine.clock.advance(Duration::seconds(31));
        dispatcher.dispatch(AGGREGATE_TYPE, change("2", "foo"), make).unwrap();
        assert_eq!(engine.coordinator.owner_of(&foo).unwrap(), Some(AggregateId::new("2").unwrap()));
    }

    #[test]
    fn a_restarted_projector_resumes_from_its_checkpoint() {
        let engine = Engine::new();
        let dispatcher = engine.naive_dispatcher();
        for (i, name) in ["ann", "ben", "cat", "dan", "eve"].into_iter().enumerate() {
            let account = format!("acct-{i}");
            dispatcher.dispatch(AGGREGATE_TYPE, change(&account, name), make).unwrap();
        }

        for p in 0..PARTITIONS {
            let partition = PartitionId::new(p);
            let mut reference = Projector::<AccountsView>::new(
                partition,
                engine.log.clone(),
                Arc::new(InMemoryCheckpointStore::new()),
            );
            reference.catch_up().unwrap();

            // First process: one batch, then it "crashes".
            let mut first = Projector::<AccountsView>::new(partition, engine.log.clone(), engine.checkpoints.clone())
                .with_batch_size(1);
            first.run_batch().unwrap();
            drop(first);

            let mut second = Projector::<AccountsView>::new(partition, engine.log.clone(), engine.checkpoints.clone())
                .with_batch_size(1);
            second.catch_up().unwrap();
            assert_eq!(second.committed().unwrap(), reference.committed().unwrap());
        }
    }

    fn single_partition_log(renames: &[(u8, u8)]) -> Arc<InMemoryEventStore> {
        let log = Arc::new(InMemoryEventStore::new(1));
        for (account, name) in renames {
            let id = AggregateId::new(format!("acct-{account}")).unwrap();
            let event = AccountEvent::UsernameChanged(UsernameChanged {
                account_id: AccountId::new(id.clone()),
                username: Username::parse(&format!("name_{name}")).unwrap(),
                previous: None,
                occurred_at: Utc::now(),
            });
            let e = UncommittedEvent::from_typed(id.clone(), AGGREGATE_TYPE, EventId::new(), CommandId::new(), &event)
                .unwrap();
            log.append(&id, ExpectedVersion::Any, vec![e]).unwrap();
        }
        log
    }

    fn fold_with(log: &Arc<InMemoryEventStore>, batch_size: usize) -> (Option<u64>, AccountsView) {
        let mut projector =
            Projector::<AccountsView>::new(PartitionId::new(0), log.clone(), Arc::new(InMemoryCheckpointStore::new()))
                .with_batch_size(batch_size);
        projector.catch_up().unwrap();
        let committed = projector.committed().unwrap();
        (committed.checkpoint, committed.state.clone())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn replay_is_independent_of_batch_size(
            renames in prop::collection::vec((0u8..5, 0u8..10), 0..40),
            batch_size in 1usize..9,
        ) {
            let log = single_partition_log(&renames);
            prop_assert_eq!(fold_with(&log, batch_size), fold_with(&log, 1));
        }

        #[test]
        fn resuming_from_a_checkpoint_twice_equals_once(
            renames in prop::collection::vec((0u8..5, 0u8..10), 1..40),
            cut in 0usize..40,
        ) {
            let log = single_partition_log(&renames);
            let cut = (cut % renames.len()) as u64;
            let checkpoints = Arc::new(InMemoryCheckpointStore::new());
            let mut projector = Projector::<AccountsView>::new(PartitionId::new(0), log.clone(), checkpoints.clone());

            projector.catch_up().unwrap();
            let once = projector.committed().unwrap().clone();

            checkpoints.rewind(projector.projection_id(), Some(cut)).unwrap();
            projector.invalidate();
            projector.catch_up().unwrap();
            projector.catch_up().unwrap();

            prop_assert_eq!(projector.committed().unwrap(), &once);
        }
    }
}
