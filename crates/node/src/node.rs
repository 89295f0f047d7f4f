//! One engine process: the stores, the command dispatcher and the projector
//! pools of this instance's partitions.
//!
//! Stores are in-memory unless `DATABASE_URL` is set and the binary was built
//! with the `postgres` feature.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use factline_accounts::{AGGREGATE_TYPE, AccountEvent};
use factline_core::{Clock, SystemClock};
use factline_events::{EventEnvelope, InMemoryEventBus, Projection};
use factline_infra::coordinator::{InMemoryReservationStore, ReservationStore};
use factline_infra::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use factline_infra::projections::{AccountNotification, AccountsView, CheckpointStore, InMemoryCheckpointStore, UsernameIndex};
use factline_infra::projector::projection_id;
use factline_infra::workers::{ProjectorPool, WorkerExit, WorkerSettings};
use factline_infra::{
    CommandDispatcher, Coordinator, DispatcherConfig, EffectDispatcher, EngineConfig, EventStore, IdempotencyGuard,
    InMemoryEventStore, PartitionAssignment, Projector, PublishingEventStore,
};

pub type WakeBus = InMemoryEventBus<EventEnvelope<JsonValue>>;

struct Backends {
    log: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    reservations: Arc<dyn ReservationStore>,
    #[cfg(feature = "postgres")]
    runtime: Option<tokio::runtime::Runtime>,
}

fn in_memory_backends(config: &EngineConfig) -> Backends {
    Backends {
        log: Arc::new(InMemoryEventStore::new(config.partitions)),
        checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        reservations: Arc::new(InMemoryReservationStore::new()),
        #[cfg(feature = "postgres")]
        runtime: None,
    }
}

#[cfg(feature = "postgres")]
fn postgres_backends(config: &EngineConfig, url: &str) -> anyhow::Result<Backends> {
    use factline_infra::coordinator::PostgresReservationStore;
    use factline_infra::event_store::PostgresEventStore;
    use factline_infra::idempotency::PostgresIdempotencyStore;
    use factline_infra::postgres::PgContext;
    use factline_infra::projections::PostgresCheckpointStore;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the database runtime")?;
    let pool = runtime
        .block_on(sqlx::postgres::PgPoolOptions::new().max_connections(8).connect(url))
        .context("failed to connect to DATABASE_URL")?;
    let ctx = PgContext::new(pool, runtime.handle().clone());
    ctx.migrate().context("failed to create engine tables")?;
    info!(partitions = config.partitions, "using postgres stores");

    Ok(Backends {
        log: Arc::new(PostgresEventStore::new(ctx.clone(), config.partitions)),
        checkpoints: Arc::new(PostgresCheckpointStore::new(ctx.clone())),
        idempotency: Arc::new(PostgresIdempotencyStore::new(ctx.clone())),
        reservations: Arc::new(PostgresReservationStore::new(ctx)),
        runtime: Some(runtime),
    })
}

fn open_backends(config: &EngineConfig) -> anyhow::Result<Backends> {
    match config.database_url.as_deref() {
        #[cfg(feature = "postgres")]
        Some(url) => postgres_backends(config, url),
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            warn!("DATABASE_URL is set but postgres support is not compiled in; using in-memory stores");
            Ok(in_memory_backends(config))
        }
        None => {
            info!(partitions = config.partitions, "using in-memory stores");
            Ok(in_memory_backends(config))
        }
    }
}

/// Wired engine for one process.
pub struct Node {
    config: EngineConfig,
    log: Arc<dyn EventStore>,
    bus: Arc<WakeBus>,
    checkpoints: Arc<dyn CheckpointStore>,
    guard: IdempotencyGuard,
    coordinator: Arc<Coordinator>,
    // Dropped last: the Postgres stores block on it.
    #[cfg(feature = "postgres")]
    _runtime: Option<tokio::runtime::Runtime>,
}

impl Node {
    pub fn open(config: EngineConfig) -> anyhow::Result<Self> {
        let backends = open_backends(&config)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let bus = Arc::new(WakeBus::new());
        let log: Arc<dyn EventStore> = Arc::new(PublishingEventStore::new(backends.log, bus.clone()));
        let guard = IdempotencyGuard::new(backends.idempotency, clock.clone(), config.idempotency_pending_ttl_chrono());
        let coordinator = Arc::new(
            Coordinator::new(backends.reservations, log.clone(), clock)
                .with_claims::<AccountEvent>(AGGREGATE_TYPE)
                .with_batch_size(config.batch_size),
        );

        // Pick up ownership changes committed before this process started.
        let applied = coordinator.catch_up().context("coordinator catch-up failed")?;
        info!(applied, "coordinator caught up");

        Ok(Self {
            config,
            log,
            bus,
            checkpoints: backends.checkpoints,
            guard,
            coordinator,
            #[cfg(feature = "postgres")]
            _runtime: backends.runtime,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn EventStore> {
        &self.log
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> CommandDispatcher<Arc<dyn EventStore>> {
        CommandDispatcher::new(self.log.clone())
            .with_guard(self.guard.clone())
            .with_coordinator(self.coordinator.clone())
            .with_config(DispatcherConfig::from(&self.config))
    }

    fn projector<P: Projection>(&self, partition: factline_core::PartitionId) -> Projector<P> {
        Projector::<P>::new(partition, self.log.clone(), self.checkpoints.clone()).with_batch_size(self.config.batch_size)
    }

    /// Start the accounts view (with notifications) and the username index
    /// for every partition of `assignment`.
    pub fn start_projectors(
        &self,
        assignment: &PartitionAssignment,
        notifier: Arc<dyn EffectDispatcher<AccountNotification>>,
    ) -> std::io::Result<Projectors> {
        let settings = WorkerSettings::from(&self.config);
        let accounts = ProjectorPool::spawn(assignment, Some(self.bus.clone()), settings, |partition| {
            self.projector::<AccountsView>(partition)
                .with_effects(self.guard.clone(), notifier.clone())
        })?;
        let usernames = match ProjectorPool::spawn(assignment, Some(self.bus.clone()), settings, |partition| {
            self.projector::<UsernameIndex>(partition)
        }) {
            Ok(pool) => pool,
            Err(err) => {
                accounts.shutdown();
                return Err(err);
            }
        };
        Ok(Projectors { accounts, usernames })
    }

    /// Whether every projection of `assignment` has reached its partition head.
    pub fn caught_up(&self, assignment: &PartitionAssignment) -> anyhow::Result<bool> {
        for &partition in &assignment.partitions {
            let head = self.log.head(partition)?;
            for id in [projection_id::<AccountsView>(partition), projection_id::<UsernameIndex>(partition)] {
                if self.checkpoints.get(&id)? != head {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Poll until [`Node::caught_up`] holds or `timeout` passes.
    pub fn wait_caught_up(&self, assignment: &PartitionAssignment, timeout: Duration) -> anyhow::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.caught_up(assignment)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Drop completed idempotency records past retention and expired leases.
    pub fn housekeeping(&self) -> anyhow::Result<()> {
        let records = self.guard.purge(self.config.idempotency_retention_chrono())?;
        let leases = self.coordinator.purge_expired()?;
        info!(records, leases, "housekeeping done");
        Ok(())
    }
}

/// Running projector pools of one instance.
#[derive(Debug)]
pub struct Projectors {
    accounts: ProjectorPool,
    usernames: ProjectorPool,
}

impl Projectors {
    pub fn len(&self) -> usize {
        self.accounts.len() + self.usernames.len()
    }

    /// Stop every worker; returns how many ended other than by shutdown.
    pub fn shutdown(self) -> usize {
        let mut abnormal = 0;
        for (name, exit) in self.accounts.shutdown().into_iter().chain(self.usernames.shutdown()) {
            match exit {
                WorkerExit::Shutdown => {}
                other => {
                    warn!(worker = %name, exit = ?other, "projector worker ended abnormally");
                    abnormal += 1;
                }
            }
        }
        abnormal
    }
}
