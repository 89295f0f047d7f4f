//! Engine infrastructure: the event log, command dispatch, projectors,
//! idempotency, cross-partition coordination and their storage backends.
//!
//! Every store has an in-memory implementation; the Postgres backend is
//! behind the `postgres` feature.

pub mod command_dispatcher;
pub mod config;
pub mod coordinator;
pub mod event_store;
pub mod idempotency;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod projections;
pub mod projector;
pub mod retry;
pub mod workers;

pub use command_dispatcher::{
    CommandDispatcher, CommandReceipt, CommittedRef, DispatchError, DispatchOptions, DispatcherConfig,
};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{Coordinator, CoordinatorError, PartitionAssignment, Reserved};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, PublishingEventStore, StoredEvent};
pub use idempotency::{IdempotencyGuard, InMemoryIdempotencyStore};
pub use projector::{BatchOutcome, Committed, EffectDispatcher, ProjectionReader, Projector, ProjectorError};
pub use retry::Backoff;

#[cfg(test)]
mod integration_tests;
