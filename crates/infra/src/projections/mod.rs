//! Projection implementations (read model builders) and their persistence.
//!
//! Projections consume account events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: reconstructed from the log at any time
//! - **Partition-local**: one instance per log partition
//! - **Idempotent**: committed together with their checkpoint

pub mod accounts;
pub mod checkpoint;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod replay;
pub mod username_index;

pub use accounts::{AccountNotification, AccountReadState, AccountsView, NOTIFY_USERNAME_CHANGED};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, CommittedState, InMemoryCheckpointStore};
#[cfg(feature = "postgres")]
pub use postgres::PostgresCheckpointStore;
pub use replay::{ReplayControl, ReplayError, ReplayHandle, ReplayPhase, ReplayProgress, rebuild, spawn_rebuild};
pub use username_index::UsernameIndex;
