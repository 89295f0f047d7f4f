//! At-most-once execution of side effects keyed by `(id, effect kind)`.
//!
//! Two callers share this machinery:
//! - the command dispatcher, keyed by command id (`"command.dispatch"`)
//! - projectors, keyed by the id of the event that described the effect
//!
//! The store is the source of truth. When it cannot be reached the guard
//! fails with a retryable error instead of running the effect unguarded.

pub mod guard;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use guard::{Execution, GuardError, IdempotencyGuard};
#[cfg(feature = "postgres")]
pub use postgres::PostgresIdempotencyStore;
pub use store::{
    CheckOutcome, EffectKey, IdempotencyError, IdempotencyRecord, IdempotencyStore,
    InMemoryIdempotencyStore,
};
