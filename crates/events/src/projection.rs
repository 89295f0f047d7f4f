use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Effect, Event, EventEnvelope};

/// A projection builds a read model by folding an ordered event partition.
///
/// ## Fold contract
///
/// `apply` is the fold step `state' = fold(state, event)`. It must be a pure
/// function of the current state and the event: no IO, no clock, no random
/// numbers. Replaying the same events from the same starting state therefore
/// always yields the same state, whatever batch sizes were used to deliver them.
///
/// ## Side effects
///
/// A fold never performs side effects itself. It *describes* them by returning
/// [`Effect`] values; the projector executes each description through the
/// idempotency guard keyed by the originating event id, before it commits the
/// batch. Redelivery after a crash re-runs the fold and re-emits the same
/// descriptions, which the guard then answers from its records.
///
/// ## Persistence
///
/// The whole state is serialized and committed together with the checkpoint,
/// so a read model is never observed ahead of or behind its checkpoint.
pub trait Projection:
    Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Ev: Event + DeserializeOwned;
    type Effect: Effect;

    /// Stable projection name; combined with the partition into the projection id.
    const NAME: &'static str;

    /// Whether events of `aggregate_type` feed this projection. Events of other
    /// aggregate types in the same partition are passed over (the checkpoint
    /// still advances past them).
    fn handles(aggregate_type: &str) -> bool;

    /// Apply a single event, returning the side effects it calls for.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>) -> Vec<Self::Effect>;
}
