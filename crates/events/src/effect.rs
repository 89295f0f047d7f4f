//! Side-effect descriptions emitted by projection folds.

use serde::{Deserialize, Serialize};

/// Description of an externally visible side effect (outbound notification,
/// call into another system).
///
/// The pair `(originating event id, kind())` is the idempotency key: a given
/// event triggers a given kind of effect at most once, no matter how many
/// times the event is redelivered.
pub trait Effect: Clone + core::fmt::Debug + Serialize + Send + Sync + 'static {
    /// Stable effect kind (e.g. "notify.username_changed").
    fn kind(&self) -> &'static str;
}

/// Effect type for projections that never call out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoEffect {}

impl Effect for NoEffect {
    fn kind(&self) -> &'static str {
        match *self {}
    }
}
