use chrono::{DateTime, Utc};

/// A domain event: an immutable fact describing something that already happened.
///
/// Domain events are modelled as a closed enum per aggregate so every fold has
/// to match all variants; adding a variant is a compile-time obligation for
/// every projection that consumes it.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "account.username_changed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
