use factline_core::{AggregateId, CommandId};

/// A command targets a specific aggregate (command abstraction).
///
/// Commands represent **intent**: a request that something should happen,
/// subject to validation and possible rejection. They are **transient** (never
/// persisted); the events they produce carry their id as `causation_id`.
///
/// ## Identity
///
/// `command_id()` is the idempotency key. Submitting the same command id twice
/// within the idempotency window must not append a second set of events; the
/// dispatcher returns the outcome recorded for the first submission.
///
/// ## Aggregate Targeting
///
/// `target_aggregate_id()` names the single stream the command may append to.
/// Commands for different aggregates run concurrently; commands for the same
/// aggregate serialize through the stream's expected version.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn command_id(&self) -> CommandId;

    fn target_aggregate_id(&self) -> AggregateId;
}
