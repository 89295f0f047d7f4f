/// Execute an aggregate command deterministically (no IO, no async).
///
/// 1. **Decide**: `aggregate.handle(command)` produces events without mutation.
/// 2. **Evolve**: each event is applied to the aggregate in order.
///
/// This is the in-memory core of command handling. The dispatcher in
/// `factline-infra` wraps the same two steps with loading from the log,
/// reservations, the optimistic append and idempotency.
pub fn execute<A>(
    aggregate: &mut A,
    command: &A::Command,
) -> Result<Vec<A::Event>, A::Error>
where
    A: factline_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
