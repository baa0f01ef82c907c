//! Aggregate root traits for event-sourced domain models.

use crate::clock::Clock;
use crate::values::AggregateKind;

/// Aggregate root marker + minimal interface.
///
/// This is intentionally small so domain crates can decide how they model
/// state transitions without bringing in any infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state; equals the
    /// number of events applied (the stream revision).
    fn version(&self) -> u64;
}

/// Event-sourced aggregate: pure decision + total evolution.
///
/// `decide` reads only state and command; the injected clock exists solely to
/// reject implausible business timestamps. `apply` must be deterministic and
/// total over every event the aggregate can emit. Neither function performs IO.
pub trait Aggregate: AggregateRoot {
    type Command;
    type Event;
    type Error;

    /// Stream kind this aggregate lives on.
    const KIND: AggregateKind;

    /// Evolve state with one event. Infallible; rejected transitions never
    /// reach `apply` because `decide` refuses to emit them.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events (0..n) a command produces, or refuse it.
    fn decide(&self, command: &Self::Command, clock: &dyn Clock)
    -> Result<Vec<Self::Event>, Self::Error>;
}

/// Transition admissibility, separate from command handling.
///
/// Conflict resolution replays contested events against the state machine
/// without a command in hand: it asks whether an already-emitted event is
/// permitted from the current state. `decide` and `permits` must agree on
/// the transition table.
pub trait StateMachine: Aggregate {
    fn permits(&self, event: &Self::Event) -> Result<(), crate::error::DomainError>;
}

/// Execute a command and fold the produced events back into the aggregate.
///
/// Deterministic, no IO. This is the unit-test entry point; the full
/// pipeline (persistence, metadata stamping, publication) lives in the
/// command handler.
pub fn execute<A>(
    aggregate: &mut A,
    command: &A::Command,
    clock: &dyn Clock,
) -> Result<Vec<A::Event>, A::Error>
where
    A: Aggregate,
{
    let events = aggregate.decide(command, clock)?;
    for ev in &events {
        aggregate.apply(ev);
    }
    Ok(events)
}
