//! Core domain kernel: identifiers, clock capability, invariants, aggregate traits.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;
pub mod invariant;
pub mod values;

pub use aggregate::{Aggregate, AggregateRoot, StateMachine, execute};
pub use clock::{Clock, FixedClock, SystemClock, ensure_occurred_at_plausible};
pub use error::{DomainError, DomainResult};
pub use id::{
    AggregateId, CorrelationId, EventId, FacilityId, OrganizationId, PerformerId, SyncBatchId,
};
pub use invariant::InvariantCode;
pub use values::{AggregateKind, AudienceTag, ConnectionStatus, PerformerRole, Visibility};
