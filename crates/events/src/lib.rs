//! Event envelope, messaging traits, and the causal ordering protocol.

pub mod bus;
pub mod causal;
pub mod command;
pub mod envelope;
pub mod event;
pub mod projection;

pub use bus::{EventBus, InMemoryEventBus, PublishError, Subscription};
pub use causal::{CausalOrderError, causal_sort};
pub use command::{Command, CommandContext};
pub use envelope::{
    ActorContext, DeviceContext, EventEnvelope, OrgContext, StoredEnvelope, TraceContext,
};
pub use event::Event;
pub use projection::{OrgScoped, Projection};
