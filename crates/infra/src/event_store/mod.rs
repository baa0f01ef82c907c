pub mod in_memory;
pub mod query;
#[path = "trait.rs"]
pub mod r#trait;

#[cfg(test)]
pub(crate) mod test_support;

pub use in_memory::InMemoryEventStore;
pub use query::{EventFilter, Sequenced};
pub use r#trait::{AppendOutcome, EventStore, EventStoreError};
