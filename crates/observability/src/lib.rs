//! Process-level observability wiring.

pub mod tracing;

pub use tracing::init;
