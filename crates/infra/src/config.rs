//! Runtime tunables for the write side and sync.
//!
//! Environment parsing stays at the binary edge; the core takes a plain
//! struct so tests can pin values (notably zeroing backoff).

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Optimistic-concurrency retries before a command fails with
    /// `ConcurrencyError`.
    pub command_retries: u32,
    /// Base for exponential backoff between handler retries, milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Backoff cap, milliseconds.
    pub retry_backoff_cap_ms: u64,
    /// Projection delivery retries before an event is dead-lettered.
    pub dispatcher_retries: u32,
    /// Backoff between projection retries, milliseconds.
    pub dispatcher_backoff_ms: u64,
    /// Page size for sync downloads and catch-up polling.
    pub sync_page_size: usize,
    /// Drift beyond this is accepted but logged for the documentation audit.
    pub drift_warn_ms: i64,
    /// Hub-side handlers verify cross-aggregate preconditions strictly; a
    /// device keeps accepting when its local read models have no answer and
    /// relies on sync-time compensation.
    pub strict_preconditions: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            command_retries: 5,
            retry_backoff_base_ms: 25,
            retry_backoff_cap_ms: 1_000,
            dispatcher_retries: 5,
            dispatcher_backoff_ms: 10,
            sync_page_size: 256,
            drift_warn_ms: 120_000,
            strict_preconditions: false,
        }
    }
}

impl CoreConfig {
    /// Hub defaults: strict checks, same retry policy.
    pub fn hub() -> Self {
        Self {
            strict_preconditions: true,
            ..Self::default()
        }
    }

    /// Test defaults: no sleeping between retries.
    pub fn immediate() -> Self {
        Self {
            retry_backoff_base_ms: 0,
            retry_backoff_cap_ms: 0,
            dispatcher_backoff_ms: 0,
            ..Self::default()
        }
    }
}
