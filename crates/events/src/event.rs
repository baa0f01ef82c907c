use chrono::{DateTime, FixedOffset};

use caresync_core::Visibility;

/// A domain-agnostic event trait for event-sourced aggregates.
///
/// Events are facts: immutable, versioned, append-only. State is rebuilt by
/// replaying them in order, and read models are disposable views folded from
/// them.
///
/// The identifier returned by `event_type` must be stable (it keys historic
/// payloads) and namespaced `{aggregate}.{action}`, e.g.
/// `diagnosis.resolved`. `schema_version` starts at 1 and only increases;
/// readers must keep deserializing old versions until they are upcast.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable, namespaced event name.
    fn event_type(&self) -> &'static str;

    /// Payload schema version for upcasting.
    fn schema_version(&self) -> u32 {
        1
    }

    /// Business time: when the fact happened in the world, stamped with the
    /// producing device's local offset. System time lives on the envelope.
    fn occurred_at(&self) -> DateTime<FixedOffset>;

    /// Audience tags this event should carry on its envelope.
    fn visibility(&self) -> Visibility {
        Visibility::clinical()
    }
}
