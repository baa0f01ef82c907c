use caresync_core::OrganizationId;

use crate::envelope::EventEnvelope;

/// A projection folds envelopes into a read model.
///
/// Projections are pure event consumers; inboxes, checkpoints, and
/// dead-lettering live in the dispatcher. Read models are disposable and
/// rebuildable by replay.
pub trait Projection: Send + Sync {
    /// Stable name used for checkpoints and dead-letter attribution.
    fn name(&self) -> &'static str;

    /// Whether this projection wants the envelope at all. The dispatcher
    /// consults this before queueing.
    fn interested_in(&self, envelope: &EventEnvelope<serde_json::Value>) -> bool;

    /// Apply a single envelope. Must be idempotent per event id; the
    /// dispatcher additionally dedupes, so replays are harmless.
    fn apply(&self, envelope: &EventEnvelope<serde_json::Value>) -> anyhow::Result<()>;
}

/// Helper trait for organization-scoped messages.
///
/// Lets infrastructure pin a worker to one organization and drop foreign
/// traffic before it reaches a handler.
pub trait OrgScoped {
    fn organization_id(&self) -> OrganizationId;
}

impl<E> OrgScoped for EventEnvelope<E> {
    fn organization_id(&self) -> OrganizationId {
        self.org().organization_id
    }
}
