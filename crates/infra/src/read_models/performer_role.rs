use caresync_core::{OrganizationId, PerformerId, PerformerRole};
use caresync_events::{Projection, StoredEnvelope};

use crate::read_model::{InMemoryOrgStore, OrgStore};

/// Last role observed per performer, from envelope actor metadata.
///
/// Identity administration is out of scope; the role registry is learned
/// from the traffic itself and used for plausibility checks and queries.
pub struct PerformerRoleProjection {
    store: InMemoryOrgStore<PerformerId, PerformerRole>,
}

impl PerformerRoleProjection {
    pub const NAME: &'static str = "performer_role";

    pub fn new() -> Self {
        Self {
            store: InMemoryOrgStore::new(),
        }
    }

    pub fn get(
        &self,
        organization_id: OrganizationId,
        performer_id: PerformerId,
    ) -> Option<PerformerRole> {
        self.store.get(organization_id, &performer_id)
    }
}

impl Default for PerformerRoleProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for PerformerRoleProjection {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interested_in(&self, _envelope: &StoredEnvelope) -> bool {
        true
    }

    fn apply(&self, envelope: &StoredEnvelope) -> anyhow::Result<()> {
        let actor = envelope.actor();
        self.store.upsert(
            envelope.organization_id(),
            actor.performed_by,
            actor.performer_role,
        );
        Ok(())
    }
}
