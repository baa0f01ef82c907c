use std::collections::HashMap;
use std::sync::RwLock;

use caresync_core::{AggregateId, AggregateKind, OrganizationId, PerformerId};
use caresync_encounters::{EncounterEvent, EncounterStage};
use caresync_events::{Projection, StoredEnvelope};

use crate::read_model::{InMemoryOrgStore, OrgStore};

/// Current stage of an encounter plus the identities the concurrent-
/// encounter rule keys on.
#[derive(Debug, Clone, PartialEq)]
pub struct EncounterStateRow {
    pub encounter_id: AggregateId,
    pub patient_id: AggregateId,
    pub attending: PerformerId,
    pub stage: EncounterStage,
}

pub struct EncounterStateProjection {
    store: InMemoryOrgStore<AggregateId, EncounterStateRow>,
    watermarks: RwLock<HashMap<AggregateId, u64>>,
}

impl EncounterStateProjection {
    pub const NAME: &'static str = "encounter_state";

    pub fn new() -> Self {
        Self {
            store: InMemoryOrgStore::new(),
            watermarks: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        organization_id: OrganizationId,
        encounter_id: AggregateId,
    ) -> Option<EncounterStateRow> {
        self.store.get(organization_id, &encounter_id)
    }

    pub fn list(&self, organization_id: OrganizationId) -> Vec<EncounterStateRow> {
        self.store.list(organization_id)
    }
}

impl EncounterStateProjection {
    /// Drop one aggregate's row and watermark so a restructured
    /// stream can be replayed from scratch.
    pub fn reset(&self, organization_id: OrganizationId, aggregate_id: AggregateId) {
        self.store.remove(organization_id, &aggregate_id);
        if let Ok(mut watermarks) = self.watermarks.write() {
            watermarks.remove(&aggregate_id);
        }
    }
}

impl Default for EncounterStateProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for EncounterStateProjection {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interested_in(&self, envelope: &StoredEnvelope) -> bool {
        envelope.aggregate_type() == AggregateKind::Encounter
    }

    fn apply(&self, envelope: &StoredEnvelope) -> anyhow::Result<()> {
        let encounter_id = envelope.aggregate_id();
        {
            let watermarks = self
                .watermarks
                .read()
                .map_err(|_| anyhow::anyhow!("watermark lock poisoned"))?;
            if envelope.aggregate_version() <= watermarks.get(&encounter_id).copied().unwrap_or(0)
            {
                return Ok(());
            }
        }

        let event: EncounterEvent = envelope.typed_payload()?;
        let org = envelope.organization_id();
        match event {
            EncounterEvent::CheckedIn(e) => {
                self.store.upsert(
                    org,
                    encounter_id,
                    EncounterStateRow {
                        encounter_id,
                        patient_id: e.patient_id,
                        attending: e.attending,
                        stage: EncounterStage::CheckedIn,
                    },
                );
            }
            other => {
                let stage = match other {
                    EncounterEvent::Triaged(_) => EncounterStage::Triaged,
                    EncounterEvent::Began(_) => EncounterStage::InProgress,
                    EncounterEvent::Completed(_) => EncounterStage::Completed,
                    EncounterEvent::Reopened(_) => EncounterStage::Reopened,
                    EncounterEvent::Discharged(_) => EncounterStage::Discharged,
                    EncounterEvent::CheckedIn(_) => unreachable!(),
                };
                if let Some(mut row) = self.store.get(org, &encounter_id) {
                    row.stage = stage;
                    self.store.upsert(org, encounter_id, row);
                }
            }
        }

        self.watermarks
            .write()
            .map_err(|_| anyhow::anyhow!("watermark lock poisoned"))?
            .insert(encounter_id, envelope.aggregate_version());
        Ok(())
    }
}
