use std::collections::HashMap;
use std::sync::RwLock;

use caresync_core::{AggregateId, AggregateKind, OrganizationId};
use caresync_events::{Projection, StoredEnvelope};
use caresync_patients::{PatientEvent, RegistrationStage};

use crate::read_model::{InMemoryOrgStore, OrgStore};

/// Minimal status row: where the patient stands in their lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientStatusRow {
    pub patient_id: AggregateId,
    pub stage: RegistrationStage,
}

/// Folds patient lifecycle events into [`PatientStatusRow`]s.
///
/// Per-stream version watermarks make replays and at-least-once delivery
/// harmless.
pub struct PatientStatusProjection {
    store: InMemoryOrgStore<AggregateId, PatientStatusRow>,
    watermarks: RwLock<HashMap<AggregateId, u64>>,
}

impl PatientStatusProjection {
    pub const NAME: &'static str = "patient_status";

    pub fn new() -> Self {
        Self {
            store: InMemoryOrgStore::new(),
            watermarks: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        organization_id: OrganizationId,
        patient_id: AggregateId,
    ) -> Option<PatientStatusRow> {
        self.store.get(organization_id, &patient_id)
    }
}

impl PatientStatusProjection {
    /// Drop one aggregate's row and watermark so a restructured
    /// stream can be replayed from scratch.
    pub fn reset(&self, organization_id: OrganizationId, aggregate_id: AggregateId) {
        self.store.remove(organization_id, &aggregate_id);
        if let Ok(mut watermarks) = self.watermarks.write() {
            watermarks.remove(&aggregate_id);
        }
    }
}

impl Default for PatientStatusProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for PatientStatusProjection {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interested_in(&self, envelope: &StoredEnvelope) -> bool {
        envelope.aggregate_type() == AggregateKind::PatientRegistration
    }

    fn apply(&self, envelope: &StoredEnvelope) -> anyhow::Result<()> {
        let patient_id = envelope.aggregate_id();
        {
            let watermarks = self
                .watermarks
                .read()
                .map_err(|_| anyhow::anyhow!("watermark lock poisoned"))?;
            if envelope.aggregate_version() <= watermarks.get(&patient_id).copied().unwrap_or(0) {
                return Ok(());
            }
        }

        let event: PatientEvent = envelope.typed_payload()?;
        let org = envelope.organization_id();
        let stage = match event {
            PatientEvent::Registered(_) => Some(RegistrationStage::Active),
            PatientEvent::DeceasedRecorded(_) => Some(RegistrationStage::Deceased),
            PatientEvent::TransferredOut(_) => Some(RegistrationStage::TransferredOut),
            PatientEvent::IdentityCorrected(_) | PatientEvent::ContactInfoDeclared(_) => None,
        };
        if let Some(stage) = stage {
            self.store.upsert(
                org,
                patient_id,
                PatientStatusRow { patient_id, stage },
            );
        }

        self.watermarks
            .write()
            .map_err(|_| anyhow::anyhow!("watermark lock poisoned"))?
            .insert(patient_id, envelope.aggregate_version());
        Ok(())
    }
}
