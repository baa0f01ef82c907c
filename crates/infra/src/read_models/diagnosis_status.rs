use std::collections::HashMap;
use std::sync::RwLock;

use caresync_core::{AggregateId, AggregateKind, OrganizationId};
use caresync_diagnostics::{DiagnosisEvent, DiagnosisStage};
use caresync_events::{Projection, StoredEnvelope};

use crate::read_model::{InMemoryOrgStore, OrgStore};

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosisStatusRow {
    pub diagnosis_id: AggregateId,
    pub patient_id: AggregateId,
    pub stage: DiagnosisStage,
}

pub struct DiagnosisStatusProjection {
    store: InMemoryOrgStore<AggregateId, DiagnosisStatusRow>,
    watermarks: RwLock<HashMap<AggregateId, u64>>,
}

impl DiagnosisStatusProjection {
    pub const NAME: &'static str = "diagnosis_status";

    pub fn new() -> Self {
        Self {
            store: InMemoryOrgStore::new(),
            watermarks: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        organization_id: OrganizationId,
        diagnosis_id: AggregateId,
    ) -> Option<DiagnosisStatusRow> {
        self.store.get(organization_id, &diagnosis_id)
    }
}

impl DiagnosisStatusProjection {
    /// Drop one aggregate's row and watermark so a restructured
    /// stream can be replayed from scratch.
    pub fn reset(&self, organization_id: OrganizationId, aggregate_id: AggregateId) {
        self.store.remove(organization_id, &aggregate_id);
        if let Ok(mut watermarks) = self.watermarks.write() {
            watermarks.remove(&aggregate_id);
        }
    }
}

impl Default for DiagnosisStatusProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for DiagnosisStatusProjection {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interested_in(&self, envelope: &StoredEnvelope) -> bool {
        envelope.aggregate_type() == AggregateKind::Diagnosis
    }

    fn apply(&self, envelope: &StoredEnvelope) -> anyhow::Result<()> {
        let diagnosis_id = envelope.aggregate_id();
        {
            let watermarks = self
                .watermarks
                .read()
                .map_err(|_| anyhow::anyhow!("watermark lock poisoned"))?;
            if envelope.aggregate_version() <= watermarks.get(&diagnosis_id).copied().unwrap_or(0)
            {
                return Ok(());
            }
        }

        let event: DiagnosisEvent = envelope.typed_payload()?;
        let org = envelope.organization_id();
        match event {
            DiagnosisEvent::Made(e) => {
                self.store.upsert(
                    org,
                    diagnosis_id,
                    DiagnosisStatusRow {
                        diagnosis_id,
                        patient_id: e.patient_id,
                        stage: DiagnosisStage::Made,
                    },
                );
            }
            DiagnosisEvent::Revised(_) => {}
            DiagnosisEvent::Resolved(_) => {
                if let Some(mut row) = self.store.get(org, &diagnosis_id) {
                    row.stage = DiagnosisStage::Resolved;
                    self.store.upsert(org, diagnosis_id, row);
                }
            }
        }

        self.watermarks
            .write()
            .map_err(|_| anyhow::anyhow!("watermark lock poisoned"))?
            .insert(diagnosis_id, envelope.aggregate_version());
        Ok(())
    }
}
