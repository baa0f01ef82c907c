use std::collections::HashMap;
use std::sync::RwLock;

use caresync_core::{AggregateId, AggregateKind, OrganizationId};
use caresync_events::{Projection, StoredEnvelope};
use caresync_scheduling::{AppointmentEvent, AppointmentStage};

use crate::read_model::{InMemoryOrgStore, OrgStore};

#[derive(Debug, Clone, PartialEq)]
pub struct AppointmentStatusRow {
    pub appointment_id: AggregateId,
    pub patient_id: AggregateId,
    pub stage: AppointmentStage,
}

pub struct AppointmentStatusProjection {
    store: InMemoryOrgStore<AggregateId, AppointmentStatusRow>,
    watermarks: RwLock<HashMap<AggregateId, u64>>,
}

impl AppointmentStatusProjection {
    pub const NAME: &'static str = "appointment_status";

    pub fn new() -> Self {
        Self {
            store: InMemoryOrgStore::new(),
            watermarks: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        organization_id: OrganizationId,
        appointment_id: AggregateId,
    ) -> Option<AppointmentStatusRow> {
        self.store.get(organization_id, &appointment_id)
    }
}

impl AppointmentStatusProjection {
    /// Drop one aggregate's row and watermark so a restructured
    /// stream can be replayed from scratch.
    pub fn reset(&self, organization_id: OrganizationId, aggregate_id: AggregateId) {
        self.store.remove(organization_id, &aggregate_id);
        if let Ok(mut watermarks) = self.watermarks.write() {
            watermarks.remove(&aggregate_id);
        }
    }
}

impl Default for AppointmentStatusProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for AppointmentStatusProjection {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interested_in(&self, envelope: &StoredEnvelope) -> bool {
        envelope.aggregate_type() == AggregateKind::Appointment
    }

    fn apply(&self, envelope: &StoredEnvelope) -> anyhow::Result<()> {
        let appointment_id = envelope.aggregate_id();
        {
            let watermarks = self
                .watermarks
                .read()
                .map_err(|_| anyhow::anyhow!("watermark lock poisoned"))?;
            if envelope.aggregate_version()
                <= watermarks.get(&appointment_id).copied().unwrap_or(0)
            {
                return Ok(());
            }
        }

        let event: AppointmentEvent = envelope.typed_payload()?;
        let org = envelope.organization_id();
        match event {
            AppointmentEvent::Requested(e) => {
                self.store.upsert(
                    org,
                    appointment_id,
                    AppointmentStatusRow {
                        appointment_id,
                        patient_id: e.patient_id,
                        stage: AppointmentStage::Requested,
                    },
                );
            }
            other => {
                let stage = match other {
                    AppointmentEvent::Confirmed(_) => AppointmentStage::Confirmed,
                    AppointmentEvent::Rescheduled(_) => AppointmentStage::Rescheduled,
                    AppointmentEvent::CancelledByPatient(_) => AppointmentStage::CancelledByPatient,
                    AppointmentEvent::CancelledByPractice(_) => {
                        AppointmentStage::CancelledByPractice
                    }
                    AppointmentEvent::NoShowed(_) => AppointmentStage::NoShowed,
                    AppointmentEvent::Requested(_) => unreachable!(),
                };
                if let Some(mut row) = self.store.get(org, &appointment_id) {
                    row.stage = stage;
                    self.store.upsert(org, appointment_id, row);
                }
            }
        }

        self.watermarks
            .write()
            .map_err(|_| anyhow::anyhow!("watermark lock poisoned"))?
            .insert(appointment_id, envelope.aggregate_version());
        Ok(())
    }
}
