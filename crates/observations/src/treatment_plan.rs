use serde::{Deserialize, Serialize};

use caresync_core::{AggregateId, DomainError, PerformerRole, Visibility};

use crate::fact::define_fact;

/// A prescribed course of treatment tied to a diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentPlanPayload {
    /// The diagnosis this plan addresses; checked against DiagnosisStatus
    /// before acceptance and re-checked at sync time.
    pub diagnosis_id: AggregateId,
    pub plan: String,
    pub medications: Vec<String>,
}

impl TreatmentPlanPayload {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.plan.trim().is_empty() {
            return Err(DomainError::validation("plan cannot be empty"));
        }
        if self.medications.iter().any(|m| m.trim().is_empty()) {
            return Err(DomainError::validation("medication entries cannot be empty"));
        }
        Ok(())
    }
}

define_fact! {
    kind: TreatmentPlan,
    aggregate: TreatmentPlan,
    id: TreatmentPlanId,
    command: PrescribeTreatmentPlan,
    event: TreatmentPlanPrescribed,
    event_type: "treatment_plan.prescribed",
    payload: TreatmentPlanPayload,
    role_permitted: |role| role == PerformerRole::Physician,
    visibility: Visibility::clinical(),
}
