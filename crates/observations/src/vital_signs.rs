use serde::{Deserialize, Serialize};

use caresync_core::{DomainError, Visibility};

use crate::fact::define_fact;

/// One set of vital sign measurements. All fields optional so partial
/// readings (e.g. triage pulse check) remain recordable, but at least one
/// measurement must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalSignsPayload {
    pub systolic_mm_hg: Option<u16>,
    pub diastolic_mm_hg: Option<u16>,
    pub heart_rate_bpm: Option<u16>,
    pub respiratory_rate: Option<u16>,
    pub temperature_deci_c: Option<i16>,
    pub spo2_percent: Option<u8>,
}

impl VitalSignsPayload {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.systolic_mm_hg.is_none()
            && self.diastolic_mm_hg.is_none()
            && self.heart_rate_bpm.is_none()
            && self.respiratory_rate.is_none()
            && self.temperature_deci_c.is_none()
            && self.spo2_percent.is_none()
        {
            return Err(DomainError::validation(
                "at least one vital sign measurement is required",
            ));
        }
        if let Some(s) = self.systolic_mm_hg {
            if !(30..=300).contains(&s) {
                return Err(DomainError::validation("systolic pressure out of range"));
            }
        }
        if let Some(d) = self.diastolic_mm_hg {
            if !(10..=200).contains(&d) {
                return Err(DomainError::validation("diastolic pressure out of range"));
            }
        }
        if let Some(hr) = self.heart_rate_bpm {
            if !(10..=350).contains(&hr) {
                return Err(DomainError::validation("heart rate out of range"));
            }
        }
        if let Some(t) = self.temperature_deci_c {
            if !(200..=450).contains(&t) {
                return Err(DomainError::validation("temperature out of range"));
            }
        }
        if let Some(o2) = self.spo2_percent {
            if o2 > 100 {
                return Err(DomainError::validation("SpO2 cannot exceed 100%"));
            }
        }
        Ok(())
    }
}

define_fact! {
    kind: VitalSigns,
    aggregate: VitalSigns,
    id: VitalSignsId,
    command: RecordVitalSigns,
    event: VitalSignsRecorded,
    event_type: "vital_signs.recorded",
    payload: VitalSignsPayload,
    role_permitted: |role| role.is_clinical(),
    visibility: Visibility::clinical(),
}

#[cfg(test)]
mod tests {
    use super::*;
    use caresync_core::{
        Aggregate, AggregateId, Clock, FixedClock, InvariantCode, PerformerId, PerformerRole, execute,
    };
    use chrono::{TimeZone, Utc};

    fn clock() -> FixedClock {
        FixedClock::at(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
    }

    fn cmd(id: VitalSignsId, clock: &FixedClock) -> RecordVitalSigns {
        RecordVitalSigns {
            fact_id: id,
            patient_id: AggregateId::new(),
            encounter_id: AggregateId::new(),
            payload: VitalSignsPayload {
                systolic_mm_hg: Some(128),
                diastolic_mm_hg: Some(82),
                heart_rate_bpm: Some(71),
                respiratory_rate: Some(14),
                temperature_deci_c: Some(368),
                spo2_percent: Some(98),
            },
            performed_by: PerformerId::new(),
            performer_role: PerformerRole::Nurse,
            occurred_at: clock.now().fixed_offset(),
        }
    }

    #[test]
    fn records_exactly_once() {
        let clock = clock();
        let id = VitalSignsId(AggregateId::new());
        let mut fact = VitalSigns::empty(id);
        execute(&mut fact, &cmd(id, &clock), &clock).unwrap();
        assert!(fact.is_recorded());

        let err = execute(&mut fact, &cmd(id, &clock), &clock).unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::FactAlreadyRecorded)
        );
    }

    #[test]
    fn empty_measurement_set_is_rejected() {
        let clock = clock();
        let id = VitalSignsId(AggregateId::new());
        let fact = VitalSigns::empty(id);
        let mut command = cmd(id, &clock);
        command.payload = VitalSignsPayload {
            systolic_mm_hg: None,
            diastolic_mm_hg: None,
            heart_rate_bpm: None,
            respiratory_rate: None,
            temperature_deci_c: None,
            spo2_percent: None,
        };
        assert!(fact.decide(&command, &clock).is_err());
    }

    #[test]
    fn front_desk_cannot_record_vitals() {
        let clock = clock();
        let id = VitalSignsId(AggregateId::new());
        let fact = VitalSigns::empty(id);
        let mut command = cmd(id, &clock);
        command.performer_role = PerformerRole::FrontDesk;
        let err = fact.decide(&command, &clock).unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::RoleNotPermitted));
    }
}
