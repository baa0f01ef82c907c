//! Read-side gateway, symmetric to the command gateway.
//!
//! Accepts `{query_type, params}`, validates structurally, reads the
//! registered read model's current state, and maps it to a response with a
//! pure function. Never loads aggregates, never touches the event store,
//! never runs business rules.

use serde_json::{Value as JsonValue, json};

use caresync_core::{AggregateId, OrganizationId, PerformerId};

use crate::read_models::ReadModels;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct QueryRequest {
    pub query_type: String,
    pub params: JsonValue,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    fn ok(data: JsonValue) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

pub struct QueryGateway {
    read_models: ReadModels,
}

impl QueryGateway {
    pub fn new(read_models: ReadModels) -> Self {
        Self { read_models }
    }

    pub fn dispatch(&self, request: QueryRequest) -> QueryResult {
        let org = match param_id(&request.params, "organization_id") {
            Ok(id) => OrganizationId::from_uuid(id),
            Err(e) => return QueryResult::err(e),
        };

        match request.query_type.as_str() {
            "patient_status" => match param_id(&request.params, "patient_id") {
                Err(e) => QueryResult::err(e),
                Ok(id) => {
                    match self
                        .read_models
                        .patient_status
                        .get(org, AggregateId::from_uuid(id))
                    {
                        Some(row) => QueryResult::ok(json!({
                            "patient_id": row.patient_id,
                            "stage": row.stage,
                        })),
                        None => QueryResult::err("patient not found"),
                    }
                }
            },
            "encounter_state" => match param_id(&request.params, "encounter_id") {
                Err(e) => QueryResult::err(e),
                Ok(id) => {
                    match self.read_models.encounter(org, AggregateId::from_uuid(id)) {
                        Some(row) => QueryResult::ok(json!({
                            "encounter_id": row.encounter_id,
                            "patient_id": row.patient_id,
                            "attending": row.attending,
                            "stage": row.stage,
                        })),
                        None => QueryResult::err("encounter not found"),
                    }
                }
            },
            "diagnosis_status" => match param_id(&request.params, "diagnosis_id") {
                Err(e) => QueryResult::err(e),
                Ok(id) => {
                    match self
                        .read_models
                        .diagnosis_status
                        .get(org, AggregateId::from_uuid(id))
                    {
                        Some(row) => QueryResult::ok(json!({
                            "diagnosis_id": row.diagnosis_id,
                            "patient_id": row.patient_id,
                            "stage": row.stage,
                        })),
                        None => QueryResult::err("diagnosis not found"),
                    }
                }
            },
            "appointment_status" => match param_id(&request.params, "appointment_id") {
                Err(e) => QueryResult::err(e),
                Ok(id) => {
                    match self
                        .read_models
                        .appointment_status
                        .get(org, AggregateId::from_uuid(id))
                    {
                        Some(row) => QueryResult::ok(json!({
                            "appointment_id": row.appointment_id,
                            "patient_id": row.patient_id,
                            "stage": row.stage,
                        })),
                        None => QueryResult::err("appointment not found"),
                    }
                }
            },
            "performer_role" => match param_id(&request.params, "performer_id") {
                Err(e) => QueryResult::err(e),
                Ok(id) => {
                    match self
                        .read_models
                        .performer_role
                        .get(org, PerformerId::from_uuid(id))
                    {
                        Some(role) => QueryResult::ok(json!({ "role": role })),
                        None => QueryResult::err("performer not seen"),
                    }
                }
            },
            other => QueryResult::err(format!("unknown query type: {other}")),
        }
    }
}

fn param_id(params: &JsonValue, field: &str) -> Result<uuid::Uuid, String> {
    params
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| format!("{field} is required"))?
        .parse()
        .map_err(|_| format!("{field} must be a UUID"))
}
