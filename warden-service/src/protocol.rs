//! IPC protocol types for the Warden service.
//!
//! JSON-RPC-lite envelopes plus the request/response types of each method.
//! Domain payloads (grants, decisions, reports, audit entries) are the
//! `warden-core` types serialized as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_core::model::{AccessGrant, AccessPointId, DoorState, GrantWrite, IdentityId, TemplateId};
use warden_core::{
    AuditEntry, BulkReport, BulkRequest, BulkStatus, DoorRecord, EmergencyScope,
    ErrorCategory, ServiceStatus,
};

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Warden error codes, one per core error category.
pub const ERR_NOT_FOUND: i64 = 100;
pub const ERR_CONFLICT: i64 = 101;
pub const ERR_VALIDATION: i64 = 102;
pub const ERR_INVALID_STATE: i64 = 103;
pub const ERR_PARTIAL_FAILURE: i64 = 104;
pub const ERR_UNAVAILABLE: i64 = 300;
pub const ERR_COMMAND_TIMEOUT: i64 = 301;
pub const ERR_INTERNAL: i64 = 399;

pub fn category_code(category: ErrorCategory) -> i64 {
    match category {
        ErrorCategory::NotFound => ERR_NOT_FOUND,
        ErrorCategory::Conflict => ERR_CONFLICT,
        ErrorCategory::Validation => ERR_VALIDATION,
        ErrorCategory::InvalidState => ERR_INVALID_STATE,
        ErrorCategory::PartialFailure => ERR_PARTIAL_FAILURE,
        ErrorCategory::Unavailable => ERR_UNAVAILABLE,
        ErrorCategory::CommandTimeout => ERR_COMMAND_TIMEOUT,
        ErrorCategory::Internal => ERR_INTERNAL,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub id: RequestId,
    pub error: JsonRpcErrorBody,
}

/// Server push; carries no id and expects no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// access.check / grants.get
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairParams {
    pub identity_id: IdentityId,
    pub access_point_id: AccessPointId,
}

// ─────────────────────────────────────────────────────────────────────────────
// grants.upsert / grants.clear_direct
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantUpsertParams {
    #[serde(flatten)]
    pub write: GrantWrite,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantClearDirectParams {
    pub identity_id: IdentityId,
    pub access_point_id: AccessPointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    pub actor: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// grants.list
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantListResult {
    pub grants: Vec<AccessGrant>,
}

// ─────────────────────────────────────────────────────────────────────────────
// grants.bulk / grants.apply_template
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantBulkParams {
    #[serde(flatten)]
    pub request: BulkRequest,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyTemplateParams {
    pub template_id: TemplateId,
    pub identity_ids: Vec<IdentityId>,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkResult {
    pub status: BulkStatus,
    #[serde(flatten)]
    pub report: BulkReport,
}

impl From<BulkReport> for BulkResult {
    fn from(report: BulkReport) -> Self {
        Self {
            status: report.status(),
            report,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// emergency.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyActivateParams {
    pub scope: EmergencyScope,
    #[serde(default)]
    pub evacuation_mode: bool,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyDeactivateParams {
    pub actor: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// changes.subscribe
// ─────────────────────────────────────────────────────────────────────────────

/// Method name of the pushed change notifications.
pub const CHANGES_BATCH: &str = "changes.batch";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeParams {
    /// Replay buffered batches with a sequence greater than this first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_sequence: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResult {
    pub subscribed: bool,
    /// Bus sequence at the time of subscribing.
    pub sequence: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// audit.query
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditQueryResult {
    pub entries: Vec<AuditEntry>,
}

// ─────────────────────────────────────────────────────────────────────────────
// doors.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorHeartbeatParams {
    pub access_point_id: AccessPointId,
    pub state: DoorState,
    /// Controller clock; defaults to receipt time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorHeartbeatResult {
    /// False when the heartbeat is older than the last one recorded.
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorStatusResult {
    pub doors: Vec<DoorRecord>,
}

// ─────────────────────────────────────────────────────────────────────────────
// service.status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    pub service_version: String,
    #[serde(flatten)]
    pub status: ServiceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn every_category_has_a_distinct_code() {
        let categories = [
            ErrorCategory::NotFound,
            ErrorCategory::Conflict,
            ErrorCategory::Validation,
            ErrorCategory::InvalidState,
            ErrorCategory::PartialFailure,
            ErrorCategory::Unavailable,
            ErrorCategory::CommandTimeout,
            ErrorCategory::Internal,
        ];
        let mut codes: Vec<i64> = categories.iter().map(|c| category_code(*c)).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), categories.len());
        assert_eq!(category_code(ErrorCategory::Conflict), 101);
    }

    #[test]
    fn request_id_accepts_numbers_and_strings() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"id":"abc","method":"service.status"}"#).expect("parse");
        assert_eq!(req.id, RequestId::String("abc".to_string()));
        assert!(req.params.is_none());

        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"id":7,"method":"hello","params":{}}"#).expect("parse");
        assert_eq!(req.id, RequestId::Integer(7));
    }

    #[test]
    fn upsert_params_flatten_the_write() {
        let params: GrantUpsertParams = serde_json::from_value(serde_json::json!({
            "identity_id": "u1",
            "access_point_id": "d1",
            "allowed": true,
            "origin": "direct",
            "actor": "admin"
        }))
        .expect("parse");
        assert_eq!(params.write, GrantWrite::direct("u1", "d1", true));
        assert_eq!(params.actor, "admin");
    }
}
