//! Wire types shared by the client and the reference server.
//!
//! All bodies are JSON with camelCase keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Entity, MutationRecord};

pub const CHANGES_PATH: &str = "/sync/changes";
pub const MUTATIONS_PATH: &str = "/sync/mutations";
pub const HEALTH_PATH: &str = "/health";

/// Query of `GET /sync/changes`. No `since` means a full snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    pub entities: Vec<Entity>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub mutations: Vec<MutationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub results: Vec<MutationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Confirmed,
    Conflict,
    Rejected,
}

/// Outcome of one pushed mutation.
///
/// `entity` is the server's copy after a confirm, or its current copy on a
/// conflict. `reason` explains conflicts and rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub op_id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MutationResult {
    pub fn confirmed(op_id: impl Into<String>, entity: Entity) -> Self {
        Self {
            op_id: op_id.into(),
            status: ResultStatus::Confirmed,
            entity: Some(entity),
            reason: None,
        }
    }

    pub fn conflict(op_id: impl Into<String>, entity: Entity, reason: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            status: ResultStatus::Conflict,
            entity: Some(entity),
            reason: Some(reason.into()),
        }
    }

    pub fn rejected(op_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            status: ResultStatus::Rejected,
            entity: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error body returned by the server on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changes_response_format() {
        let response: ChangesResponse = serde_json::from_value(json!({
            "entities": [
                {"id": "crop-1", "entityType": "crop", "version": 2, "fields": {"name": "Fig"}}
            ],
            "serverTime": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(response.entities.len(), 1);
        assert_eq!(response.entities[0].version, 2);
    }

    #[test]
    fn test_result_format() {
        let result = MutationResult::rejected("op-1", "bad date");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({"opId": "op-1", "status": "rejected", "reason": "bad date"})
        );
    }
}
