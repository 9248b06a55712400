use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::entity::{EntityKey, EntityType, Fields};
use crate::sync::SyncFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle of a journal entry: Pending → InFlight → Confirmed | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Confirmed,
    Failed,
}

impl MutationStatus {
    /// Pending, InFlight and Failed entries keep their entity dirty.
    pub fn is_outstanding(&self) -> bool {
        !matches!(self, MutationStatus::Confirmed)
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationStatus::Pending => write!(f, "pending"),
            MutationStatus::InFlight => write!(f, "in-flight"),
            MutationStatus::Confirmed => write!(f, "confirmed"),
            MutationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A local write queued for the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub op_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub payload: Fields,
    /// Confirmed version the edit was made against (0 for creates).
    #[serde(default)]
    pub base_version: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub status: MutationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SyncFailure>,
}

impl MutationRecord {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Fields,
        base_version: u64,
    ) -> Self {
        Self {
            op_id: format!("op-{}", Uuid::new_v4()),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload,
            base_version,
            created_at: Utc::now(),
            retry_count: 0,
            status: MutationStatus::Pending,
            failure: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// A write requested by the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalMutation {
    Create { fields: Fields },
    Update { id: String, fields: Fields },
    Delete { id: String },
}

impl LocalMutation {
    pub fn operation(&self) -> Operation {
        match self {
            LocalMutation::Create { .. } => Operation::Create,
            LocalMutation::Update { .. } => Operation::Update,
            LocalMutation::Delete { .. } => Operation::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_is_pending() {
        let record = MutationRecord::new(
            EntityType::Crop,
            "tmp-1",
            Operation::Create,
            Fields::new(),
            0,
        );
        assert!(record.op_id.starts_with("op-"));
        assert_eq!(record.status, MutationStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.key(), EntityKey::new(EntityType::Crop, "tmp-1"));
    }

    #[test]
    fn test_status_outstanding() {
        assert!(MutationStatus::Pending.is_outstanding());
        assert!(MutationStatus::InFlight.is_outstanding());
        assert!(MutationStatus::Failed.is_outstanding());
        assert!(!MutationStatus::Confirmed.is_outstanding());
    }

    #[test]
    fn test_record_wire_format() {
        let record = MutationRecord::new(
            EntityType::Task,
            "task-4",
            Operation::Update,
            json!({"completed": true}).as_object().cloned().unwrap(),
            2,
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["entityId"], json!("task-4"));
        assert_eq!(value["operation"], json!("update"));
        assert_eq!(value["status"], json!("pending"));
        assert_eq!(value["baseVersion"], json!(2));
        assert!(value.get("failure").is_none());
    }
}
