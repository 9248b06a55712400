use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Field map carried by entities and mutation payloads.
pub type Fields = Map<String, Value>;

/// Prefix of client-generated identifiers awaiting a server id.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Generates a new temporary identifier (`tmp-<uuid>`).
pub fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
}

/// Returns true if the id was generated locally and not yet reconciled.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Crop,
    Task,
    Order,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Crop, EntityType::Task, EntityType::Order];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Crop => "crop",
            EntityType::Task => "task",
            EntityType::Order => "order",
        }
    }

    /// Plural name used in listings and statistics.
    pub fn plural(&self) -> &'static str {
        match self {
            EntityType::Crop => "crops",
            EntityType::Task => "tasks",
            EntityType::Order => "orders",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown entity type: {0}. Expected crop, task or order")]
pub struct ParseEntityTypeError(String);

impl FromStr for EntityType {
    type Err = ParseEntityTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "crop" | "crops" => Ok(EntityType::Crop),
            "task" | "tasks" => Ok(EntityType::Task),
            "order" | "orders" => Ok(EntityType::Order),
            _ => Err(ParseEntityTypeError(s.to_string())),
        }
    }
}

/// Identity of an entity across tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.entity_type, self.id)
    }
}

/// A crop, task or order as seen by the client.
///
/// `version` is the last server-confirmed version (0 for entities the
/// server has never seen). `deleted` only appears on pulled tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub fields: Fields,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

impl Entity {
    pub fn new(entity_type: EntityType, id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            entity_type,
            version: 0,
            fields,
            dirty: false,
            updated_at: None,
            deleted: false,
            sync_error: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id.clone())
    }

    pub fn is_temporary(&self) -> bool {
        is_temp_id(&self.id)
    }

    /// Applies a partial update. `null` clears a field.
    pub fn merge_fields(&mut self, patch: &Fields) {
        for (name, value) in patch {
            if value.is_null() {
                self.fields.remove(name);
            } else {
                self.fields.insert(name.clone(), value.clone());
            }
        }
    }

    /// Copy with the local bookkeeping flags cleared.
    pub fn confirmed_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.dirty = false;
        copy.sync_error = None;
        copy
    }

    /// Best-effort display label (name, task or client name).
    pub fn label(&self) -> String {
        ["name", "task", "client_name"]
            .iter()
            .find_map(|field| self.fields.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Replaces every string value equal to `from` with `to`.
///
/// Returns true if anything changed.
pub(crate) fn replace_references(fields: &mut Fields, from: &str, to: &str) -> bool {
    let mut changed = false;
    for value in fields.values_mut() {
        if value.as_str() == Some(from) {
            *value = Value::String(to.to_string());
            changed = true;
        }
    }
    changed
}
