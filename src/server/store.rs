//! Authoritative entity store of the sync server.
//!
//! Each user has an isolated set of entities. When a data directory is
//! configured, every user's data is written to JSON after each change:
//! ```text
//! <DATA_DIR>/
//!   <user_id>.json
//! ```

use chrono::{DateTime, Duration, Utc};
use floratrack_core::models::{
    validate_payload, Entity, EntityKey, EntityType, MutationRecord, Operation,
};
use floratrack_core::sync::protocol::{ChangesResponse, MutationResult, ResultStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

/// Errors that can occur in the server store.
#[derive(Debug)]
pub enum ServerStoreError {
    /// The requested cursor predates the tombstone horizon.
    CursorExpired(DateTime<Utc>),
    /// I/O error reading or writing a user file.
    IoError(PathBuf, io::Error),
    /// A user file exists but cannot be parsed.
    ParseError(PathBuf, String),
    /// Invalid user ID (e.g., contains path separators).
    InvalidUserId(String),
}

impl std::fmt::Display for ServerStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStoreError::CursorExpired(horizon) => {
                write!(f, "Cursor predates {}, pull a full snapshot", horizon)
            }
            ServerStoreError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
            ServerStoreError::ParseError(path, e) => {
                write!(f, "Failed to load {}: {}", path.display(), e)
            }
            ServerStoreError::InvalidUserId(id) => write!(f, "Invalid user ID: {}", id),
        }
    }
}

impl std::error::Error for ServerStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerStoreError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}

/// Result of an applied mutation, kept so a replayed op id gets the same answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppliedResult {
    result: MutationResult,
    applied_at: DateTime<Utc>,
}

/// Data of one user.
#[derive(Debug, Default)]
struct UserData {
    entities: BTreeMap<EntityKey, Entity>,
    next_ids: BTreeMap<EntityType, u64>,
    /// Results of already applied mutations, by op id. Forgotten together
    /// with purged tombstones.
    applied: HashMap<String, AppliedResult>,
    /// Changes before this instant may have been purged.
    horizon: Option<DateTime<Utc>>,
}

/// On-disk form of [`UserData`].
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserFile {
    entities: Vec<Entity>,
    next_ids: BTreeMap<EntityType, u64>,
    applied: Vec<AppliedResult>,
    horizon: Option<DateTime<Utc>>,
}

impl From<UserFile> for UserData {
    fn from(file: UserFile) -> Self {
        Self {
            entities: file
                .entities
                .into_iter()
                .map(|entity| (entity.key(), entity))
                .collect(),
            next_ids: file.next_ids,
            applied: file
                .applied
                .into_iter()
                .map(|applied| (applied.result.op_id.clone(), applied))
                .collect(),
            horizon: file.horizon,
        }
    }
}

impl UserData {
    fn to_file(&self) -> UserFile {
        UserFile {
            entities: self.entities.values().cloned().collect(),
            next_ids: self.next_ids.clone(),
            applied: self.applied.values().cloned().collect(),
            horizon: self.horizon,
        }
    }

    fn allocate_id(&mut self, entity_type: EntityType) -> String {
        let next = self.next_ids.entry(entity_type).or_insert(0);
        *next += 1;
        match entity_type {
            EntityType::Crop => format!("crop-{}", next),
            EntityType::Task => format!("task-{}", next),
            EntityType::Order => format!("PO-{}", next),
        }
    }

    fn changes_since(
        &self,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ChangesResponse, ServerStoreError> {
        let entities = match since {
            Some(since) => {
                if let Some(horizon) = self.horizon.filter(|horizon| since < *horizon) {
                    return Err(ServerStoreError::CursorExpired(horizon));
                }
                self.entities
                    .values()
                    .filter(|entity| entity.updated_at.is_some_and(|at| at >= since))
                    .cloned()
                    .collect()
            }
            // Full snapshots carry no tombstones.
            None => self
                .entities
                .values()
                .filter(|entity| !entity.deleted)
                .cloned()
                .collect(),
        };

        Ok(ChangesResponse {
            entities,
            server_time: now,
        })
    }

    fn apply(&mut self, record: MutationRecord, now: DateTime<Utc>) -> MutationResult {
        if let Some(applied) = self.applied.get(&record.op_id) {
            tracing::debug!("Replayed mutation {}", record.op_id);
            return applied.result.clone();
        }

        let result = self.apply_new(record, now);
        // Rejected ops may be retried after the client fixes them.
        if result.status != ResultStatus::Rejected {
            self.applied.insert(
                result.op_id.clone(),
                AppliedResult {
                    result: result.clone(),
                    applied_at: now,
                },
            );
        }
        result
    }

    fn apply_new(&mut self, record: MutationRecord, now: DateTime<Utc>) -> MutationResult {
        let op_id = record.op_id.clone();
        if let Err(e) = validate_payload(record.entity_type, record.operation, &record.payload) {
            return MutationResult::rejected(op_id, e.to_string());
        }

        if record.operation == Operation::Create {
            let id = self.allocate_id(record.entity_type);
            let mut entity = Entity::new(record.entity_type, id, record.payload).with_version(1);
            entity.updated_at = Some(now);
            self.entities.insert(entity.key(), entity.clone());
            return MutationResult::confirmed(op_id, entity);
        }

        let key = record.key();
        let Some(current) = self.entities.get_mut(&key) else {
            return MutationResult::rejected(op_id, format!("{} not found", key));
        };
        if current.deleted {
            return MutationResult::conflict(op_id, current.clone(), "entity was deleted");
        }
        if record.base_version < current.version {
            return MutationResult::conflict(
                op_id,
                current.clone(),
                format!(
                    "edit based on version {} but server has version {}",
                    record.base_version, current.version
                ),
            );
        }

        current.version += 1;
        current.updated_at = Some(now);
        if record.operation == Operation::Delete {
            current.deleted = true;
            current.fields.clear();
        } else {
            current.merge_fields(&record.payload);
        }
        MutationResult::confirmed(op_id, current.clone())
    }

    /// Drops tombstones and cached results older than `cutoff` and moves the
    /// horizon forward. Returns the number of tombstones and results dropped.
    fn purge(&mut self, cutoff: DateTime<Utc>) -> (usize, usize) {
        let before = self.entities.len();
        self.entities.retain(|_, entity| {
            !(entity.deleted && entity.updated_at.is_some_and(|at| at <= cutoff))
        });
        let removed = before - self.entities.len();
        if removed > 0 {
            self.horizon = Some(self.horizon.map_or(cutoff, |horizon| horizon.max(cutoff)));
        }

        let cached = self.applied.len();
        self.applied.retain(|_, applied| applied.applied_at > cutoff);
        (removed, cached - self.applied.len())
    }
}

/// Per-user authoritative store with optional JSON persistence.
#[derive(Debug, Default)]
pub struct ServerStore {
    data_dir: Option<PathBuf>,
    users: RwLock<HashMap<String, UserData>>,
}

impl ServerStore {
    /// Creates a store that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates a store persisted under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Validates a user ID to prevent path traversal attacks.
    fn validate_user_id(user_id: &str) -> Result<(), ServerStoreError> {
        if user_id.is_empty()
            || user_id.contains('/')
            || user_id.contains('\\')
            || user_id.contains("..")
            || user_id.starts_with('.')
        {
            return Err(ServerStoreError::InvalidUserId(user_id.to_string()));
        }
        Ok(())
    }

    fn user_path(&self, user_id: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", user_id)))
    }

    fn load_user(&self, user_id: &str) -> Result<UserData, ServerStoreError> {
        let Some(path) = self.user_path(user_id) else {
            return Ok(UserData::default());
        };
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(UserData::default()),
            Err(e) => return Err(ServerStoreError::IoError(path, e)),
        };
        let file: UserFile = serde_json::from_str(&contents)
            .map_err(|e| ServerStoreError::ParseError(path.clone(), e.to_string()))?;
        Ok(file.into())
    }

    fn save_user(&self, user_id: &str, data: &UserData) -> Result<(), ServerStoreError> {
        let Some(path) = self.user_path(user_id) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ServerStoreError::IoError(parent.into(), e))?;
        }
        let json = serde_json::to_string_pretty(&data.to_file())
            .map_err(|e| ServerStoreError::ParseError(path.clone(), e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| ServerStoreError::IoError(tmp.clone(), e))?;
        fs::rename(&tmp, &path).map_err(|e| ServerStoreError::IoError(path, e))
    }

    /// Runs `f` on the user's data, loading it on first access.
    fn with_user<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut UserData) -> T,
    ) -> Result<T, ServerStoreError> {
        Self::validate_user_id(user_id)?;
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if !users.contains_key(user_id) {
            let data = self.load_user(user_id)?;
            users.insert(user_id.to_string(), data);
        }
        let data = users
            .get_mut(user_id)
            .ok_or_else(|| ServerStoreError::InvalidUserId(user_id.to_string()))?;
        Ok(f(data))
    }

    /// Entities changed at or after `since`, or every live entity if `since`
    /// is `None`.
    pub fn changes_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangesResponse, ServerStoreError> {
        self.with_user(user_id, |data| data.changes_since(since, Utc::now()))?
    }

    /// Applies mutations in order. Replaying an op id returns its first
    /// result without applying it again.
    pub fn apply_mutations(
        &self,
        user_id: &str,
        mutations: Vec<MutationRecord>,
    ) -> Result<Vec<MutationResult>, ServerStoreError> {
        let now = Utc::now();
        self.with_user(user_id, |data| {
            let results: Vec<MutationResult> = mutations
                .into_iter()
                .map(|record| data.apply(record, now))
                .collect();
            self.save_user(user_id, data)?;
            Ok(results)
        })?
    }

    /// Removes tombstones older than `retention` for every loaded user,
    /// along with the op id results cached over the same period. Returns the
    /// number of tombstones removed.
    pub fn purge_tombstones(&self, retention: Duration) -> Result<usize, ServerStoreError> {
        let cutoff = Utc::now() - retention;
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let mut total = 0;
        for (user_id, data) in users.iter_mut() {
            let (removed, expired) = data.purge(cutoff);
            if removed + expired > 0 {
                tracing::debug!(
                    "Purged {} tombstone(s) and {} cached result(s) of {}",
                    removed,
                    expired,
                    user_id
                );
                self.save_user(user_id, data)?;
                total += removed;
            }
        }
        Ok(total)
    }
}
