//! Client-side store of crops, tasks and orders.
//!
//! Every local write goes through [`LocalStore::apply_local_mutation`], which
//! updates the visible entity immediately and appends a record to the
//! [`Journal`]. For each entity the store keeps the last server-confirmed copy
//! next to the visible one; the visible copy is always the confirmed copy with
//! the outstanding journal records replayed on top.
//!
//! The store never performs I/O. Persistence lives in [`StoreFile`].

mod error;
mod file;
mod journal;

pub use error::StoreError;
pub use file::StoreFile;
pub use journal::Journal;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::{
    is_temp_id, new_temp_id, replace_references, validate_payload, Entity, EntityKey, EntityType,
    Fields, LocalMutation, MutationRecord, MutationStatus, Operation, REFERENCE_FIELDS,
};
use crate::sync::SyncFailure;

/// On-disk format version of [`StoreSnapshot`].
pub const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Clone, Default)]
struct EntityRow {
    /// Highest server version seen for this entity, tombstones included.
    version: u64,
    confirmed: Option<Entity>,
    visible: Option<Entity>,
}

/// Result of merging pulled entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub applied: BTreeMap<EntityType, usize>,
    pub removed: usize,
    pub stale: usize,
}

impl SnapshotStats {
    pub fn total_applied(&self) -> usize {
        self.applied.values().sum()
    }

    pub fn merge(&mut self, other: SnapshotStats) {
        for (entity_type, count) in other.applied {
            *self.applied.entry(entity_type).or_default() += count;
        }
        self.removed += other.removed;
        self.stale += other.stale;
    }
}

/// A local edit the server overruled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictNotice {
    pub op_id: String,
    pub key: EntityKey,
    pub operation: Operation,
    pub discarded: Fields,
    pub server_version: u64,
    pub server_deleted: bool,
}

/// Outstanding mutations of one entity that can be sent now, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGroup {
    pub key: EntityKey,
    pub op_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRow {
    entity_type: EntityType,
    id: String,
    version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confirmed: Option<Entity>,
}

/// Serializable image of a [`LocalStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format: u32,
    #[serde(default)]
    pub cursor: Option<DateTime<Utc>>,
    #[serde(default)]
    rows: Vec<StoredRow>,
    #[serde(default)]
    journal: Journal,
}

#[derive(Debug, Default)]
pub struct LocalStore {
    rows: BTreeMap<EntityKey, EntityRow>,
    journal: Journal,
    cursor: Option<DateTime<Utc>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<&Entity> {
        self.rows
            .get(&EntityKey::new(entity_type, id))
            .and_then(|row| row.visible.as_ref())
    }

    /// Visible entities of one type, ordered by id.
    pub fn list(&self, entity_type: EntityType) -> Vec<&Entity> {
        self.rows
            .iter()
            .filter(|(key, _)| key.entity_type == entity_type)
            .filter_map(|(_, row)| row.visible.as_ref())
            .collect()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn record(&self, op_id: &str) -> Option<&MutationRecord> {
        self.journal.get(op_id)
    }

    /// Server time of the last successful pull.
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Option<DateTime<Utc>>) {
        self.cursor = cursor;
    }

    /// Applies a local write optimistically and queues it for the server.
    ///
    /// Returns the id of the affected entity, a temporary id for creates.
    pub fn apply_local_mutation(
        &mut self,
        entity_type: EntityType,
        mutation: LocalMutation,
    ) -> Result<String, StoreError> {
        let operation = mutation.operation();
        let (id, payload, base_version) = match mutation {
            LocalMutation::Create { fields } => {
                validate_payload(entity_type, operation, &fields)?;
                (new_temp_id(), fields, 0)
            }
            LocalMutation::Update { id, fields } => {
                validate_payload(entity_type, operation, &fields)?;
                let base = self.base_version(&EntityKey::new(entity_type, id.clone()))?;
                (id, fields, base)
            }
            LocalMutation::Delete { id } => {
                let base = self.base_version(&EntityKey::new(entity_type, id.clone()))?;
                (id, Fields::new(), base)
            }
        };

        let record = MutationRecord::new(entity_type, id.clone(), operation, payload, base_version);
        let key = record.key();
        tracing::debug!("Queued {} of {} as {}", operation, key, record.op_id);
        self.journal.push(record);
        self.rebuild(&key);

        Ok(id)
    }

    fn base_version(&self, key: &EntityKey) -> Result<u64, StoreError> {
        match self.rows.get(key) {
            Some(row) if row.visible.is_some() => Ok(row
                .confirmed
                .as_ref()
                .map(|entity| entity.version)
                .unwrap_or(0)),
            _ => Err(StoreError::NotFound(key.clone())),
        }
    }

    /// Merges pulled entities, last write wins by version.
    ///
    /// Entities at or below the version already held are skipped. Local edits
    /// are replayed on top of newer confirmed copies. Tombstones remove clean
    /// entities; dirty ones keep their local state until their edits are
    /// settled by the server.
    pub fn apply_remote_snapshot(&mut self, entities: Vec<Entity>) -> SnapshotStats {
        let mut stats = SnapshotStats::default();

        for entity in entities {
            let key = entity.key();
            let current = self.rows.get(&key).map(|row| row.version).unwrap_or(0);
            if entity.version <= current {
                stats.stale += 1;
                continue;
            }

            if entity.deleted {
                if self.journal.has_outstanding(&key) {
                    tracing::debug!("Keeping locally edited {} despite remote delete", key);
                    continue;
                }
                stats.removed += 1;
            } else {
                *stats.applied.entry(key.entity_type).or_default() += 1;
            }

            self.accept_server_copy(&key, &entity);
            self.rebuild(&key);
        }

        stats
    }

    /// Drops clean entities missing from a full snapshot.
    ///
    /// Returns the number of entities removed.
    pub fn retain_confirmed(&mut self, present: &HashSet<EntityKey>) -> usize {
        let stale: Vec<EntityKey> = self
            .rows
            .keys()
            .filter(|key| !present.contains(*key) && !self.journal.has_outstanding(key))
            .cloned()
            .collect();

        let mut removed = 0;
        for key in stale {
            if let Some(row) = self.rows.remove(&key) {
                if row.confirmed.is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Applies the server's answer to a pushed mutation.
    ///
    /// Renames a temporary id everywhere it appears, stores the confirmed
    /// copy and drops the record from the journal. Returns `false` without
    /// changing anything if the record is already gone.
    pub fn reconcile_confirmed_mutation(
        &mut self,
        op_id: &str,
        server_entity: &Entity,
    ) -> Result<bool, StoreError> {
        let Some(record) = self.journal.remove(op_id) else {
            tracing::debug!("Mutation {} already reconciled", op_id);
            return Ok(false);
        };

        let mut key = record.key();
        if key.id != server_entity.id {
            self.rename(&key, &server_entity.id);
            key = EntityKey::new(key.entity_type, server_entity.id.clone());
        }

        self.accept_server_copy(&key, server_entity);
        for later in self.journal.iter_mut() {
            if later.entity_type == key.entity_type && later.entity_id == key.id {
                later.base_version = later.base_version.max(server_entity.version);
            }
        }
        self.rebuild(&key);

        tracing::debug!(
            "Confirmed {} of {} at version {}",
            record.operation,
            key,
            server_entity.version
        );
        Ok(true)
    }

    /// Discards a local edit the server rejected as conflicting and keeps the
    /// server's copy. Later edits of the same entity are rebased on the
    /// server version; a server tombstone drops them instead.
    pub fn resolve_conflict(
        &mut self,
        op_id: &str,
        server_entity: &Entity,
    ) -> Result<Option<ConflictNotice>, StoreError> {
        let Some(record) = self.journal.remove(op_id) else {
            return Ok(None);
        };

        let key = record.key();
        if server_entity.deleted {
            let dropped = self.journal.remove_for_entity(&key);
            if dropped > 0 {
                tracing::debug!("Dropped {} mutation(s) of deleted {}", dropped, key);
            }
        } else {
            for later in self.journal.iter_mut() {
                if later.entity_type == key.entity_type && later.entity_id == key.id {
                    later.base_version = later.base_version.max(server_entity.version);
                }
            }
        }
        self.accept_server_copy(&key, server_entity);
        self.rebuild(&key);

        tracing::debug!("Server version {} of {} wins", server_entity.version, key);
        Ok(Some(ConflictNotice {
            op_id: record.op_id,
            key,
            operation: record.operation,
            discarded: record.payload,
            server_version: server_entity.version,
            server_deleted: server_entity.deleted,
        }))
    }

    /// Marks a mutation as permanently failed. Local state is left intact.
    pub fn mark_mutation_failed(
        &mut self,
        op_id: &str,
        failure: SyncFailure,
    ) -> Result<(), StoreError> {
        let record = self
            .journal
            .get_mut(op_id)
            .ok_or_else(|| StoreError::UnknownMutation(op_id.to_string()))?;
        record.status = MutationStatus::Failed;
        record.failure = Some(failure);
        let key = record.key();
        self.rebuild(&key);
        Ok(())
    }

    /// Moves a pending record to in-flight and returns a copy to send.
    pub fn begin_attempt(&mut self, op_id: &str) -> Result<MutationRecord, StoreError> {
        let record = self.expect_status(op_id, MutationStatus::Pending)?;
        record.status = MutationStatus::InFlight;
        Ok(record.clone())
    }

    /// Puts a record back to pending after a transient failure.
    ///
    /// Returns the updated retry count.
    pub fn record_transient_failure(
        &mut self,
        op_id: &str,
        failure: SyncFailure,
    ) -> Result<u32, StoreError> {
        let record = self
            .journal
            .get_mut(op_id)
            .ok_or_else(|| StoreError::UnknownMutation(op_id.to_string()))?;
        record.retry_count += 1;
        record.status = MutationStatus::Pending;
        record.failure = Some(failure);
        Ok(record.retry_count)
    }

    /// Returns an in-flight record to pending without counting an attempt.
    pub fn release(&mut self, op_id: &str) -> Result<(), StoreError> {
        let record = self.expect_status(op_id, MutationStatus::InFlight)?;
        record.status = MutationStatus::Pending;
        Ok(())
    }

    /// Re-queues a failed mutation with a fresh retry budget.
    pub fn retry_failed(&mut self, op_id: &str) -> Result<(), StoreError> {
        let record = self.expect_status(op_id, MutationStatus::Failed)?;
        record.status = MutationStatus::Pending;
        record.retry_count = 0;
        record.failure = None;
        let key = record.key();
        self.rebuild(&key);
        Ok(())
    }

    /// Re-queues every failed mutation. Returns how many were re-queued.
    pub fn retry_all_failed(&mut self) -> usize {
        let failed: Vec<String> = self
            .journal
            .iter()
            .filter(|r| r.status == MutationStatus::Failed)
            .map(|r| r.op_id.clone())
            .collect();
        let mut count = 0;
        for op_id in &failed {
            if self.retry_failed(op_id).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Drops a failed mutation and rebuilds its entity from what remains.
    ///
    /// Discarding a create also drops the later records of that entity,
    /// since they have nothing left to apply to.
    pub fn discard_failed(&mut self, op_id: &str) -> Result<MutationRecord, StoreError> {
        let record = self.expect_status(op_id, MutationStatus::Failed)?;
        let key = record.key();
        let is_create = record.operation == Operation::Create;

        if is_create {
            let dropped = self.journal.remove_later_for_entity(&key, op_id);
            if !dropped.is_empty() {
                tracing::debug!("Dropped {} dependent mutation(s) of {}", dropped.len(), key);
            }
        }

        let record = self
            .journal
            .remove(op_id)
            .ok_or_else(|| StoreError::UnknownMutation(op_id.to_string()))?;
        self.rebuild(&key);
        Ok(record)
    }

    fn expect_status(
        &mut self,
        op_id: &str,
        expected: MutationStatus,
    ) -> Result<&mut MutationRecord, StoreError> {
        let record = self
            .journal
            .get_mut(op_id)
            .ok_or_else(|| StoreError::UnknownMutation(op_id.to_string()))?;
        if record.status != expected {
            return Err(StoreError::InvalidStatus {
                op_id: op_id.to_string(),
                status: record.status,
                expected,
            });
        }
        Ok(record)
    }

    /// Work that can be pushed now, grouped per entity in journal order.
    ///
    /// An entity with an in-flight or failed record contributes nothing past
    /// that record.
    pub fn pending_batch(&self) -> Vec<PendingGroup> {
        let mut groups: Vec<PendingGroup> = Vec::new();
        let mut index: HashMap<EntityKey, usize> = HashMap::new();
        let mut blocked: HashSet<EntityKey> = HashSet::new();

        for record in self.journal.iter() {
            let key = record.key();
            if blocked.contains(&key) {
                continue;
            }
            match record.status {
                MutationStatus::Pending => {
                    let slot = *index.entry(key.clone()).or_insert_with(|| {
                        groups.push(PendingGroup {
                            key: key.clone(),
                            op_ids: Vec::new(),
                        });
                        groups.len() - 1
                    });
                    groups[slot].op_ids.push(record.op_id.clone());
                }
                MutationStatus::InFlight | MutationStatus::Failed => {
                    blocked.insert(key);
                }
                MutationStatus::Confirmed => {}
            }
        }

        groups
    }

    /// The entity a record points at through a reference field while that
    /// entity's create is still waiting in the journal.
    pub fn unconfirmed_reference(&self, record: &MutationRecord) -> Option<EntityKey> {
        REFERENCE_FIELDS.iter().find_map(|(field, entity_type)| {
            let id = record.payload.get(*field)?.as_str()?;
            if !is_temp_id(id) {
                return None;
            }
            self.journal
                .iter()
                .any(|r| {
                    r.operation == Operation::Create
                        && r.entity_type == *entity_type
                        && r.entity_id == id
                })
                .then(|| EntityKey::new(*entity_type, id))
        })
    }

    /// Verifies the journal and entity tables agree with each other.
    pub fn check_integrity(&self) -> Result<(), StoreError> {
        let mut seen_ops = HashSet::new();
        let mut seen_entities: HashSet<EntityKey> = HashSet::new();

        for record in self.journal.iter() {
            if !seen_ops.insert(record.op_id.as_str()) {
                return Err(corruption(format!("duplicate mutation id {}", record.op_id)));
            }
            if record.status == MutationStatus::Confirmed {
                return Err(corruption(format!(
                    "confirmed mutation {} left in journal",
                    record.op_id
                )));
            }

            let key = record.key();
            let first_for_entity = seen_entities.insert(key.clone());
            let row = self.rows.get(&key);

            if record.operation == Operation::Create {
                if !first_for_entity {
                    return Err(corruption(format!("create of {} is not its first mutation", key)));
                }
                if row.is_some_and(|row| row.confirmed.is_some()) {
                    return Err(corruption(format!("create of already confirmed {}", key)));
                }
            } else if first_for_entity && !row.is_some_and(|row| row.confirmed.is_some()) {
                return Err(corruption(format!(
                    "mutation {} targets unknown {}",
                    record.op_id, key
                )));
            }
        }

        for (key, row) in &self.rows {
            if let Some(entity) = &row.visible {
                if entity.dirty != self.journal.has_outstanding(key) {
                    return Err(corruption(format!("dirty flag of {} is out of date", key)));
                }
                if entity.is_temporary() && !seen_entities.contains(key) {
                    return Err(corruption(format!("{} has a temporary id but no create", key)));
                }
            }
            if let Some(confirmed) = &row.confirmed {
                if confirmed.version > row.version {
                    return Err(corruption(format!("version of {} went backwards", key)));
                }
            }
        }

        Ok(())
    }

    /// Clears all entities, the journal and the sync cursor.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn to_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            format: SNAPSHOT_FORMAT,
            cursor: self.cursor,
            rows: self
                .rows
                .iter()
                .filter(|(_, row)| row.version > 0)
                .map(|(key, row)| StoredRow {
                    entity_type: key.entity_type,
                    id: key.id.clone(),
                    version: row.version,
                    confirmed: row.confirmed.clone(),
                })
                .collect(),
            journal: self.journal.clone(),
        }
    }

    /// Rebuilds a store from a snapshot.
    ///
    /// Records that were in flight when the snapshot was taken go back to
    /// pending. A snapshot whose tables disagree is reported as corruption.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self, StoreError> {
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(corruption(format!(
                "unsupported store format {}",
                snapshot.format
            )));
        }

        let mut store = Self {
            rows: BTreeMap::new(),
            journal: snapshot.journal,
            cursor: snapshot.cursor,
        };

        for row in snapshot.rows {
            let key = EntityKey::new(row.entity_type, row.id);
            store.rows.insert(
                key,
                EntityRow {
                    version: row.version,
                    confirmed: row.confirmed.map(|entity| entity.confirmed_copy()),
                    visible: None,
                },
            );
        }

        for record in store.journal.iter_mut() {
            if record.status == MutationStatus::InFlight {
                record.status = MutationStatus::Pending;
            }
        }

        store.rebuild_all();
        store.check_integrity()?;
        Ok(store)
    }

    fn accept_server_copy(&mut self, key: &EntityKey, server_entity: &Entity) {
        let row = self.rows.entry(key.clone()).or_default();
        if server_entity.version < row.version {
            return;
        }
        row.version = server_entity.version;
        row.confirmed = if server_entity.deleted {
            None
        } else {
            let mut copy = server_entity.confirmed_copy();
            copy.id = key.id.clone();
            copy.entity_type = key.entity_type;
            Some(copy)
        };
    }

    fn rename(&mut self, from: &EntityKey, to_id: &str) {
        let to = EntityKey::new(from.entity_type, to_id);
        tracing::debug!("Replacing temporary id {} with {}", from.id, to_id);

        if let Some(row) = self.rows.remove(from) {
            let target = self.rows.entry(to.clone()).or_default();
            if row.version > target.version {
                target.version = row.version;
                target.confirmed = row.confirmed;
            }
        }

        for record in self.journal.iter_mut() {
            if record.entity_type == from.entity_type && record.entity_id == from.id {
                record.entity_id = to_id.to_string();
            }
            replace_references(&mut record.payload, &from.id, to_id);
        }

        for row in self.rows.values_mut() {
            if let Some(confirmed) = row.confirmed.as_mut() {
                replace_references(&mut confirmed.fields, &from.id, to_id);
            }
        }

        self.rebuild_all();
    }

    fn rebuild_all(&mut self) {
        let mut keys: HashSet<EntityKey> = self.rows.keys().cloned().collect();
        keys.extend(self.journal.iter().map(MutationRecord::key));
        for key in keys {
            self.rebuild(&key);
        }
    }

    /// Recomputes the visible copy of one entity from its confirmed copy and
    /// its outstanding journal records.
    fn rebuild(&mut self, key: &EntityKey) {
        let mut visible = self
            .rows
            .get(key)
            .and_then(|row| row.confirmed.as_ref())
            .map(Entity::confirmed_copy);
        let mut dirty = false;
        let mut sync_error = None;

        for record in self.journal.for_entity(key) {
            dirty = true;
            match record.operation {
                Operation::Create => {
                    visible = Some(Entity::new(
                        key.entity_type,
                        key.id.clone(),
                        record.payload.clone(),
                    ));
                }
                Operation::Update => {
                    if let Some(entity) = visible.as_mut() {
                        entity.merge_fields(&record.payload);
                    }
                }
                Operation::Delete => visible = None,
            }
            if record.status == MutationStatus::Failed {
                if let Some(failure) = &record.failure {
                    sync_error = Some(failure.message.clone());
                }
            }
        }

        if let Some(entity) = visible.as_mut() {
            entity.dirty = dirty;
            entity.sync_error = sync_error;
        }

        let row = self.rows.entry(key.clone()).or_default();
        row.visible = visible;
        if row.version == 0 && row.confirmed.is_none() && row.visible.is_none() && !dirty {
            self.rows.remove(key);
        }
    }
}

fn corruption(message: String) -> StoreError {
    StoreError::Corruption(message)
}

/// Handle to the store shared by the engine and the UI layer.
///
/// Access goes through closures so the lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct SharedStore {
    inner: Arc<Mutex<LocalStore>>,
}

impl SharedStore {
    pub fn new(store: LocalStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut LocalStore) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ErrorKind;
    use serde_json::{json, Value};

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn crop_fields() -> Fields {
        fields(json!({
            "name": "Avocado",
            "variety": "Hass",
            "propagation_method": "grafting",
            "current_stage": "seedling",
            "planted_date": "2024-03-01"
        }))
    }

    fn task_fields(crop_id: &str) -> Fields {
        fields(json!({"task": "Water", "due_date": "2024-03-05", "crop_id": crop_id}))
    }

    fn server_crop(id: &str, version: u64) -> Entity {
        Entity::new(EntityType::Crop, id, crop_fields()).with_version(version)
    }

    fn create_crop(store: &mut LocalStore) -> String {
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Create {
                    fields: crop_fields(),
                },
            )
            .unwrap()
    }

    fn only_op(store: &LocalStore) -> String {
        assert_eq!(store.journal().len(), 1);
        store.journal().iter().next().unwrap().op_id.clone()
    }

    fn failure(kind: ErrorKind) -> SyncFailure {
        SyncFailure {
            kind,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_create_is_optimistic() {
        let mut store = LocalStore::new();
        let id = create_crop(&mut store);

        assert!(id.starts_with("tmp-"));
        let entity = store.get(EntityType::Crop, &id).unwrap();
        assert!(entity.dirty);
        assert_eq!(entity.version, 0);
        assert_eq!(store.journal().len(), 1);
        assert_eq!(
            store.journal().iter().next().unwrap().status,
            MutationStatus::Pending
        );
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_invalid_payload_is_rejected_without_side_effects() {
        let mut store = LocalStore::new();
        let result = store.apply_local_mutation(
            EntityType::Crop,
            LocalMutation::Create {
                fields: fields(json!({"name": "Avocado"})),
            },
        );
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert!(store.journal().is_empty());
        assert!(store.list(EntityType::Crop).is_empty());
    }

    #[test]
    fn test_update_unknown_entity() {
        let mut store = LocalStore::new();
        let result = store.apply_local_mutation(
            EntityType::Task,
            LocalMutation::Update {
                id: "task-1".to_string(),
                fields: fields(json!({"completed": true})),
            },
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_update_records_base_version() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 3)]);
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Update {
                    id: "crop-1".to_string(),
                    fields: fields(json!({"current_stage": "rooted"})),
                },
            )
            .unwrap();

        let record = store.journal().iter().next().unwrap();
        assert_eq!(record.base_version, 3);
        let entity = store.get(EntityType::Crop, "crop-1").unwrap();
        assert_eq!(entity.fields["current_stage"], json!("rooted"));
        assert!(entity.dirty);
    }

    #[test]
    fn test_snapshot_with_same_or_lower_version_is_noop() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 2)]);

        let mut older = server_crop("crop-1", 2);
        older.fields.insert("name".into(), json!("Mango"));
        let stats = store.apply_remote_snapshot(vec![older.clone(), older.with_version(1)]);

        assert_eq!(stats.stale, 2);
        assert_eq!(stats.total_applied(), 0);
        let entity = store.get(EntityType::Crop, "crop-1").unwrap();
        assert_eq!(entity.fields["name"], json!("Avocado"));
        assert_eq!(entity.version, 2);
    }

    #[test]
    fn test_snapshot_replays_local_edits() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1)]);
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Update {
                    id: "crop-1".to_string(),
                    fields: fields(json!({"notes": "moved to bench 4"})),
                },
            )
            .unwrap();

        let mut newer = server_crop("crop-1", 2);
        newer.fields.insert("location".into(), json!("B4"));
        store.apply_remote_snapshot(vec![newer]);

        let entity = store.get(EntityType::Crop, "crop-1").unwrap();
        assert_eq!(entity.version, 2);
        assert_eq!(entity.fields["location"], json!("B4"));
        assert_eq!(entity.fields["notes"], json!("moved to bench 4"));
        assert!(entity.dirty);
    }

    #[test]
    fn test_tombstone_removes_clean_entity_only() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1), server_crop("crop-2", 1)]);
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Update {
                    id: "crop-2".to_string(),
                    fields: fields(json!({"notes": "keep"})),
                },
            )
            .unwrap();

        let mut gone = Entity::new(EntityType::Crop, "crop-1", Fields::new()).with_version(2);
        gone.deleted = true;
        let mut gone_too = Entity::new(EntityType::Crop, "crop-2", Fields::new()).with_version(2);
        gone_too.deleted = true;
        let stats = store.apply_remote_snapshot(vec![gone.clone(), gone_too]);

        assert_eq!(stats.removed, 1);
        assert!(store.get(EntityType::Crop, "crop-1").is_none());
        assert!(store.get(EntityType::Crop, "crop-2").is_some());

        // An older copy arriving later must not resurrect the entity.
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1)]);
        assert!(store.get(EntityType::Crop, "crop-1").is_none());
    }

    #[test]
    fn test_reconcile_replaces_temporary_id_everywhere() {
        let mut store = LocalStore::new();
        let crop_id = create_crop(&mut store);
        let task_id = store
            .apply_local_mutation(
                EntityType::Task,
                LocalMutation::Create {
                    fields: task_fields(&crop_id),
                },
            )
            .unwrap();
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Update {
                    id: crop_id.clone(),
                    fields: fields(json!({"current_stage": "rooted"})),
                },
            )
            .unwrap();

        let create_op = store.journal().iter().next().unwrap().op_id.clone();
        let confirmed = server_crop("crop-7", 1);
        assert!(store
            .reconcile_confirmed_mutation(&create_op, &confirmed)
            .unwrap());

        assert!(store.get(EntityType::Crop, &crop_id).is_none());
        let crop = store.get(EntityType::Crop, "crop-7").unwrap();
        assert_eq!(crop.fields["current_stage"], json!("rooted"));
        assert!(crop.dirty);

        let task = store.get(EntityType::Task, &task_id).unwrap();
        assert_eq!(task.fields["crop_id"], json!("crop-7"));

        for record in store.journal().iter() {
            assert_ne!(record.entity_id, crop_id);
            assert!(!record.payload.values().any(|v| v == &json!(crop_id)));
        }
        let update = store
            .journal()
            .iter()
            .find(|r| r.entity_type == EntityType::Crop)
            .unwrap();
        assert_eq!(update.entity_id, "crop-7");
        assert_eq!(update.base_version, 1);
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_reconcile_twice_is_noop() {
        let mut store = LocalStore::new();
        create_crop(&mut store);
        let op_id = only_op(&store);
        let confirmed = server_crop("crop-1", 1);

        assert!(store.reconcile_confirmed_mutation(&op_id, &confirmed).unwrap());
        let before = store.to_snapshot();
        assert!(!store.reconcile_confirmed_mutation(&op_id, &confirmed).unwrap());
        let after = store.to_snapshot();

        assert_eq!(
            serde_json::to_value(&before).unwrap(),
            serde_json::to_value(&after).unwrap()
        );
        let crop = store.get(EntityType::Crop, "crop-1").unwrap();
        assert!(!crop.dirty);
        assert!(store.journal().is_empty());
    }

    #[test]
    fn test_confirmed_delete_removes_entity() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1)]);
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Delete {
                    id: "crop-1".to_string(),
                },
            )
            .unwrap();
        assert!(store.get(EntityType::Crop, "crop-1").is_none());

        let op_id = only_op(&store);
        let mut tombstone = Entity::new(EntityType::Crop, "crop-1", Fields::new()).with_version(2);
        tombstone.deleted = true;
        store.reconcile_confirmed_mutation(&op_id, &tombstone).unwrap();

        assert!(store.list(EntityType::Crop).is_empty());
        assert!(store.journal().is_empty());
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_resolve_conflict_keeps_server_copy() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1)]);
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Update {
                    id: "crop-1".to_string(),
                    fields: fields(json!({"name": "Mine"})),
                },
            )
            .unwrap();
        let op_id = only_op(&store);

        let mut theirs = server_crop("crop-1", 2);
        theirs.fields.insert("name".into(), json!("Theirs"));
        let notice = store.resolve_conflict(&op_id, &theirs).unwrap().unwrap();

        assert_eq!(notice.discarded["name"], json!("Mine"));
        assert_eq!(notice.server_version, 2);
        let entity = store.get(EntityType::Crop, "crop-1").unwrap();
        assert_eq!(entity.fields["name"], json!("Theirs"));
        assert!(!entity.dirty);
        assert!(store.resolve_conflict(&op_id, &theirs).unwrap().is_none());
    }

    #[test]
    fn test_resolve_conflict_rebases_later_edits() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1)]);
        for patch in [json!({"name": "Mine"}), json!({"notes": "north bench"})] {
            store
                .apply_local_mutation(
                    EntityType::Crop,
                    LocalMutation::Update {
                        id: "crop-1".to_string(),
                        fields: fields(patch),
                    },
                )
                .unwrap();
        }
        let first = store.journal().iter().next().unwrap().op_id.clone();

        store
            .resolve_conflict(&first, &server_crop("crop-1", 2))
            .unwrap()
            .unwrap();

        let later = only_op(&store);
        let record = store.record(&later).unwrap();
        assert_eq!(record.base_version, 2);
        assert_eq!(record.payload["notes"], json!("north bench"));
        let entity = store.get(EntityType::Crop, "crop-1").unwrap();
        assert_eq!(entity.fields["notes"], json!("north bench"));
        assert!(entity.dirty);
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_unconfirmed_reference_follows_reference_fields_only() {
        let mut store = LocalStore::new();
        let crop_id = create_crop(&mut store);
        store
            .apply_local_mutation(
                EntityType::Task,
                LocalMutation::Create {
                    fields: task_fields(&crop_id),
                },
            )
            .unwrap();
        let mut notes = crop_fields();
        notes.insert("notes".into(), json!("tmp-bench, move later"));
        store
            .apply_local_mutation(EntityType::Crop, LocalMutation::Create { fields: notes })
            .unwrap();
        store
            .apply_local_mutation(
                EntityType::Task,
                LocalMutation::Create {
                    fields: task_fields("tmp-long-gone"),
                },
            )
            .unwrap();

        let references: Vec<_> = store
            .journal()
            .iter()
            .map(|record| store.unconfirmed_reference(record))
            .collect();
        assert_eq!(
            references,
            vec![
                None,
                Some(EntityKey::new(EntityType::Crop, crop_id.clone())),
                None,
                None,
            ]
        );
    }

    #[test]
    fn test_failed_mutation_keeps_local_state() {
        let mut store = LocalStore::new();
        let id = create_crop(&mut store);
        let op_id = only_op(&store);

        store
            .mark_mutation_failed(&op_id, failure(ErrorKind::Validation))
            .unwrap();

        let entity = store.get(EntityType::Crop, &id).unwrap();
        assert!(entity.dirty);
        assert_eq!(entity.sync_error.as_deref(), Some("boom"));
        assert_eq!(store.record(&op_id).unwrap().status, MutationStatus::Failed);
    }

    #[test]
    fn test_retry_failed_resets_budget() {
        let mut store = LocalStore::new();
        let id = create_crop(&mut store);
        let op_id = only_op(&store);
        store
            .record_transient_failure(&op_id, failure(ErrorKind::Transient))
            .unwrap();
        store
            .mark_mutation_failed(&op_id, failure(ErrorKind::Transient))
            .unwrap();

        store.retry_failed(&op_id).unwrap();
        let record = store.record(&op_id).unwrap();
        assert_eq!(record.status, MutationStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(store.get(EntityType::Crop, &id).unwrap().sync_error.is_none());

        assert!(matches!(
            store.retry_failed(&op_id),
            Err(StoreError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn test_discard_failed_create_drops_dependents() {
        let mut store = LocalStore::new();
        let id = create_crop(&mut store);
        let create_op = only_op(&store);
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Update {
                    id: id.clone(),
                    fields: fields(json!({"notes": "x"})),
                },
            )
            .unwrap();
        store
            .mark_mutation_failed(&create_op, failure(ErrorKind::Validation))
            .unwrap();

        let discarded = store.discard_failed(&create_op).unwrap();
        assert_eq!(discarded.operation, Operation::Create);
        assert!(store.journal().is_empty());
        assert!(store.get(EntityType::Crop, &id).is_none());
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_discard_failed_update_restores_confirmed_copy() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1)]);
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Update {
                    id: "crop-1".to_string(),
                    fields: fields(json!({"name": "Typo"})),
                },
            )
            .unwrap();
        let op_id = only_op(&store);
        assert!(matches!(
            store.discard_failed(&op_id),
            Err(StoreError::InvalidStatus { .. })
        ));

        store
            .mark_mutation_failed(&op_id, failure(ErrorKind::Validation))
            .unwrap();
        store.discard_failed(&op_id).unwrap();

        let entity = store.get(EntityType::Crop, "crop-1").unwrap();
        assert_eq!(entity.fields["name"], json!("Avocado"));
        assert!(!entity.dirty);
    }

    #[test]
    fn test_pending_batch_groups_and_blocks() {
        let mut store = LocalStore::new();
        let a = create_crop(&mut store);
        let b = create_crop(&mut store);
        for id in [&a, &b] {
            store
                .apply_local_mutation(
                    EntityType::Crop,
                    LocalMutation::Update {
                        id: id.clone(),
                        fields: fields(json!({"notes": "n"})),
                    },
                )
                .unwrap();
        }

        let batch = store.pending_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].key.id, a);
        assert_eq!(batch[0].op_ids.len(), 2);

        let first_of_a = batch[0].op_ids[0].clone();
        store
            .mark_mutation_failed(&first_of_a, failure(ErrorKind::Validation))
            .unwrap();
        let batch = store.pending_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key.id, b);
    }

    #[test]
    fn test_attempt_lifecycle() {
        let mut store = LocalStore::new();
        create_crop(&mut store);
        let op_id = only_op(&store);

        let sent = store.begin_attempt(&op_id).unwrap();
        assert_eq!(sent.status, MutationStatus::InFlight);
        assert!(store.begin_attempt(&op_id).is_err());

        store.release(&op_id).unwrap();
        assert_eq!(store.record(&op_id).unwrap().status, MutationStatus::Pending);

        store.begin_attempt(&op_id).unwrap();
        let count = store
            .record_transient_failure(&op_id, failure(ErrorKind::Transient))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.record(&op_id).unwrap().status, MutationStatus::Pending);
    }

    #[test]
    fn test_snapshot_restores_state() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 4)]);
        let id = create_crop(&mut store);
        let op_id = store.pending_batch()[0].op_ids[0].clone();
        store.begin_attempt(&op_id).unwrap();
        let cursor = Utc::now();
        store.set_cursor(Some(cursor));

        let json = serde_json::to_string(&store.to_snapshot()).unwrap();
        let restored =
            LocalStore::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();

        assert_eq!(restored.cursor(), Some(cursor));
        assert_eq!(restored.get(EntityType::Crop, "crop-1").unwrap().version, 4);
        assert!(restored.get(EntityType::Crop, &id).unwrap().dirty);
        assert_eq!(
            restored.record(&op_id).unwrap().status,
            MutationStatus::Pending
        );
    }

    #[test]
    fn test_inconsistent_snapshot_is_corruption() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1)]);
        store
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Update {
                    id: "crop-1".to_string(),
                    fields: fields(json!({"notes": "n"})),
                },
            )
            .unwrap();

        let mut value = serde_json::to_value(store.to_snapshot()).unwrap();
        value["rows"] = json!([]);
        let result = LocalStore::from_snapshot(serde_json::from_value(value).unwrap());
        assert!(matches!(result, Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_retain_confirmed_keeps_dirty_entities() {
        let mut store = LocalStore::new();
        store.apply_remote_snapshot(vec![server_crop("crop-1", 1), server_crop("crop-2", 1)]);
        let local = create_crop(&mut store);

        let present: HashSet<EntityKey> = [EntityKey::new(EntityType::Crop, "crop-2")].into();
        assert_eq!(store.retain_confirmed(&present), 1);
        assert!(store.get(EntityType::Crop, "crop-1").is_none());
        assert!(store.get(EntityType::Crop, "crop-2").is_some());
        assert!(store.get(EntityType::Crop, &local).is_some());
    }

    #[test]
    fn test_reset() {
        let mut store = LocalStore::new();
        create_crop(&mut store);
        store.set_cursor(Some(Utc::now()));
        store.reset();
        assert!(store.journal().is_empty());
        assert!(store.cursor().is_none());
        assert!(store.list(EntityType::Crop).is_empty());
    }

    #[test]
    fn test_shared_store() {
        let shared = SharedStore::new(LocalStore::new());
        let other = shared.clone();
        let id = shared.with(create_crop);
        assert!(other.with(|store| store.get(EntityType::Crop, &id).is_some()));
    }
}
