use serde::{Deserialize, Serialize};

use crate::models::{EntityKey, MutationRecord, MutationStatus};

/// Ordered log of outstanding local mutations.
///
/// Entries are only ever appended or removed; the relative order of the
/// remaining entries never changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Journal {
    records: Vec<MutationRecord>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutationRecord> {
        self.records.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut MutationRecord> {
        self.records.iter_mut()
    }

    pub(crate) fn push(&mut self, record: MutationRecord) {
        self.records.push(record);
    }

    pub fn get(&self, op_id: &str) -> Option<&MutationRecord> {
        self.records.iter().find(|r| r.op_id == op_id)
    }

    pub(crate) fn get_mut(&mut self, op_id: &str) -> Option<&mut MutationRecord> {
        self.records.iter_mut().find(|r| r.op_id == op_id)
    }

    pub(crate) fn remove(&mut self, op_id: &str) -> Option<MutationRecord> {
        let index = self.records.iter().position(|r| r.op_id == op_id)?;
        Some(self.records.remove(index))
    }

    /// Records targeting one entity, oldest first.
    pub fn for_entity<'a>(
        &'a self,
        key: &'a EntityKey,
    ) -> impl Iterator<Item = &'a MutationRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.entity_type == key.entity_type && r.entity_id == key.id)
    }

    pub fn has_outstanding(&self, key: &EntityKey) -> bool {
        self.for_entity(key).any(|r| r.status.is_outstanding())
    }

    pub fn count_with_status(&self, status: MutationStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Drops every record targeting `key` that was appended after `op_id`.
    pub(crate) fn remove_later_for_entity(
        &mut self,
        key: &EntityKey,
        op_id: &str,
    ) -> Vec<MutationRecord> {
        let Some(start) = self.records.iter().position(|r| r.op_id == op_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        let mut index = start + 1;
        while index < self.records.len() {
            let record = &self.records[index];
            if record.entity_type == key.entity_type && record.entity_id == key.id {
                removed.push(self.records.remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }

    /// Drops every record targeting `key`. Returns how many were dropped.
    pub(crate) fn remove_for_entity(&mut self, key: &EntityKey) -> usize {
        let before = self.records.len();
        self.records
            .retain(|r| !(r.entity_type == key.entity_type && r.entity_id == key.id));
        before - self.records.len()
    }
}

impl From<Vec<MutationRecord>> for Journal {
    fn from(records: Vec<MutationRecord>) -> Self {
        Self { records }
    }
}
