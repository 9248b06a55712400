//! In-memory sync server for tests.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::protocol::{ChangesResponse, MutationResult, PushResponse};
use super::{RemoteService, SyncError};
use crate::models::{Entity, EntityKey, MutationRecord, Operation};

/// In-memory stand-in for the sync server.
#[derive(Default)]
pub(crate) struct FakeServer {
    pub(crate) entities: BTreeMap<EntityKey, Entity>,
    pub(crate) next_id: u64,
    pub(crate) pull_calls: usize,
    pub(crate) push_calls: usize,
    pub(crate) pull_delay: Option<Duration>,
    pub(crate) transient_pulls: u32,
    pub(crate) transient_pushes: u32,
    pub(crate) unreachable: HashSet<String>,
    pub(crate) reject: HashSet<String>,
    pub(crate) auth_failure: bool,
    pub(crate) cursor_expired: bool,
}

impl FakeServer {
    fn apply(&mut self, record: MutationRecord) -> MutationResult {
        let op_id = record.op_id.clone();
        if self.reject.contains(&record.entity_id) {
            return MutationResult::rejected(op_id, "invalid payload");
        }
        match record.operation {
            Operation::Create => {
                self.next_id += 1;
                let id = format!("{}-{}", record.entity_type, self.next_id);
                let mut entity = Entity::new(record.entity_type, id, record.payload)
                    .with_version(1);
                entity.updated_at = Some(Utc::now());
                self.entities.insert(entity.key(), entity.clone());
                MutationResult::confirmed(op_id, entity)
            }
            Operation::Update | Operation::Delete => {
                let key = record.key();
                let Some(current) = self.entities.get_mut(&key) else {
                    return MutationResult::rejected(op_id, "not found");
                };
                if record.base_version < current.version {
                    return MutationResult::conflict(op_id, current.clone(), "stale");
                }
                current.version += 1;
                current.updated_at = Some(Utc::now());
                if record.operation == Operation::Delete {
                    current.deleted = true;
                    current.fields.clear();
                } else {
                    current.merge_fields(&record.payload);
                }
                MutationResult::confirmed(op_id, current.clone())
            }
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeRemote(Arc<Mutex<FakeServer>>);

impl FakeRemote {
    pub(crate) fn server(&self) -> MutexGuard<'_, FakeServer> {
        self.0.lock().unwrap()
    }
}

impl RemoteService for FakeRemote {
    async fn fetch_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangesResponse, SyncError> {
        let delay = {
            let mut server = self.server();
            server.pull_calls += 1;
            if server.auth_failure {
                return Err(SyncError::Auth("invalid API key".into()));
            }
            if server.transient_pulls > 0 {
                server.transient_pulls -= 1;
                return Err(SyncError::Transient("connection reset".into()));
            }
            if server.cursor_expired && since.is_some() {
                return Err(SyncError::CursorExpired);
            }
            server.pull_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let server = self.server();
        Ok(ChangesResponse {
            entities: server
                .entities
                .values()
                .filter(|e| since.is_some() || !e.deleted)
                .cloned()
                .collect(),
            server_time: Utc::now(),
        })
    }

    async fn push_mutations(
        &self,
        mutations: Vec<MutationRecord>,
    ) -> Result<PushResponse, SyncError> {
        let mut server = self.server();
        server.push_calls += 1;
        if server.auth_failure {
            return Err(SyncError::Auth("invalid API key".into()));
        }
        if server.transient_pushes > 0 {
            server.transient_pushes -= 1;
            return Err(SyncError::Transient("timed out".into()));
        }
        if mutations
            .iter()
            .any(|m| server.unreachable.contains(&m.entity_id))
        {
            return Err(SyncError::Transient("timed out".into()));
        }
        let results = mutations.into_iter().map(|m| server.apply(m)).collect();
        Ok(PushResponse { results })
    }
}
