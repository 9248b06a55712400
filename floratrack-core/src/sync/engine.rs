//! Pull/push reconciliation between the local store and the sync server.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

use super::outcome::{Rejection, SkipReason, SyncOutcome};
use super::protocol::{ChangesResponse, MutationResult, ResultStatus};
use super::{RemoteService, RetryPolicy, SyncError};
use crate::models::{Entity, EntityKey, MutationRecord, MutationStatus, Operation};
use crate::status::SyncStatusReporter;
use crate::store::{LocalStore, PendingGroup, SharedStore, StoreError, StoreFile};

/// What to do with the rest of an entity's records after one was handled.
enum Flow {
    Continue,
    BlockEntity,
}

/// Drains the mutation journal and pulls remote changes.
///
/// At most one sync runs at a time. Everything that can trigger a sync
/// (connectivity changes, timers, the user) goes through [`SyncEngine::sync`].
pub struct SyncEngine<R: RemoteService> {
    remote: R,
    store: SharedStore,
    reporter: SyncStatusReporter,
    retry: RetryPolicy,
    run_lock: tokio::sync::Mutex<()>,
    poisoned: Mutex<Option<String>>,
    connectivity: Option<watch::Receiver<bool>>,
    store_file: Option<StoreFile>,
    last_outcome: Mutex<Option<SyncOutcome>>,
}

impl<R: RemoteService> SyncEngine<R> {
    pub fn new(remote: R, store: SharedStore, reporter: SyncStatusReporter) -> Self {
        Self {
            remote,
            store,
            reporter,
            retry: RetryPolicy::default(),
            run_lock: tokio::sync::Mutex::new(()),
            poisoned: Mutex::new(None),
            connectivity: None,
            store_file: None,
            last_outcome: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Skips non-forced syncs while the receiver reports offline.
    pub fn with_connectivity(mut self, online: watch::Receiver<bool>) -> Self {
        self.connectivity = Some(online);
        self
    }

    /// Saves the store to `file` after every sync.
    pub fn with_store_file(mut self, file: StoreFile) -> Self {
        self.store_file = Some(file);
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn reporter(&self) -> &SyncStatusReporter {
        &self.reporter
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    fn is_online(&self) -> bool {
        self.connectivity
            .as_ref()
            .map(|online| *online.borrow())
            .unwrap_or(true)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poison_reason().is_some()
    }

    fn poison_reason(&self) -> Option<String> {
        self.poisoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Disables sync until [`SyncEngine::reset_store`] is called.
    pub fn poison(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!("Sync disabled, local storage corrupted: {}", reason);
        *self.poisoned.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    pub fn last_outcome(&self) -> Option<SyncOutcome> {
        self.last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Writes the store to its file, if one is attached.
    pub fn persist(&self) -> Result<(), StoreError> {
        match &self.store_file {
            Some(file) => self.store.with(|store| file.save(store)),
            None => Ok(()),
        }
    }

    /// Clears local data and the sync cursor so the next sync pulls
    /// everything. Also lifts a corruption lock.
    pub async fn reset_store(&self) -> Result<(), StoreError> {
        let _guard = self.run_lock.lock().await;
        self.store.with(LocalStore::reset);
        *self.poisoned.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.persist()?;
        self.reporter.dismiss();
        tracing::info!("Local store reset");
        Ok(())
    }

    /// Runs one pull/push pass.
    ///
    /// Without `force`, returns at once if a sync is already running or the
    /// client is offline. With `force`, waits for a running sync to finish
    /// and then runs.
    pub async fn sync(&self, force: bool) -> SyncOutcome {
        if let Some(outcome) = self.refuse_if_poisoned() {
            return outcome;
        }
        if !force && !self.is_online() {
            tracing::debug!("Offline, skipping sync");
            return SyncOutcome::skipped(SkipReason::Offline);
        }

        let _guard = if force {
            self.run_lock.lock().await
        } else {
            match self.run_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::debug!("Sync already running");
                    return SyncOutcome::skipped(SkipReason::AlreadyRunning);
                }
            }
        };
        if let Some(outcome) = self.refuse_if_poisoned() {
            return outcome;
        }

        self.reporter.begin();
        tracing::info!("Sync started");

        let mut outcome = SyncOutcome::started();
        if let Err(e) = self.run(&mut outcome).await {
            if let SyncError::StorageCorruption(reason) = &e {
                self.poison(reason.clone());
            }
            outcome.note_error(&e);
        }

        let (failed, pending, first_failure) = self.store.with(|store| {
            let journal = store.journal();
            (
                journal.count_with_status(MutationStatus::Failed),
                journal.count_with_status(MutationStatus::Pending),
                journal
                    .iter()
                    .filter(|r| r.status == MutationStatus::Failed)
                    .find_map(|r| r.failure.clone()),
            )
        });
        outcome.outstanding_failed = failed;
        outcome.outstanding_pending = pending;
        if outcome.error.is_none() {
            outcome.error = first_failure;
        }

        if let Err(e) = self.persist() {
            tracing::warn!("Failed to save local store: {}", e);
            outcome.note_error(&SyncError::from(e));
        }

        outcome.finished_at = Utc::now();
        if outcome.is_success() {
            tracing::info!("Sync finished: {}", outcome.summary());
        } else {
            tracing::warn!(
                "Sync finished with errors: {}{}",
                outcome.summary(),
                outcome
                    .error
                    .as_ref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
        }

        self.reporter.finish(&outcome);
        *self.last_outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
        outcome
    }

    fn refuse_if_poisoned(&self) -> Option<SyncOutcome> {
        let reason = self.poison_reason()?;
        let mut outcome = SyncOutcome::skipped(SkipReason::StorageCorrupted);
        outcome.note_error(&SyncError::StorageCorruption(reason));
        self.reporter.finish(&outcome);
        Some(outcome)
    }

    async fn run(&self, outcome: &mut SyncOutcome) -> Result<(), SyncError> {
        self.store.with(|store| store.check_integrity())?;
        self.pull(outcome).await?;
        self.push(outcome).await
    }

    async fn pull(&self, outcome: &mut SyncOutcome) -> Result<(), SyncError> {
        let since = self.store.with(|store| store.cursor());
        let (response, full) = match self.fetch_with_retry(since).await {
            Err(SyncError::CursorExpired) if since.is_some() => {
                tracing::info!("Sync cursor expired, pulling full snapshot");
                (self.fetch_with_retry(None).await?, true)
            }
            other => (other?, since.is_none()),
        };
        outcome.full_pull = full;
        let ChangesResponse {
            entities,
            server_time,
        } = response;

        let stats = self.store.with(|store| {
            let present: HashSet<EntityKey> = entities
                .iter()
                .filter(|e| !e.deleted)
                .map(Entity::key)
                .collect();
            let mut stats = store.apply_remote_snapshot(entities);
            if full {
                stats.removed += store.retain_confirmed(&present);
            }
            store.set_cursor(Some(server_time));
            stats
        });

        tracing::debug!(
            "Pulled {} change(s), {} removed, {} stale",
            stats.total_applied(),
            stats.removed,
            stats.stale
        );
        outcome.pulled = stats;
        outcome.cursor_advanced = true;
        Ok(())
    }

    async fn fetch_with_retry(
        &self,
        since: Option<chrono::DateTime<Utc>>,
    ) -> Result<ChangesResponse, SyncError> {
        let mut attempt = 0;
        loop {
            match self.remote.fetch_changes(since).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if self.retry.exhausted(attempt) {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "Pulling changes failed (attempt {}), retrying in {:?}: {}",
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pushes every pending group. Groups held back by a reference to an
    /// unconfirmed entity get another pass as long as some of them progress.
    async fn push(&self, outcome: &mut SyncOutcome) -> Result<(), SyncError> {
        let mut groups = self.store.with(|store| store.pending_batch());
        loop {
            let attempted = groups.len();
            let mut waiting = Vec::new();
            for group in groups {
                if let Some(op_id) = self.push_group(&group, outcome).await? {
                    waiting.push((group, op_id));
                }
            }
            if waiting.is_empty() || waiting.len() == attempted {
                outcome.deferred = waiting.into_iter().map(|(_, op_id)| op_id).collect();
                return Ok(());
            }
            groups = waiting.into_iter().map(|(group, _)| group).collect();
        }
    }

    /// Returns the op id of the record the group stopped at if it has to
    /// wait for another entity to be confirmed.
    async fn push_group(
        &self,
        group: &PendingGroup,
        outcome: &mut SyncOutcome,
    ) -> Result<Option<String>, SyncError> {
        for op_id in &group.op_ids {
            // Earlier results may have dropped or renamed this record.
            let Some(record) = self.store.with(|store| store.record(op_id).cloned()) else {
                continue;
            };
            if record.status != MutationStatus::Pending {
                break;
            }
            if let Some(target) = self.store.with(|store| store.unconfirmed_reference(&record)) {
                tracing::debug!(
                    "Deferring {} of {} until {} is confirmed",
                    record.operation,
                    record.key(),
                    target
                );
                return Ok(Some(record.op_id));
            }

            match self.push_record(op_id, outcome).await? {
                Flow::Continue => {}
                Flow::BlockEntity => break,
            }
        }
        Ok(None)
    }

    async fn push_record(
        &self,
        op_id: &str,
        outcome: &mut SyncOutcome,
    ) -> Result<Flow, SyncError> {
        let mut record = self.store.with(|store| store.begin_attempt(op_id))?;

        loop {
            match self.send_one(record.clone()).await {
                Ok(result) => {
                    let flow = self.apply_result(&record, result, outcome);
                    if flow.is_err() {
                        self.store.with(|store| store.release(op_id)).ok();
                    }
                    return flow;
                }
                Err(SyncError::Validation(reason)) => {
                    self.reject(&record, reason, outcome)?;
                    return Ok(Flow::BlockEntity);
                }
                Err(e) if e.is_transient() => {
                    let attempts = self
                        .store
                        .with(|store| store.record_transient_failure(op_id, e.to_failure()))?;
                    if self.retry.exhausted(attempts) {
                        tracing::warn!(
                            "Giving up on {} of {} after {} attempts: {}",
                            record.operation,
                            record.key(),
                            attempts,
                            e
                        );
                        self.store
                            .with(|store| store.mark_mutation_failed(op_id, e.to_failure()))?;
                        outcome.failed.push(op_id.to_string());
                        outcome.note_error(&e);
                        return Ok(Flow::BlockEntity);
                    }

                    let delay = self.retry.delay_for(attempts);
                    tracing::warn!(
                        "Pushing {} of {} failed (attempt {}), retrying in {:?}: {}",
                        record.operation,
                        record.key(),
                        attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    record = self.store.with(|store| store.begin_attempt(op_id))?;
                }
                Err(e) => {
                    self.store.with(|store| store.release(op_id))?;
                    return Err(e);
                }
            }
        }
    }

    async fn send_one(&self, record: MutationRecord) -> Result<MutationResult, SyncError> {
        let op_id = record.op_id.clone();
        let response = self.remote.push_mutations(vec![record]).await?;
        response
            .results
            .into_iter()
            .find(|result| result.op_id == op_id)
            .ok_or_else(|| SyncError::Protocol(format!("no result for mutation {}", op_id)))
    }

    fn apply_result(
        &self,
        record: &MutationRecord,
        result: MutationResult,
        outcome: &mut SyncOutcome,
    ) -> Result<Flow, SyncError> {
        match result.status {
            ResultStatus::Confirmed => {
                let entity = server_entity(record, result.entity)?;
                if record.operation != Operation::Create && entity.id != record.entity_id {
                    return Err(SyncError::Protocol(format!(
                        "server confirmed {} as '{}'",
                        record.key(),
                        entity.id
                    )));
                }
                self.store
                    .with(|store| store.reconcile_confirmed_mutation(&record.op_id, &entity))?;
                *outcome.pushed.entry(record.entity_type).or_default() += 1;
                Ok(Flow::Continue)
            }
            ResultStatus::Conflict => {
                let entity = server_entity(record, result.entity)?;
                let notice = self
                    .store
                    .with(|store| store.resolve_conflict(&record.op_id, &entity))?;
                if let Some(notice) = notice {
                    tracing::info!(
                        "Conflict on {}, kept server version {}",
                        notice.key,
                        notice.server_version
                    );
                    outcome.conflicts.push(notice);
                }
                Ok(Flow::Continue)
            }
            ResultStatus::Rejected => {
                let reason = result
                    .reason
                    .unwrap_or_else(|| "rejected by server".to_string());
                self.reject(record, reason, outcome)?;
                Ok(Flow::BlockEntity)
            }
        }
    }

    fn reject(
        &self,
        record: &MutationRecord,
        reason: String,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        let error = SyncError::Validation(reason.clone());
        tracing::warn!("Server rejected {} of {}: {}", record.operation, record.key(), reason);
        self.store
            .with(|store| store.mark_mutation_failed(&record.op_id, error.to_failure()))?;
        outcome.rejections.push(Rejection {
            op_id: record.op_id.clone(),
            key: record.key(),
            reason,
        });
        outcome.note_error(&error);
        Ok(())
    }
}

fn server_entity(record: &MutationRecord, entity: Option<Entity>) -> Result<Entity, SyncError> {
    let entity = entity.ok_or_else(|| {
        SyncError::Protocol(format!("no entity in result for mutation {}", record.op_id))
    })?;
    if entity.entity_type != record.entity_type {
        return Err(SyncError::Protocol(format!(
            "result for {} carries a {}",
            record.key(),
            entity.entity_type
        )));
    }
    Ok(entity)
}
