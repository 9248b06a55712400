//! Wiring of store, monitor, engine and status for an application.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::connectivity::{
    ConnectivityMonitor, Probe, DEFAULT_PROBE_INTERVAL, DEFAULT_STABILITY_WINDOW,
};
use crate::models::{EntityType, LocalMutation, MutationRecord};
use crate::status::{Subscription, SyncState, SyncStatusReporter, DEFAULT_SUCCESS_LINGER};
use crate::store::{LocalStore, SharedStore, StoreError, StoreFile};
use crate::sync::{
    AutoSync, ErrorKind, RemoteService, RetryPolicy, SkipReason, SyncEngine, SyncFailure,
    SyncOutcome, DEFAULT_PERIODIC_INTERVAL,
};

/// Tunables of the sync subsystem.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub retry: RetryPolicy,
    pub success_linger: Duration,
    pub stability_window: Duration,
    pub probe_interval: Duration,
    /// `None` disables the periodic sync.
    pub periodic_interval: Option<Duration>,
    /// Sync automatically on reconnect and on the periodic timer.
    pub auto_sync: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            success_linger: DEFAULT_SUCCESS_LINGER,
            stability_window: DEFAULT_STABILITY_WINDOW,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            periodic_interval: Some(DEFAULT_PERIODIC_INTERVAL),
            auto_sync: true,
        }
    }
}

/// The sync subsystem as seen by the UI layer.
///
/// Construct one at startup with [`SyncService::start`] or
/// [`SyncService::open`] and call [`SyncService::shutdown`] on exit.
pub struct SyncService<R: RemoteService> {
    store: SharedStore,
    reporter: SyncStatusReporter,
    monitor: ConnectivityMonitor,
    engine: Arc<SyncEngine<R>>,
    auto_sync: Option<AutoSync>,
    probe_interval: Duration,
}

impl<R: RemoteService> SyncService<R> {
    /// Starts the subsystem around an already loaded store.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        remote: R,
        store: LocalStore,
        store_file: Option<StoreFile>,
        settings: &SyncSettings,
        initially_online: bool,
    ) -> Self {
        let reporter = SyncStatusReporter::new(settings.success_linger).with_last_sync(store.cursor());
        let store = SharedStore::new(store);
        let monitor = ConnectivityMonitor::new(initially_online, settings.stability_window);

        let mut engine = SyncEngine::new(remote, store.clone(), reporter.clone())
            .with_retry_policy(settings.retry)
            .with_connectivity(monitor.watch_state());
        if let Some(file) = store_file {
            engine = engine.with_store_file(file);
        }
        let engine = Arc::new(engine);

        let auto_sync = settings.auto_sync.then(|| {
            AutoSync::spawn(
                Arc::clone(&engine),
                monitor.subscribe(),
                settings.periodic_interval,
            )
        });

        Self {
            store,
            reporter,
            monitor,
            engine,
            auto_sync,
            probe_interval: settings.probe_interval,
        }
    }

    /// Loads the store from `file` and starts the subsystem.
    ///
    /// A corrupted file starts with an empty store and sync disabled until
    /// [`SyncService::reset_store`] is called.
    pub fn open(
        remote: R,
        file: StoreFile,
        settings: &SyncSettings,
        initially_online: bool,
    ) -> Result<Self, StoreError> {
        let (store, corruption) = match file.load() {
            Ok(store) => (store.unwrap_or_default(), None),
            Err(StoreError::Corruption(reason)) => (LocalStore::new(), Some(reason)),
            Err(e) => return Err(e),
        };

        let service = Self::start(remote, store, Some(file), settings, initially_online);
        if let Some(reason) = corruption {
            service.engine.poison(reason);
            let mut outcome = SyncOutcome::skipped(SkipReason::StorageCorrupted);
            outcome.error = Some(SyncFailure {
                kind: ErrorKind::StorageCorruption,
                message: "local store could not be loaded".to_string(),
            });
            service.reporter.finish(&outcome);
        }
        Ok(service)
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn reporter(&self) -> &SyncStatusReporter {
        &self.reporter
    }

    /// Starts polling `probe` to feed the connectivity monitor.
    pub fn watch_connectivity<P: Probe>(&self, probe: P) {
        self.monitor.spawn_probe(probe, self.probe_interval);
    }

    pub fn get_sync_state(&self) -> SyncState {
        self.reporter.state()
    }

    pub async fn sync(&self, force: bool) -> SyncOutcome {
        self.engine.sync(force).await
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + 'static,
    {
        self.reporter.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.reporter.watch()
    }

    /// Applies a local write and saves the store.
    pub fn apply_local_mutation(
        &self,
        entity_type: EntityType,
        mutation: LocalMutation,
    ) -> Result<String, StoreError> {
        let id = self
            .store
            .with(|store| store.apply_local_mutation(entity_type, mutation))?;
        self.persist()?;
        Ok(id)
    }

    pub fn retry_failed(&self, op_id: &str) -> Result<(), StoreError> {
        self.store.with(|store| store.retry_failed(op_id))?;
        self.persist()
    }

    pub fn discard_failed(&self, op_id: &str) -> Result<MutationRecord, StoreError> {
        let record = self.store.with(|store| store.discard_failed(op_id))?;
        self.persist()?;
        Ok(record)
    }

    pub async fn reset_store(&self) -> Result<(), StoreError> {
        self.engine.reset_store().await
    }

    fn persist(&self) -> Result<(), StoreError> {
        // Keep a corrupted file around until the user resets.
        if self.engine.is_poisoned() {
            return Ok(());
        }
        self.engine.persist()
    }

    /// Stops background tasks and saves the store.
    pub fn shutdown(mut self) {
        if let Some(auto_sync) = self.auto_sync.take() {
            auto_sync.stop();
        }
        self.monitor.shutdown();
        if let Err(e) = self.persist() {
            tracing::warn!("Failed to save local store on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fields, MutationStatus};
    use crate::status::SyncPhase;
    use crate::sync::fake::FakeRemote;
    use crate::sync::RunStatus;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn crop_fields() -> Fields {
        json!({
            "name": "Avocado",
            "variety": "Hass",
            "propagation_method": "grafting",
            "current_stage": "seedling",
            "planted_date": "2024-03-01"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            periodic_interval: None,
            ..SyncSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_create_syncs_when_back_online() {
        let remote = FakeRemote::default();
        let service = SyncService::start(remote.clone(), LocalStore::new(), None, &settings(), false);

        let temp_id = service
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Create {
                    fields: crop_fields(),
                },
            )
            .unwrap();
        let offline = service.sync(false).await;
        assert_eq!(offline.status, RunStatus::Skipped(SkipReason::Offline));
        assert_eq!(remote.server().push_calls, 0);

        service.monitor().observe(true);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        service.store().with(|store| {
            assert!(store.journal().is_empty());
            assert!(store.get(EntityType::Crop, &temp_id).is_none());
            let crop = store.get(EntityType::Crop, "crop-1").unwrap();
            assert!(!crop.dirty);
        });
        let state = service.get_sync_state();
        assert_eq!(state.phase, SyncPhase::Success);
        assert!(state.last_sync_time.is_some());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(service.get_sync_state().phase, SyncPhase::Idle);
        service.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sync() {
        let remote = FakeRemote::default();
        let settings = SyncSettings {
            periodic_interval: Some(Duration::from_secs(300)),
            ..SyncSettings::default()
        };
        let service = SyncService::start(remote.clone(), LocalStore::new(), None, &settings, true);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(remote.server().pull_calls, 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(remote.server().pull_calls, 1);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_local_writes_are_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let file = StoreFile::in_dir(temp_dir.path());
        let service =
            SyncService::open(FakeRemote::default(), file.clone(), &settings(), false).unwrap();

        let id = service
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Create {
                    fields: crop_fields(),
                },
            )
            .unwrap();
        service.shutdown();

        let loaded = file.load().unwrap().unwrap();
        assert!(loaded.get(EntityType::Crop, &id).is_some());
    }

    #[tokio::test]
    async fn test_corrupted_file_disables_sync_until_reset() {
        let temp_dir = TempDir::new().unwrap();
        let file = StoreFile::in_dir(temp_dir.path());
        fs::write(file.path(), b"garbage").unwrap();

        let remote = FakeRemote::default();
        let service = SyncService::open(remote.clone(), file.clone(), &settings(), true).unwrap();

        let state = service.get_sync_state();
        assert_eq!(state.phase, SyncPhase::Error);
        assert_eq!(
            state.last_error.unwrap().kind,
            ErrorKind::StorageCorruption
        );
        let outcome = service.sync(true).await;
        assert_eq!(
            outcome.status,
            RunStatus::Skipped(SkipReason::StorageCorrupted)
        );
        assert_eq!(fs::read(file.path()).unwrap(), b"garbage");

        service.reset_store().await.unwrap();
        assert!(service.sync(false).await.is_success());
        assert!(file.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_and_discard_failed() {
        let remote = FakeRemote::default();
        let service = SyncService::start(remote.clone(), LocalStore::new(), None, &settings(), true);
        let id = service
            .apply_local_mutation(
                EntityType::Crop,
                LocalMutation::Create {
                    fields: crop_fields(),
                },
            )
            .unwrap();
        remote.server().reject.insert(id.clone());

        let outcome = service.sync(false).await;
        assert_eq!(outcome.rejections.len(), 1);
        let op_id = outcome.rejections[0].op_id.clone();

        service.retry_failed(&op_id).unwrap();
        assert_eq!(
            service
                .store()
                .with(|s| s.record(&op_id).map(|r| r.status)),
            Some(MutationStatus::Pending)
        );

        service.sync(false).await;
        let discarded = service.discard_failed(&op_id).unwrap();
        assert_eq!(discarded.op_id, op_id);
        assert!(service.store().with(|s| s.get(EntityType::Crop, &id).is_none()));

        assert!(service.sync(false).await.is_success());
        service.shutdown();
    }
}
