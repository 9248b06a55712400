use floratrack_core::{check_server, HttpRemote, LocalStore, StoreFile, SyncService, SyncSettings};
use std::error::Error;

use crate::config::Config;

/// Returned when a command needs the server but sync is not set up.
#[derive(Debug)]
pub struct NotConfigured;

impl std::fmt::Display for NotConfigured {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sync is not configured. Set sync.server_url and sync.api_key in the config file \
             or FLORA_SYNC_URL and FLORA_SYNC_API_KEY."
        )
    }
}

impl Error for NotConfigured {}

pub fn store_file(config: &Config) -> StoreFile {
    StoreFile::in_dir(&config.data_dir.value)
}

/// Loads the local store, or an empty one if none was saved yet.
pub fn open_store(config: &Config) -> Result<(StoreFile, LocalStore), Box<dyn Error>> {
    let file = store_file(config);
    match file.load() {
        Ok(store) => Ok((file, store.unwrap_or_default())),
        Err(e) if e.is_corruption() => Err(format!(
            "{}\nRun 'flora reset' to discard local data and pull from the server.",
            e
        )
        .into()),
        Err(e) => Err(e.into()),
    }
}

pub fn remote(config: &Config) -> Result<HttpRemote, Box<dyn Error>> {
    let (Some(url), Some(key)) = (&config.sync.server_url, &config.sync.api_key) else {
        return Err(NotConfigured.into());
    };
    Ok(HttpRemote::new(
        url.clone(),
        Some(key.clone()),
        config.sync.request_timeout(),
    )?)
}

/// Opens the sync service on the local store.
///
/// Checks server reachability first so that the service starts with the
/// right connectivity state. Must be called from within a Tokio runtime.
pub async fn connect(
    config: &Config,
    settings: &SyncSettings,
) -> Result<SyncService<HttpRemote>, Box<dyn Error>> {
    let remote = remote(config)?;
    let online = check_server(remote.server_url()).await;
    if !online {
        tracing::info!("Server {} unreachable", remote.server_url());
    }
    Ok(SyncService::open(
        remote,
        store_file(config),
        settings,
        online,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSource, ConfigValue, SyncConfig};
    use floratrack_core::{EntityType, Fields, LocalMutation};
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            data_dir: ConfigValue::new(dir.path().to_path_buf(), ConfigSource::Default),
            config_file: None,
            sync: SyncConfig::default(),
        }
    }

    #[test]
    fn test_open_store_without_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let (file, store) = open_store(&config(&temp_dir)).unwrap();

        assert!(!file.exists());
        assert!(store.journal().is_empty());
    }

    #[test]
    fn test_open_store_reads_saved_store() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        let (file, mut store) = open_store(&config).unwrap();
        let fields: Fields = json!({"task": "Pot up", "due_date": "2024-06-01"})
            .as_object()
            .cloned()
            .unwrap();
        let id = store
            .apply_local_mutation(EntityType::Task, LocalMutation::Create { fields })
            .unwrap();
        file.save(&store).unwrap();

        let (_, reopened) = open_store(&config).unwrap();
        assert!(reopened.get(EntityType::Task, &id).is_some());
        assert_eq!(reopened.journal().len(), 1);
    }

    #[test]
    fn test_corrupted_store_suggests_reset() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        std::fs::write(store_file(&config).path(), "{").unwrap();

        let err = open_store(&config).unwrap_err();
        assert!(err.to_string().contains("flora reset"));
    }

    #[test]
    fn test_remote_requires_configuration() {
        let temp_dir = TempDir::new().unwrap();
        let err = remote(&config(&temp_dir)).unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
