//! Auto-sync for CLI commands.
//!
//! Syncs before read operations and after write operations when
//! `auto_sync` is enabled in the configuration.

use floratrack_core::check_server;

use crate::config::Config;
use crate::sync::connect;

/// Performs auto-sync if enabled and the server is reachable.
///
/// Errors are reported on stderr and otherwise ignored: the CLI keeps
/// working offline and queued changes go out on a later sync.
pub fn try_auto_sync(config: &Config) {
    if !config.sync.auto_sync || !config.sync.is_configured() {
        return;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(_) => return,
    };

    rt.block_on(async {
        let Some(url) = config.sync.server_url.as_ref() else {
            return;
        };

        // Fast fail before loading anything
        if !check_server(url).await {
            eprintln!("Auto-sync: server unreachable, changes stay queued");
            return;
        }

        let settings = floratrack_core::SyncSettings {
            auto_sync: false,
            ..config.sync.settings()
        };
        let service = match connect(config, &settings).await {
            Ok(service) => service,
            Err(e) => {
                eprintln!("Auto-sync: {}", e);
                return;
            }
        };

        let outcome = service.sync(false).await;
        if let Some(error) = &outcome.error {
            eprintln!("Auto-sync: {}", error);
        }
        service.shutdown();
    });
}
