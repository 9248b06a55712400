use chrono::{Local, Utc};
use clap::Args;
use floratrack_core::{HttpProbe, SyncPhase, SyncSettings, SyncState};

use crate::config::Config;
use crate::sync::connect;

/// Stay running: sync on reconnect and periodically, printing status changes
#[derive(Args)]
pub struct WatchCommand {}

impl WatchCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.watch(config))
    }

    async fn watch(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let settings = SyncSettings {
            auto_sync: true,
            ..config.sync.settings()
        };
        let service = connect(config, &settings).await?;
        let probe = HttpProbe::new(
            service.engine().remote().server_url(),
            config.sync.request_timeout(),
        );
        service.watch_connectivity(probe);

        let mut connectivity = service.monitor().subscribe();
        let subscription = service.subscribe(|state| println!("{}", status_line(state)));

        println!("Watching for changes. Press Ctrl-C to stop.");
        service.sync(false).await;

        loop {
            tokio::select! {
                event = connectivity.recv() => match event {
                    Ok(event) => println!(
                        "[{}] {}",
                        event.at.with_timezone(&Local).format("%H:%M:%S"),
                        if event.online { "online" } else { "offline" }
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        subscription.unsubscribe();
        service.shutdown();
        println!("Stopped.");
        Ok(())
    }
}

fn status_line(state: &SyncState) -> String {
    let now = Utc::now();
    let mut line = format!(
        "[{}] {:<8} last sync: {}",
        now.with_timezone(&Local).format("%H:%M:%S"),
        state.phase.label(),
        state.describe_last_sync(now)
    );
    if state.phase == SyncPhase::Error {
        if let Some(error) = &state.last_error {
            line.push_str(&format!(" ({})", error));
        }
    }
    if state.conflicts > 0 {
        line.push_str(&format!(", {} conflict(s)", state.conflicts));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use floratrack_core::{ErrorKind, SyncFailure};

    #[test]
    fn test_status_line_shows_error() {
        let state = SyncState {
            phase: SyncPhase::Error,
            last_sync_time: None,
            last_error: Some(SyncFailure {
                kind: ErrorKind::Auth,
                message: "invalid API key".to_string(),
            }),
            conflicts: 0,
        };

        let line = status_line(&state);
        assert!(line.contains("Never"));
        assert!(line.contains("[auth] invalid API key"));
    }
}
