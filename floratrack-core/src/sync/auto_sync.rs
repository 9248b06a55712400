//! Background sync triggers.

use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{RemoteService, SyncEngine};
use crate::connectivity::ConnectivityEvent;

/// Periodic sync interval used when none is configured.
pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runs `sync(false)` when connectivity comes back and, optionally, on a
/// fixed interval. Stops when dropped.
pub struct AutoSync {
    handle: JoinHandle<()>,
}

impl AutoSync {
    pub fn spawn<R: RemoteService>(
        engine: Arc<SyncEngine<R>>,
        mut events: broadcast::Receiver<ConnectivityEvent>,
        periodic: Option<Duration>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = periodic.map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let tick = async {
                    match ticker.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) if event.online => {
                            tracing::debug!("Back online, syncing");
                            engine.sync(false).await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!("Missed {} connectivity event(s)", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = tick => {
                        tracing::debug!("Periodic sync");
                        engine.sync(false).await;
                    }
                }
            }
        });

        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(self) {}
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
