//! Online/offline detection.
//!
//! Raw observations come from [`ConnectivityMonitor::observe`] or from a
//! [`Probe`] polled in the background. Going offline is declared at once;
//! going online only after the observation held for the stability window.

use chrono::{DateTime, Utc};
use reqwest::Client;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::sync::{build_http_url, HEALTH_PATH};

pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(2);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub online: bool,
    pub at: DateTime<Utc>,
}

/// Something that can tell whether the sync server is reachable.
pub trait Probe: Send + Sync + 'static {
    fn check(&self) -> impl Future<Output = bool> + Send;
}

/// Probes `GET /health` on the sync server.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(server_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: build_http_url(server_url, HEALTH_PATH),
        }
    }
}

impl Probe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Health probe failed: {}", e);
                false
            }
        }
    }
}

struct Shared {
    raw_tx: watch::Sender<bool>,
    state_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<ConnectivityEvent>,
}

impl Shared {
    fn observe(&self, online: bool) {
        self.raw_tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    fn declare(&self, online: bool) {
        self.state_tx.send_replace(online);
        if online {
            tracing::info!("Connectivity restored");
        } else {
            tracing::info!("Connectivity lost");
        }
        // No receivers is fine.
        let _ = self.events_tx.send(ConnectivityEvent {
            online,
            at: Utc::now(),
        });
    }
}

/// Tracks whether the client is online and emits one event per transition.
///
/// Must be created from within a Tokio runtime.
pub struct ConnectivityMonitor {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, stability_window: Duration) -> Self {
        let (raw_tx, _) = watch::channel(initially_online);
        let (state_tx, _) = watch::channel(initially_online);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            raw_tx,
            state_tx,
            events_tx,
        });

        let debounce = tokio::spawn(debounce(Arc::clone(&shared), stability_window));
        Self {
            shared,
            tasks: Mutex::new(vec![debounce]),
        }
    }

    /// Feeds a raw observation, e.g. from a platform network hook.
    pub fn observe(&self, online: bool) {
        self.shared.observe(online);
    }

    pub fn is_online(&self) -> bool {
        *self.shared.state_tx.borrow()
    }

    /// Transition events. The receiver unsubscribes when dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Debounced online state.
    pub fn watch_state(&self) -> watch::Receiver<bool> {
        self.shared.state_tx.subscribe()
    }

    /// Polls `probe` every `interval` and feeds the result as an observation.
    pub fn spawn_probe<P: Probe>(&self, probe: P, interval: Duration) {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.check().await;
                shared.observe(online);
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Stops the debounce and probe tasks.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn debounce(shared: Arc<Shared>, stability_window: Duration) {
    let mut raw_rx = shared.raw_tx.subscribe();

    loop {
        let observed = *raw_rx.borrow_and_update();
        let current = *shared.state_tx.borrow();

        if observed != current {
            if !observed {
                shared.declare(false);
            } else {
                let deadline = Instant::now() + stability_window;
                loop {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            shared.declare(true);
                            break;
                        }
                        changed = raw_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if !*raw_rx.borrow_and_update() {
                                break;
                            }
                        }
                    }
                }
            }
            continue;
        }

        if raw_rx.changed().await.is_err() {
            return;
        }
    }
}
