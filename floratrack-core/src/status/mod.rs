//! Observable sync status for the UI layer.
//!
//! ```text
//! Idle --begin--> Syncing --finish--> Success --(linger)--> Idle
//!                                 \-> Error --dismiss/begin--> ...
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::sync::{ErrorKind, RunStatus, SkipReason, SyncFailure, SyncOutcome};

/// How long Success is shown before falling back to Idle.
pub const DEFAULT_SUCCESS_LINGER: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Success,
    Error,
}

impl SyncPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "Idle",
            SyncPhase::Syncing => "Syncing...",
            SyncPhase::Success => "Synced",
            SyncPhase::Error => "Sync failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub phase: SyncPhase,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<SyncFailure>,
    /// Conflicts reported by the last completed sync.
    pub conflicts: usize,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_sync_time: None,
            last_error: None,
            conflicts: 0,
        }
    }
}

impl SyncState {
    pub fn describe_last_sync(&self, now: DateTime<Utc>) -> String {
        describe_last_sync(self.last_sync_time, now)
    }
}

/// Renders a last-sync time the way the status widget shows it.
pub fn describe_last_sync(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(last) = last else {
        return "Never".to_string();
    };

    let minutes = (now - last).num_minutes();
    if minutes < 1 {
        "Just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 24 * 60 {
        format!("{}h ago", minutes / 60)
    } else {
        last.format("%Y-%m-%d").to_string()
    }
}

struct Inner {
    tx: watch::Sender<SyncState>,
    generation: AtomicU64,
    success_linger: Duration,
}

/// Publishes [`SyncState`] changes driven by the sync engine.
#[derive(Clone)]
pub struct SyncStatusReporter {
    inner: Arc<Inner>,
}

impl Default for SyncStatusReporter {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_LINGER)
    }
}

impl SyncStatusReporter {
    pub fn new(success_linger: Duration) -> Self {
        let (tx, _) = watch::channel(SyncState::default());
        Self {
            inner: Arc::new(Inner {
                tx,
                generation: AtomicU64::new(0),
                success_linger,
            }),
        }
    }

    /// Seeds the last sync time, e.g. from a persisted store.
    pub fn with_last_sync(self, last_sync_time: Option<DateTime<Utc>>) -> Self {
        self.inner
            .tx
            .send_modify(|state| state.last_sync_time = last_sync_time);
        self
    }

    pub fn state(&self) -> SyncState {
        self.inner.tx.borrow().clone()
    }

    pub fn begin(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.tx.send_modify(|state| {
            state.phase = SyncPhase::Syncing;
            state.last_error = None;
        });
    }

    /// Moves to Success or Error according to a finished run.
    pub fn finish(&self, outcome: &SyncOutcome) {
        if matches!(
            outcome.status,
            RunStatus::Skipped(SkipReason::AlreadyRunning | SkipReason::Offline)
        ) {
            return;
        }

        let success = outcome.is_success();
        self.inner.tx.send_modify(|state| {
            if outcome.cursor_advanced {
                state.last_sync_time = Some(outcome.finished_at);
            }
            state.conflicts = outcome.conflicts.len();
            if success {
                state.phase = SyncPhase::Success;
                state.last_error = None;
            } else {
                state.phase = SyncPhase::Error;
                state.last_error = Some(outcome.error.clone().unwrap_or_else(|| {
                    if outcome.outstanding_failed > 0 {
                        SyncFailure {
                            kind: ErrorKind::Validation,
                            message: format!(
                                "{} mutation(s) need attention",
                                outcome.outstanding_failed
                            ),
                        }
                    } else {
                        SyncFailure {
                            kind: ErrorKind::Transient,
                            message: format!(
                                "{} mutation(s) wait for referenced entities",
                                outcome.deferred.len()
                            ),
                        }
                    }
                }));
            }
        });

        if success {
            self.schedule_idle();
        }
    }

    /// Clears an Error back to Idle.
    pub fn dismiss(&self) {
        self.inner.tx.send_if_modified(|state| {
            if state.phase != SyncPhase::Error {
                return false;
            }
            state.phase = SyncPhase::Idle;
            state.last_error = None;
            true
        });
    }

    fn schedule_idle(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);

        handle.spawn(async move {
            tokio::time::sleep(inner.success_linger).await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            inner.tx.send_if_modified(|state| {
                if state.phase != SyncPhase::Success {
                    return false;
                }
                state.phase = SyncPhase::Idle;
                true
            });
        });
    }

    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.inner.tx.subscribe()
    }

    /// Calls `listener` with the current state and every later change until
    /// the returned [`Subscription`] is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + 'static,
    {
        let mut rx = self.watch();
        let handle = tokio::spawn(async move {
            let state = rx.borrow_and_update().clone();
            listener(&state);
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                listener(&state);
            }
        });
        Subscription { handle }
    }
}

/// Listener registration. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
