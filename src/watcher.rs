// 👀 Catalog Watcher - debounced, single-flight resync on source changes
//
// notify callback → mpsc → select loop (events | commands | deadline | done)
// A burst of events collapses into one sync after `debounce` of quiet, capped
// at `max_batch_wait`. Events seen while a sync runs mark the state dirty and
// produce exactly one follow-up sync once it finishes.

use crate::config::WatchConfig;
use crate::error::{CatalogError, Result};
use crate::sync::{SyncOrchestrator, SyncReport};
use chrono::{DateTime, Utc};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

const FS_EVENT_REASON: &str = "fs_event";

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Outcome of one watcher-driven sync, broadcast to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct SyncUpdate {
    pub completed_at: DateTime<Utc>,
    pub reason: String,
    pub success: bool,
    pub report: Option<SyncReport>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherStatus {
    pub syncing: bool,
    pub pending_events: usize,
    pub completed_syncs: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

enum WatcherCommand {
    Trigger { reason: String },
    Shutdown,
}

// ============================================================================
// WATCH HANDLE
// ============================================================================

#[derive(Clone)]
pub struct CatalogWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    command_tx: mpsc::Sender<WatcherCommand>,
    update_tx: broadcast::Sender<SyncUpdate>,
    status_rx: watch::Receiver<WatcherStatus>,
    _watcher: RecommendedWatcher,
}

impl CatalogWatcher {
    /// Start watching the orchestrator's source location. Must be called
    /// from within a tokio runtime.
    pub fn start(orchestrator: Arc<SyncOrchestrator>, config: WatchConfig) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (update_tx, _) = broadcast::channel(32);
        let (status_tx, status_rx) = watch::channel(WatcherStatus::default());

        let watcher = create_fs_watcher(orchestrator.source().location(), event_tx, config.poll_interval())?;

        spawn_sync_loop(
            orchestrator,
            config,
            event_rx,
            command_rx,
            update_tx.clone(),
            status_tx,
        );

        Ok(CatalogWatcher {
            inner: Arc::new(WatcherInner {
                command_tx,
                update_tx,
                status_rx,
                _watcher: watcher,
            }),
        })
    }

    /// Request a sync without waiting for the debounce window
    pub async fn trigger(&self, reason: impl Into<String>) -> Result<()> {
        self.inner
            .command_tx
            .send(WatcherCommand::Trigger {
                reason: reason.into(),
            })
            .await
            .map_err(|_| CatalogError::WatcherStopped)
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SyncUpdate> {
        self.inner.update_tx.subscribe()
    }

    pub fn status(&self) -> WatcherStatus {
        self.inner.status_rx.borrow().clone()
    }
}

impl Drop for CatalogWatcher {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(WatcherCommand::Shutdown);
        }
    }
}

fn create_fs_watcher(
    location: &Path,
    sender: mpsc::Sender<notify::Result<Event>>,
    poll_interval: Duration,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sender.blocking_send(res);
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )?;

    // A source directory that does not exist yet is picked up through its parent
    let target = if location.is_dir() {
        location.to_path_buf()
    } else {
        match location.parent().filter(|p| p.is_dir()) {
            Some(parent) => {
                warn!(
                    "source directory {} missing, watching {} instead",
                    location.display(),
                    parent.display()
                );
                parent.to_path_buf()
            }
            None => {
                return Err(CatalogError::SourceUnavailable {
                    dir: location.to_path_buf(),
                })
            }
        }
    };

    watcher.watch(&target, RecursiveMode::NonRecursive)?;
    info!("watching {} for catalog changes", target.display());
    Ok(watcher)
}

// ============================================================================
// SYNC LOOP
// ============================================================================

type SyncOutcome = (String, u64, std::result::Result<SyncReport, String>);

fn spawn_sync_loop(
    orchestrator: Arc<SyncOrchestrator>,
    config: WatchConfig,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
    mut command_rx: mpsc::Receiver<WatcherCommand>,
    update_tx: broadcast::Sender<SyncUpdate>,
    status_tx: watch::Sender<WatcherStatus>,
) {
    tokio::spawn(async move {
        let mut state = DebounceState::new(config.debounce(), config.max_batch_wait());
        let mut status = WatcherStatus::default();
        let (done_tx, mut done_rx) = mpsc::channel::<SyncOutcome>(1);
        let mut in_flight = false;

        loop {
            let next_deadline = state.next_deadline();

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    if handle_event(&orchestrator, event, &mut state) {
                        status.pending_events = state.pending();
                        let _ = status_tx.send(status.clone());
                    }
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(WatcherCommand::Trigger { reason }) => {
                            state.force_run(reason);
                            status.pending_events = state.pending();
                            let _ = status_tx.send(status.clone());
                        }
                        Some(WatcherCommand::Shutdown) | None => break,
                    }
                }
                () = async {
                    if let Some(deadline) = next_deadline {
                        time::sleep_until(deadline).await;
                    }
                }, if !in_flight && next_deadline.is_some() => {
                    let reason = state.take_reason().unwrap_or_else(|| FS_EVENT_REASON.to_string());
                    debug!(reason = %reason, pending = state.pending(), "debounce elapsed, starting sync");
                    state.reset();

                    in_flight = true;
                    status.syncing = true;
                    status.pending_events = 0;
                    let _ = status_tx.send(status.clone());

                    spawn_sync(orchestrator.clone(), reason, done_tx.clone());
                }
                Some((reason, duration_ms, outcome)) = done_rx.recv() => {
                    in_flight = false;
                    status.syncing = false;
                    status.completed_syncs += 1;

                    let update = match outcome {
                        Ok(report) => {
                            status.last_success = Some(Utc::now());
                            status.last_error = None;
                            status.consecutive_failures = 0;
                            SyncUpdate {
                                completed_at: Utc::now(),
                                reason,
                                success: true,
                                report: Some(report),
                                error: None,
                                duration_ms,
                            }
                        }
                        Err(err) => {
                            error!("watcher sync failed: {err}");
                            status.last_error = Some(err.clone());
                            status.consecutive_failures += 1;
                            SyncUpdate {
                                completed_at: Utc::now(),
                                reason,
                                success: false,
                                report: None,
                                error: Some(err),
                                duration_ms,
                            }
                        }
                    };

                    status.pending_events = state.pending();
                    let _ = status_tx.send(status.clone());
                    let _ = update_tx.send(update);
                }
            }
        }

        debug!("catalog watcher loop stopped");
    });
}

fn spawn_sync(orchestrator: Arc<SyncOrchestrator>, reason: String, done_tx: mpsc::Sender<SyncOutcome>) {
    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = match tokio::task::spawn_blocking(move || orchestrator.sync()).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(join_err) => Err(format!("sync task panicked: {join_err}")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let _ = done_tx.send((reason, duration_ms, outcome)).await;
    });
}

/// Returns true when the event is relevant to the catalog
fn handle_event(
    orchestrator: &SyncOrchestrator,
    event: notify::Result<Event>,
    state: &mut DebounceState,
) -> bool {
    match event {
        Ok(evt) => {
            if matches!(evt.kind, EventKind::Access(_)) {
                return false;
            }
            let source = orchestrator.source();
            let relevant = evt.paths.iter().filter(|p| source.is_candidate(p)).count();
            if relevant == 0 {
                return false;
            }
            state.record_event(relevant);
            true
        }
        Err(err) => {
            warn!("watcher error: {err}");
            false
        }
    }
}

// ============================================================================
// DEBOUNCE STATE
// ============================================================================

struct DebounceState {
    debounce: Duration,
    max_batch: Duration,
    dirty: bool,
    pending: usize,
    last_event: Option<Instant>,
    first_event: Option<Instant>,
    reason: Option<String>,
    force_immediate: bool,
}

impl DebounceState {
    fn new(debounce: Duration, max_batch: Duration) -> Self {
        DebounceState {
            debounce,
            max_batch,
            dirty: false,
            pending: 0,
            last_event: None,
            first_event: None,
            reason: None,
            force_immediate: false,
        }
    }

    fn record_event(&mut self, count: usize) {
        let now = Instant::now();
        self.pending += count.max(1);
        self.reason.get_or_insert_with(|| FS_EVENT_REASON.to_string());
        self.last_event = Some(now);
        self.first_event.get_or_insert(now);
        self.dirty = true;
    }

    fn force_run(&mut self, reason: String) {
        self.pending += 1;
        self.reason = Some(reason);
        self.force_immediate = true;
        self.dirty = true;
    }

    fn pending(&self) -> usize {
        self.pending
    }

    fn next_deadline(&self) -> Option<time::Instant> {
        if !self.dirty {
            return None;
        }
        if self.force_immediate {
            return Some(time::Instant::now());
        }

        let quiet = self.last_event.map(|last| last + self.debounce);
        let capped = self.first_event.map(|first| first + self.max_batch);
        let deadline = match (quiet, capped) {
            (Some(q), Some(c)) => Some(q.min(c)),
            (q, c) => q.or(c),
        };

        deadline.map(time::Instant::from_std)
    }

    fn take_reason(&mut self) -> Option<String> {
        self.reason.take()
    }

    fn reset(&mut self) {
        self.dirty = false;
        self.pending = 0;
        self.last_event = None;
        self.first_event = None;
        self.reason = None;
        self.force_immediate = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_state_has_no_deadline() {
        let state = DebounceState::new(Duration::from_millis(100), Duration::from_secs(1));
        assert!(state.next_deadline().is_none());
    }

    #[test]
    fn test_burst_collapses_to_one_deadline_after_last_event() {
        let mut state = DebounceState::new(Duration::from_millis(100), Duration::from_secs(10));
        state.record_event(1);
        let first = state.next_deadline().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        state.record_event(2);
        let second = state.next_deadline().unwrap();

        assert!(second > first);
        assert_eq!(state.pending(), 3);
    }

    #[test]
    fn test_max_batch_caps_deadline() {
        let mut state = DebounceState::new(Duration::from_secs(10), Duration::from_millis(50));
        state.record_event(1);
        let deadline = state.next_deadline().unwrap();
        assert!(deadline <= time::Instant::now() + Duration::from_millis(50));
    }

    #[test]
    fn test_force_run_is_immediate_and_keeps_reason() {
        let mut state = DebounceState::new(Duration::from_secs(10), Duration::from_secs(10));
        state.force_run("manual".to_string());
        assert!(state.next_deadline().unwrap() <= time::Instant::now());
        assert_eq!(state.take_reason().as_deref(), Some("manual"));

        state.reset();
        assert!(state.next_deadline().is_none());
        assert_eq!(state.pending(), 0);
    }
}
