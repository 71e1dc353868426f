use kit_catalog::config::DEFAULT_KIT_TITLE_PATTERN;
use kit_catalog::{
    BlockParser, CatalogStore, CatalogWatcher, ChangeDetector, ChangeStrategy, ColumnLayout,
    DirectorySource, KitTitleMatcher, SourceFile, SourceProvider, SyncOrchestrator, SyncUpdate,
    WatchConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{error::RecvError, Receiver};

/// Directory source whose reads take a while, to keep a sync in flight
struct SlowSource {
    inner: DirectorySource,
    delay: Duration,
}

impl SourceProvider for SlowSource {
    fn list(&self) -> kit_catalog::Result<Vec<SourceFile>> {
        self.inner.list()
    }

    fn read(&self, file: &SourceFile) -> kit_catalog::Result<Vec<u8>> {
        std::thread::sleep(self.delay);
        self.inner.read(file)
    }

    fn location(&self) -> &Path {
        self.inner.location()
    }

    fn is_candidate(&self, path: &Path) -> bool {
        self.inner.is_candidate(path)
    }
}

fn orchestrator(source: Arc<dyn SourceProvider>) -> Arc<SyncOrchestrator> {
    let parser = BlockParser::new(
        KitTitleMatcher::new(DEFAULT_KIT_TITLE_PATTERN).expect("pattern"),
        ColumnLayout::default(),
    );
    Arc::new(SyncOrchestrator::new(
        source,
        CatalogStore::open_in_memory("BRL").expect("store"),
        ChangeDetector::new(ChangeStrategy::PerFile),
        parser,
    ))
}

fn watch_config() -> WatchConfig {
    WatchConfig {
        debounce_ms: 200,
        max_batch_wait_ms: 1_000,
        poll_interval_ms: 100,
    }
}

async fn next_update(updates: &mut Receiver<SyncUpdate>, wait: Duration) -> Option<SyncUpdate> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, updates.recv()).await {
            Ok(Ok(update)) => return Some(update),
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) | Err(_) => return None,
        }
    }
}

fn skip() -> bool {
    if std::env::var("SKIP_WATCH_FLOW").is_ok() {
        eprintln!("skipping watch_flow due to SKIP_WATCH_FLOW");
        return true;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trigger_runs_sync_and_broadcasts_report() {
    if skip() {
        return;
    }
    let temp = TempDir::new().expect("tempdir");
    std::fs::write(temp.path().join("kits.csv"), ",KIT-A,,\n,C1,Bracket,2\n").expect("write");

    let orchestrator = orchestrator(Arc::new(DirectorySource::new(temp.path(), "csv")));
    let watcher = CatalogWatcher::start(orchestrator.clone(), watch_config()).expect("start");
    let mut updates = watcher.subscribe_updates();

    watcher.trigger("manual").await.expect("trigger");
    let update = next_update(&mut updates, Duration::from_secs(5))
        .await
        .expect("update after trigger");

    assert!(update.success);
    assert_eq!(update.reason, "manual");
    let report = update.report.expect("report");
    assert!(!report.cache_hit);
    assert_eq!(report.items_written, 1);
    assert_eq!(orchestrator.store().lookup("KIT-A").unwrap().len(), 1);

    let status = watcher.status();
    assert!(!status.syncing);
    assert_eq!(status.completed_syncs, 1);
    assert!(status.last_success.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_sync_is_reported_and_counted() {
    if skip() {
        return;
    }
    let temp = TempDir::new().expect("tempdir");
    let orchestrator = orchestrator(Arc::new(DirectorySource::new(temp.path(), "csv")));
    let watcher = CatalogWatcher::start(orchestrator, watch_config()).expect("start");
    let mut updates = watcher.subscribe_updates();

    watcher.trigger("manual").await.expect("trigger");
    let update = next_update(&mut updates, Duration::from_secs(5))
        .await
        .expect("update after trigger");

    assert!(!update.success);
    assert!(update.error.unwrap().contains("no catalog source"));
    assert_eq!(watcher.status().consecutive_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_triggers_during_sync_collapse_into_one_follow_up() {
    if skip() {
        return;
    }
    let temp = TempDir::new().expect("tempdir");
    std::fs::write(temp.path().join("kits.csv"), ",KIT-A,,\n,C1,Bracket,2\n").expect("write");

    let source = SlowSource {
        inner: DirectorySource::new(temp.path(), "csv"),
        delay: Duration::from_millis(400),
    };
    let watcher = CatalogWatcher::start(orchestrator(Arc::new(source)), watch_config()).expect("start");
    let mut updates = watcher.subscribe_updates();

    watcher.trigger("first").await.expect("trigger");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(watcher.status().syncing);

    watcher.trigger("second").await.expect("trigger");
    watcher.trigger("third").await.expect("trigger");

    let first = next_update(&mut updates, Duration::from_secs(5)).await.expect("first");
    assert_eq!(first.reason, "first");
    assert!(!first.report.expect("report").cache_hit);

    let follow_up = next_update(&mut updates, Duration::from_secs(5)).await.expect("follow-up");
    assert_eq!(follow_up.reason, "third");
    assert!(follow_up.report.expect("report").cache_hit);

    assert!(next_update(&mut updates, Duration::from_millis(800)).await.is_none());
    assert_eq!(watcher.status().completed_syncs, 2);
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_burst_of_writes_coalesces_into_one_sync() {
    if skip() {
        return;
    }
    let temp = TempDir::new().expect("tempdir");
    let path = temp.path().join("kits.csv");
    std::fs::write(&path, ",KIT-A,,\n,C1,Bracket,2\n").expect("write");

    let orchestrator = orchestrator(Arc::new(DirectorySource::new(temp.path(), "csv")));
    orchestrator.sync().expect("initial sync");

    let watcher = CatalogWatcher::start(orchestrator.clone(), watch_config()).expect("start");
    let mut updates = watcher.subscribe_updates();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut content = String::from(",KIT-A,,\n,C1,Bracket,2\n");
    for i in 2..5 {
        content.push_str(&format!(",C{i},Item {i},{i}\n"));
        tokio::fs::write(&path, &content).await.expect("rewrite");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Ignored: lock files and other extensions
    std::fs::write(temp.path().join("notes.txt"), "x").expect("write notes");

    let update = next_update(&mut updates, Duration::from_secs(5))
        .await
        .expect("update after burst");
    assert!(update.success);
    assert_eq!(update.reason, "fs_event");
    assert_eq!(orchestrator.store().lookup("KIT-A").unwrap().len(), 4);

    assert!(next_update(&mut updates, Duration::from_millis(800)).await.is_none());
}
