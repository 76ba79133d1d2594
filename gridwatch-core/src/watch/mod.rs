//! Filesystem watching front end.
//!
//! [`WatchService`] owns the OS watcher, the periodic sweep, and one
//! scheduler task per watched file. OS notifications are the fast path; the
//! sweep is the slow path that re-discovers files and re-arms targets on
//! mounts where change notification is unreliable. Shutdown is acknowledged:
//! every task is awaited, not abandoned.

mod scheduler;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::error::{Result, WatchError};
use crate::pipeline::CycleRunner;
use scheduler::{TargetScheduler, Trigger};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const TRIGGER_CHANNEL_CAPACITY: usize = 64;

struct TargetHandle {
    trigger: mpsc::Sender<Trigger>,
    /// Child of the service token; cancelling it interrupts this target's
    /// pending debounce and stability waits without touching its siblings.
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Watches directories of spreadsheet files and drives evaluation cycles
/// through a [`CycleRunner`].
pub struct WatchService {
    config: WatcherConfig,
    runner: Arc<dyn CycleRunner>,
    /// Lowercase extensions this service cares about (without the dot).
    extensions: Vec<String>,
    workers: Arc<Semaphore>,
    targets: RwLock<HashMap<PathBuf, TargetHandle>>,
    roots: RwLock<Vec<PathBuf>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
    pending_events: std::sync::Mutex<Option<mpsc::Receiver<PathBuf>>>,
}

impl std::fmt::Debug for WatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchService")
            .field("config", &self.config)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl WatchService {
    pub fn new(
        config: WatcherConfig,
        runner: Arc<dyn CycleRunner>,
        extensions: Vec<String>,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let Ok(event) = result else { return };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
            ) {
                return;
            }
            for path in event.paths {
                // A full channel means a storm of events is already queued;
                // dropping extras is safe because triggers coalesce anyway.
                let _ = tx.try_send(path);
            }
        })?;

        Ok(Arc::new(Self {
            workers: Arc::new(Semaphore::new(config.max_concurrent_cycles.max(1))),
            config,
            runner,
            extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
            targets: RwLock::new(HashMap::new()),
            roots: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            watcher: std::sync::Mutex::new(Some(watcher)),
            pending_events: std::sync::Mutex::new(Some(rx)),
        }))
    }

    /// Spawn the event pump and sweep tasks. Call once, before registering
    /// roots.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let rx = self
            .pending_events
            .lock()
            .map_err(|_| WatchError::Internal("watch service state poisoned".into()))?
            .take()
            .ok_or_else(|| WatchError::Internal("watch service already started".into()))?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).pump_events(rx)));
        tasks.push(tokio::spawn(Arc::clone(self).sweep_loop()));
        Ok(())
    }

    /// Watch a directory tree: register every matching file now, subscribe
    /// the OS watcher to it, and include it in future sweeps.
    pub async fn watch_root(&self, root: &Path) -> Result<()> {
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            return Err(WatchError::Configuration(format!(
                "watch root does not exist: {}",
                root.display()
            )));
        }

        {
            let mut watcher = self
                .watcher
                .lock()
                .map_err(|_| WatchError::Internal("watch service state poisoned".into()))?;
            if let Some(watcher) = watcher.as_mut() {
                watcher.watch(root, RecursiveMode::Recursive)?;
            }
        }
        self.roots.write().await.push(root.to_path_buf());

        let found = scan_root(root, &self.extensions).await;
        info!(
            root = %root.display(),
            files = found.len(),
            "watching root"
        );
        for path in found {
            self.register_target(path).await;
        }
        Ok(())
    }

    /// Stop watching a root and retire every target under it. Each retired
    /// scheduler is awaited, so in-flight cycles finish or cancel cleanly.
    pub async fn unwatch_root(&self, root: &Path) -> Result<()> {
        {
            let mut watcher = self
                .watcher
                .lock()
                .map_err(|_| WatchError::Internal("watch service state poisoned".into()))?;
            if let Some(watcher) = watcher.as_mut() {
                watcher.unwatch(root)?;
            }
        }
        self.roots.write().await.retain(|r| r != root);

        let retired: Vec<_> = {
            let mut targets = self.targets.write().await;
            let paths: Vec<_> = targets
                .keys()
                .filter(|path| path.starts_with(root))
                .cloned()
                .collect();
            paths
                .into_iter()
                .filter_map(|path| targets.remove(&path))
                .collect()
        };
        // Cancelling interrupts pending debounce and stability waits at
        // their next checkpoint; an in-flight copy finishes or cancels on
        // its own token checks. The await is the acknowledgement.
        for handle in retired {
            handle.cancel.cancel();
            drop(handle.trigger);
            let _ = handle.task.await;
        }
        info!(root = %root.display(), "unwatched root");
        Ok(())
    }

    pub async fn watched_targets(&self) -> Vec<PathBuf> {
        self.targets.read().await.keys().cloned().collect()
    }

    /// Cancel everything and wait for every task to acknowledge. In-flight
    /// cycles stop at their next cancellation checkpoint.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        // Dropping the watcher stops the notification threads.
        if let Ok(mut watcher) = self.watcher.lock() {
            watcher.take();
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let targets: Vec<_> = {
            let mut map = self.targets.write().await;
            map.drain().map(|(_, handle)| handle.task).collect()
        };
        for task in targets {
            let _ = task.await;
        }
        info!("watch service stopped");
    }

    async fn register_target(&self, path: PathBuf) {
        let mut targets = self.targets.write().await;
        if targets.contains_key(&path) {
            return;
        }
        debug!(path = %path.display(), "registering target");
        let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let cancel = self.cancel.child_token();
        let task = TargetScheduler {
            path: path.clone(),
            config: self.config.clone(),
            runner: Arc::clone(&self.runner),
            workers: Arc::clone(&self.workers),
            cancel: cancel.clone(),
        }
        .spawn(rx);
        // Startup trigger so a fresh target gets a baseline without waiting
        // for its first save.
        let _ = tx.try_send(Trigger::Sweep);
        targets.insert(
            path,
            TargetHandle {
                trigger: tx,
                cancel,
                task,
            },
        );
    }

    async fn pump_events(self: Arc<Self>, mut rx: mpsc::Receiver<PathBuf>) {
        loop {
            let path = tokio::select! {
                _ = self.cancel.cancelled() => break,
                path = rx.recv() => match path {
                    Some(path) => path,
                    None => break,
                },
            };
            if !is_watchable(&path, &self.extensions) {
                continue;
            }
            if let Some(handle) = self.targets.read().await.get(&path) {
                let _ = handle.trigger.try_send(Trigger::Event);
                continue;
            }
            // A new file appeared under a watched root.
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                self.register_target(path).await;
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval's immediate first tick would duplicate the initial
        // scan done by watch_root.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let roots = self.roots.read().await.clone();
            for root in roots {
                if self.cancel.is_cancelled() {
                    return;
                }
                if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
                    warn!(root = %root.display(), "watch root unreachable during sweep");
                    continue;
                }
                for path in scan_root(&root, &self.extensions).await {
                    if let Some(handle) = self.targets.read().await.get(&path) {
                        let _ = handle.trigger.try_send(Trigger::Sweep);
                    } else {
                        self.register_target(path).await;
                    }
                }
            }
            self.prune_deleted_targets().await;
        }
    }

    /// Retire targets whose file is gone by sweep time. A file that vanishes
    /// mid-save reappears within milliseconds, so checking at sweep cadence
    /// distinguishes real deletions from save-rename gaps.
    async fn prune_deleted_targets(&self) {
        let paths: Vec<_> = self.targets.read().await.keys().cloned().collect();
        for path in paths {
            if tokio::fs::try_exists(&path).await.unwrap_or(true) {
                continue;
            }
            let removed = self.targets.write().await.remove(&path);
            if let Some(handle) = removed {
                debug!(path = %path.display(), "target deleted, retiring scheduler");
                handle.cancel.cancel();
                drop(handle.trigger);
                let _ = handle.task.await;
                // The file is gone for good; its cache copy and baseline go
                // with it.
                self.runner.retire_target(&path).await;
            }
        }
    }
}

/// Office writes `~$name.xlsx` owner files next to open workbooks; those and
/// obvious temporaries are never targets.
fn is_watchable(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with("~$") || name.starts_with('.') || name.ends_with(".tmp") {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            extensions.iter().any(|allowed| *allowed == ext)
        })
        .unwrap_or(false)
}

async fn scan_root(root: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => stack.push(path),
                Ok(kind) if kind.is_file() && is_watchable(&path, extensions) => found.push(path),
                _ => {}
            }
        }
    }
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::pipeline::CycleOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRunner {
        cycles: AtomicUsize,
        retired: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl CountingRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cycles: AtomicUsize::new(0),
                retired: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CycleRunner for CountingRunner {
        async fn run_cycle(
            &self,
            _source: &Path,
            _cancel: &CancellationToken,
        ) -> Result<CycleOutcome> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Ok(CycleOutcome::Skipped)
        }

        async fn retire_target(&self, source: &Path) {
            self.retired.lock().unwrap().push(source.to_path_buf());
        }
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            debounce_window_ms: 30,
            dense_poll_interval_ms: 10,
            sparse_poll_interval_ms: 10,
            stability_checks: 1,
            failure_backoff_ms: 10,
            sweep_interval_ms: 100,
            ..WatcherConfig::default()
        }
    }

    #[test]
    fn watchability_filters_temporaries_and_foreign_extensions() {
        let exts = vec!["xlsx".to_string(), "xlsm".to_string()];
        assert!(is_watchable(Path::new("/srv/budget.xlsx"), &exts));
        assert!(is_watchable(Path::new("/srv/Budget.XLSM"), &exts));
        assert!(!is_watchable(Path::new("/srv/~$budget.xlsx"), &exts));
        assert!(!is_watchable(Path::new("/srv/.budget.xlsx"), &exts));
        assert!(!is_watchable(Path::new("/srv/budget.xlsx.tmp"), &exts));
        assert!(!is_watchable(Path::new("/srv/notes.txt"), &exts));
        assert!(!is_watchable(Path::new("/srv/noext"), &exts));
    }

    #[tokio::test]
    async fn registers_existing_files_and_runs_startup_cycles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.xlsx"), b"a").unwrap();
        std::fs::write(dir.path().join("b.xlsx"), b"b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();

        let runner = CountingRunner::new();
        let service = WatchService::new(fast_config(), runner.clone(), vec!["xlsx".into()])
            .unwrap();
        service.start().await.unwrap();
        service.watch_root(dir.path()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(service.watched_targets().await.len(), 2);
        assert!(runner.cycles.load(Ordering::SeqCst) >= 2, "startup cycles ran");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_discovers_files_created_later() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CountingRunner::new();
        let service = WatchService::new(fast_config(), runner.clone(), vec!["xlsx".into()])
            .unwrap();
        service.start().await.unwrap();
        service.watch_root(dir.path()).await.unwrap();
        assert!(service.watched_targets().await.is_empty());

        std::fs::write(dir.path().join("late.xlsx"), b"late").unwrap();
        // Either the OS event or the 100ms sweep picks it up.
        let mut registered = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !service.watched_targets().await.is_empty() {
                registered = true;
                break;
            }
        }
        assert!(registered, "new file was discovered");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_completes_with_active_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.xlsx"), b"a").unwrap();
        let runner = CountingRunner::new();
        let service = WatchService::new(fast_config(), runner, vec!["xlsx".into()]).unwrap();
        service.start().await.unwrap();
        service.watch_root(dir.path()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), service.shutdown())
            .await
            .expect("shutdown acknowledged");
    }

    #[tokio::test]
    async fn unwatch_root_retires_its_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.xlsx"), b"a").unwrap();
        let runner = CountingRunner::new();
        let service = WatchService::new(fast_config(), runner, vec!["xlsx".into()]).unwrap();
        service.start().await.unwrap();
        service.watch_root(dir.path()).await.unwrap();
        assert_eq!(service.watched_targets().await.len(), 1);

        service.unwatch_root(dir.path()).await.unwrap();
        assert!(service.watched_targets().await.is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_prunes_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.xlsx");
        std::fs::write(&file, b"a").unwrap();
        let runner = CountingRunner::new();
        let service =
            WatchService::new(fast_config(), runner.clone(), vec!["xlsx".into()]).unwrap();
        service.start().await.unwrap();
        service.watch_root(dir.path()).await.unwrap();
        assert_eq!(service.watched_targets().await.len(), 1);

        std::fs::remove_file(&file).unwrap();
        let mut pruned = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if service.watched_targets().await.is_empty() {
                pruned = true;
                break;
            }
        }
        assert!(pruned, "deleted file was retired");
        assert_eq!(runner.retired.lock().unwrap().as_slice(), &[file]);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unwatch_root_interrupts_a_pending_stability_wait() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.xlsx"), b"a").unwrap();
        // Stability demands 40 quiet polls at 50ms, so the startup trigger
        // parks the target in a multi-second settle wait.
        let config = WatcherConfig {
            debounce_window_ms: 10,
            dense_poll_interval_ms: 50,
            sparse_poll_interval_ms: 50,
            stability_checks: 40,
            max_stability_wait_ms: 60_000,
            sweep_interval_ms: 60_000,
            ..WatcherConfig::default()
        };
        let runner = CountingRunner::new();
        let service = WatchService::new(config, runner.clone(), vec!["xlsx".into()]).unwrap();
        service.start().await.unwrap();
        service.watch_root(dir.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        service.unwatch_root(dir.path()).await.unwrap();

        assert!(
            started.elapsed() < Duration::from_secs(1),
            "unwatch returned mid-wait in {:?}",
            started.elapsed()
        );
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 0, "no cycle ran");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let runner = CountingRunner::new();
        let service = WatchService::new(fast_config(), runner, vec!["xlsx".into()]).unwrap();
        service.start().await.unwrap();
        assert!(service.start().await.is_err());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn missing_root_is_a_configuration_error() {
        let runner = CountingRunner::new();
        let service = WatchService::new(fast_config(), runner, vec!["xlsx".into()]).unwrap();
        service.start().await.unwrap();
        let err = service
            .watch_root(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Configuration(_)));
        service.shutdown().await;
    }
}
