//! Per-target evaluation scheduling.
//!
//! Each watched file gets one scheduler task, which is what serializes its
//! evaluation cycles: a target can never race itself. The task sits idle
//! until a trigger arrives, debounces the burst a single save produces,
//! waits for the source stat to settle, then runs one cycle under the
//! shared worker budget.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cache::{SourceStat, stat_source};
use crate::config::WatcherConfig;
use crate::error::WatchError;
use crate::pipeline::CycleRunner;

/// Why a target woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// Filesystem notification.
    Event,
    /// Periodic sweep or startup scan.
    Sweep,
}

pub(crate) struct TargetScheduler {
    pub(crate) path: PathBuf,
    pub(crate) config: WatcherConfig,
    pub(crate) runner: Arc<dyn CycleRunner>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) cancel: CancellationToken,
}

enum StabilityVerdict {
    Settled(SourceStat),
    /// File kept changing past the wait budget, vanished, or shutdown
    /// started. The cycle is abandoned until the next trigger.
    Abandon,
}

impl TargetScheduler {
    pub(crate) fn spawn(self, triggers: mpsc::Receiver<Trigger>) -> JoinHandle<()> {
        tokio::spawn(self.run(triggers))
    }

    async fn run(self, mut triggers: mpsc::Receiver<Trigger>) {
        loop {
            let trigger = tokio::select! {
                _ = self.cancel.cancelled() => break,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };
            debug!(path = %self.path.display(), ?trigger, "target woke");

            if !self.debounce(&mut triggers).await {
                break;
            }
            self.evaluate_with_retries().await;
        }
        debug!(path = %self.path.display(), "target scheduler stopped");
    }

    /// Collapse the trigger burst of one save: keep draining until the
    /// channel stays quiet for a full debounce window. Returns false when
    /// shutdown interrupted the wait.
    async fn debounce(&self, triggers: &mut mpsc::Receiver<Trigger>) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                next = tokio::time::timeout(self.config.debounce_window(), triggers.recv()) => {
                    match next {
                        Ok(Some(_)) => continue,
                        // Channel closed: evaluate what we have, then stop.
                        Ok(None) | Err(_) => return true,
                    }
                }
            }
        }
    }

    /// Wait for the source to stop changing, then run one cycle; retry with
    /// backoff on failure up to the configured budget.
    async fn evaluate_with_retries(&self) {
        let mut failures = 0u32;
        loop {
            let StabilityVerdict::Settled(stat) = self.wait_for_stability().await else {
                return;
            };
            debug!(
                path = %self.path.display(),
                size = stat.size,
                "source settled, evaluating"
            );

            // The permit covers the cycle only. A target sleeping in
            // failure backoff must not occupy a worker slot.
            let result = {
                let permit = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    permit = self.workers.acquire() => permit,
                };
                let Ok(_permit) = permit else {
                    return;
                };
                self.runner.run_cycle(&self.path, &self.cancel).await
            };

            match result {
                Ok(outcome) => {
                    debug!(path = %self.path.display(), ?outcome, "cycle finished");
                    return;
                }
                Err(WatchError::Cancelled(_)) => return,
                Err(WatchError::SourceVanished(_)) => {
                    debug!(path = %self.path.display(), "source vanished mid-cycle");
                    return;
                }
                Err(err) => {
                    failures += 1;
                    if failures >= self.config.max_failures.max(1) {
                        error!(
                            path = %self.path.display(),
                            failures,
                            "giving up on this cycle: {err}"
                        );
                        return;
                    }
                    let backoff = self.config.failure_backoff(failures);
                    warn!(
                        path = %self.path.display(),
                        failures,
                        ?backoff,
                        "cycle failed, backing off: {err}"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// A file counts as settled after `stability_checks` consecutive polls
    /// with an identical stat. Poll cadence adapts to the observed size,
    /// since large files take longer between save phases.
    async fn wait_for_stability(&self) -> StabilityVerdict {
        let deadline = Instant::now() + self.config.max_stability_wait();
        let mut last: Option<SourceStat> = None;
        let mut quiet = 0u32;
        loop {
            let stat = match stat_source(&self.path).await {
                Ok(stat) => stat,
                Err(WatchError::SourceVanished(_)) => {
                    debug!(path = %self.path.display(), "source vanished while settling");
                    return StabilityVerdict::Abandon;
                }
                Err(err) => {
                    warn!(path = %self.path.display(), "stat failed while settling: {err}");
                    return StabilityVerdict::Abandon;
                }
            };

            if last == Some(stat) {
                quiet += 1;
            } else {
                quiet = 1;
                last = Some(stat);
            }
            if quiet >= self.config.stability_checks.max(1) {
                return StabilityVerdict::Settled(stat);
            }
            if Instant::now() >= deadline {
                warn!(
                    path = %self.path.display(),
                    waited = ?self.config.max_stability_wait(),
                    "source never settled, abandoning cycle"
                );
                return StabilityVerdict::Abandon;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return StabilityVerdict::Abandon,
                _ = tokio::time::sleep(self.config.poll_interval(stat.size)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::pipeline::CycleOutcome;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRunner {
        cycles: AtomicUsize,
        fail: bool,
    }

    impl CountingRunner {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                cycles: AtomicUsize::new(0),
                fail,
            })
        }

        fn count(&self) -> usize {
            self.cycles.load(Ordering::SeqCst)
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
            if self.fail {
                Err(WatchError::Internal("injected failure".into()))
            } else {
                Ok(CycleOutcome::Evaluated {
                    surfaced: 0,
                    suppressed: 0,
                })
            }
        }
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            debounce_window_ms: 40,
            dense_poll_interval_ms: 10,
            sparse_poll_interval_ms: 10,
            stability_checks: 2,
            max_stability_wait_ms: 2_000,
            failure_backoff_ms: 10,
            max_failures: 3,
            ..WatcherConfig::default()
        }
    }

    fn spawn_scheduler(
        path: PathBuf,
        runner: Arc<dyn CycleRunner>,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<Trigger>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let task = TargetScheduler {
            path,
            config: fast_config(),
            runner,
            workers: Arc::new(Semaphore::new(2)),
            cancel,
        }
        .spawn(rx);
        (tx, task)
    }

    #[tokio::test]
    async fn trigger_burst_collapses_into_one_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"bytes").unwrap();
        let runner = CountingRunner::new(false);
        let cancel = CancellationToken::new();
        let (tx, task) = spawn_scheduler(source, runner.clone(), cancel.clone());

        for _ in 0..5 {
            tx.send(Trigger::Event).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(runner.count(), 1);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn separate_saves_each_get_a_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"bytes").unwrap();
        let runner = CountingRunner::new(false);
        let cancel = CancellationToken::new();
        let (tx, task) = spawn_scheduler(source, runner.clone(), cancel.clone());

        tx.send(Trigger::Event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        tx.send(Trigger::Sweep).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(runner.count(), 2);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failures_retry_up_to_the_budget_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"bytes").unwrap();
        let runner = CountingRunner::new(true);
        let cancel = CancellationToken::new();
        let (tx, task) = spawn_scheduler(source, runner.clone(), cancel.clone());

        tx.send(Trigger::Event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // max_failures attempts for the one trigger, then back to idle.
        assert_eq!(runner.count(), 3);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failure_backoff_releases_the_worker_permit() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"bytes").unwrap();
        let runner = CountingRunner::new(true);
        let cancel = CancellationToken::new();
        let workers = Arc::new(Semaphore::new(1));
        let (tx, rx) = mpsc::channel(16);
        let task = TargetScheduler {
            path: source,
            // Backoff far beyond the test window so the scheduler is still
            // sleeping when the permit count is read.
            config: WatcherConfig {
                failure_backoff_ms: 60_000,
                ..fast_config()
            },
            runner: runner.clone(),
            workers: workers.clone(),
            cancel: cancel.clone(),
        }
        .spawn(rx);

        tx.send(Trigger::Event).await.unwrap();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if runner.count() == 1 {
                break;
            }
        }
        assert_eq!(runner.count(), 1, "first attempt ran and failed");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The only worker slot must be free while this target backs off,
        // otherwise one flaky file starves every healthy target.
        assert_eq!(workers.available_permits(), 1);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn vanished_source_abandons_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CountingRunner::new(false);
        let cancel = CancellationToken::new();
        let (tx, task) =
            spawn_scheduler(dir.path().join("gone.xlsx"), runner.clone(), cancel.clone());

        tx.send(Trigger::Event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(runner.count(), 0);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_acknowledged_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"bytes").unwrap();
        let runner = CountingRunner::new(false);
        let cancel = CancellationToken::new();
        let (tx, task) = spawn_scheduler(source, runner, cancel.clone());

        tx.send(Trigger::Event).await.unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("scheduler acknowledged shutdown")
            .unwrap();
    }
}
