//! One evaluation cycle: stat, stable copy, decode, diff, persist.
//!
//! The scheduler drives cycles through the [`CycleRunner`] trait so its
//! timing behaviour can be tested against a counting stub; [`Pipeline`] is
//! the production implementation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::baseline::BaselineStore;
use crate::cache::{StableCopy, stat_source};
use crate::config::CopyConfig;
use crate::decode::SnapshotDecoder;
use crate::diff::DiffEngine;
use crate::error::{Result, WatchError};
use crate::sink::{ChangeContext, ChangeLogSink};
use crate::snapshot::Snapshot;

/// What one cycle did for its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The source stat matched the baseline; no copy or decode happened.
    Skipped,
    Evaluated { surfaced: usize, suppressed: usize },
}

#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, source: &Path, cancel: &CancellationToken) -> Result<CycleOutcome>;

    /// Drop per-target state once the source is confirmed gone. The default
    /// is a no-op so timing stubs need not carry state.
    async fn retire_target(&self, _source: &Path) {}
}

/// Production cycle runner wiring the copy layer, decoder, diff engine,
/// baseline store, and change log together.
pub struct Pipeline {
    copy_config: CopyConfig,
    copier: Arc<StableCopy>,
    decoder: Arc<dyn SnapshotDecoder>,
    engine: DiffEngine,
    baselines: BaselineStore,
    change_log: Arc<dyn ChangeLogSink>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("copy_config", &self.copy_config)
            .field("baselines", &self.baselines)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        copy_config: CopyConfig,
        copier: Arc<StableCopy>,
        decoder: Arc<dyn SnapshotDecoder>,
        engine: DiffEngine,
        baselines: BaselineStore,
        change_log: Arc<dyn ChangeLogSink>,
    ) -> Self {
        Self {
            copy_config,
            copier,
            decoder,
            engine,
            baselines,
            change_log,
        }
    }

    /// Stat quick-skip: when the source's mtime and size both match what the
    /// baseline recorded, the save that triggered this cycle was already
    /// evaluated (debounced triggers routinely fire once more after the
    /// evaluation that consumed them). Mtime comparison tolerates small
    /// drift since SMB servers round timestamps.
    fn matches_baseline_stat(&self, baseline: &Snapshot, mtime_ms: i64, size: u64) -> bool {
        let tolerance = self.copy_config.mtime_tolerance().as_millis() as i64;
        baseline.source_size == size
            && (baseline.source_mtime_ms - mtime_ms).abs() <= tolerance
    }

    async fn load_baseline(&self, source: &Path) -> Option<Snapshot> {
        match self.baselines.load(source).await {
            Ok(baseline) => baseline,
            Err(err) => {
                // A corrupt baseline means one spurious first-observation
                // cycle, which is recoverable; failing the target is not.
                warn!(
                    source = %source.display(),
                    "baseline unreadable, treating as absent: {err}"
                );
                None
            }
        }
    }
}

#[async_trait]
impl CycleRunner for Pipeline {
    async fn run_cycle(&self, source: &Path, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let stat = stat_source(source).await?;
        let baseline = self.load_baseline(source).await;

        if let Some(ref baseline) = baseline
            && self.matches_baseline_stat(baseline, stat.mtime_ms, stat.size)
        {
            debug!(source = %source.display(), "stat matches baseline, skipping cycle");
            return Ok(CycleOutcome::Skipped);
        }

        let entry = self.copier.acquire(source, cancel).await?;

        if cancel.is_cancelled() {
            return Err(WatchError::Cancelled(format!(
                "cycle for {} cancelled before decode",
                source.display()
            )));
        }

        // Workbook decode is CPU-bound zip and xml work; keep it off the
        // runtime's async threads.
        let decoder = Arc::clone(&self.decoder);
        let local_path = entry.local_path.clone();
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&local_path))
            .await
            .map_err(|err| WatchError::Internal(format!("decode task panicked: {err}")))??;

        let current = Snapshot::from_decoded(decoded, entry.source_mtime_ms, entry.source_size);
        let evaluation = self.engine.evaluate(&current, baseline.as_ref());

        if !evaluation.surfaced.is_empty() {
            info!(
                source = %source.display(),
                surfaced = evaluation.surfaced.len(),
                suppressed = evaluation.suppressed,
                author = evaluation.author.as_deref().unwrap_or("unknown"),
                "changes detected"
            );
            let context = ChangeContext {
                path: source.to_path_buf(),
                author: evaluation.author.clone(),
                timestamp: Utc::now(),
            };
            self.change_log
                .record_changes(&context, &evaluation.surfaced)
                .await;
        }

        // The baseline advances even when every change was suppressed by
        // policy, so suppressed drift is never re-reported later.
        self.baselines.save(source, &evaluation.new_baseline).await?;

        Ok(CycleOutcome::Evaluated {
            surfaced: evaluation.surfaced.len(),
            suppressed: evaluation.suppressed,
        })
    }

    async fn retire_target(&self, source: &Path) {
        self.copier.evict(source).await;
        if let Err(err) = self.baselines.remove(source).await {
            warn!(
                source = %source.display(),
                "failed to remove baseline for retired target: {err}"
            );
        }
        debug!(source = %source.display(), "retired target state");
    }
}
