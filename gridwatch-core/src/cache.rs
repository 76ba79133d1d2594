//! Stability-gated local copies of watched files.
//!
//! Decoders never read a watched file in place. [`StableCopy::acquire`]
//! produces a private local copy first, so the expensive decode holds no
//! handle on the share while authors are saving. The copier re-confirms
//! quiescence on its own before opening any read handle, retries through
//! sharing violations with backoff, and verifies after the transfer that the
//! source did not move underneath it. Every failed attempt is reported to the
//! operational log with a cycle id so a postmortem can follow one acquire
//! across its retries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CopyConfig;
use crate::error::{Result, WatchError, is_sharing_violation};
use crate::sink::{CopyFailureRecord, OperationalLogSink};
use crate::snapshot::target_key;

/// Source stat observed at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStat {
    pub mtime_ms: i64,
    pub size: u64,
}

/// Stat a watched source, mapping absence to [`WatchError::SourceVanished`].
pub async fn stat_source(path: &Path) -> Result<SourceStat> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(SourceStat {
            mtime_ms: mtime_millis(&meta),
            size: meta.len(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(WatchError::SourceVanished(path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}

pub fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A usable local copy of a source file (or, in non-strict fallback, the
/// source path itself).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub source: PathBuf,
    /// Path the decoder should read. Equal to `source` when `direct` is set.
    pub local_path: PathBuf,
    pub source_mtime_ms: i64,
    pub source_size: u64,
    pub captured_at: DateTime<Utc>,
    /// True only for the non-strict fallback where no copy could be made and
    /// the decoder reads the share directly.
    pub direct: bool,
}

enum AttemptError {
    /// Worth retrying after backoff: sharing violation, or the source moved
    /// during the confirmation window or the transfer.
    Transient(String),
    /// Not retryable within this cycle.
    Fatal(WatchError),
}

/// Produces stable local copies of watched files under a cache directory.
pub struct StableCopy {
    config: CopyConfig,
    cache_dir: PathBuf,
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    ops_log: Arc<dyn OperationalLogSink>,
}

impl std::fmt::Debug for StableCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableCopy")
            .field("config", &self.config)
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl StableCopy {
    pub fn new(
        config: CopyConfig,
        cache_dir: impl Into<PathBuf>,
        ops_log: Arc<dyn OperationalLogSink>,
    ) -> Self {
        Self {
            config,
            cache_dir: cache_dir.into(),
            entries: RwLock::new(HashMap::new()),
            ops_log,
        }
    }

    fn cache_path(&self, source: &Path) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        self.cache_dir.join(format!("{}_{name}", target_key(source)))
    }

    /// Acquire a local copy of `source`, retrying through contention.
    ///
    /// On exhaustion the strict mode returns [`WatchError::SourceBusy`]; the
    /// non-strict mode degrades to handing back the source path itself so the
    /// cycle can still proceed.
    pub async fn acquire(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<CacheEntry> {
        let cycle_id = uuid::Uuid::new_v4();
        let mut total_wait = Duration::ZERO;

        for attempt in 1..=self.config.max_attempts.max(1) {
            if cancel.is_cancelled() {
                return Err(WatchError::Cancelled(format!(
                    "acquire of {} cancelled",
                    source.display()
                )));
            }

            match self.try_acquire(source, cancel).await {
                Ok(entry) => return Ok(entry),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(reason)) => {
                    warn!(
                        source = %source.display(),
                        attempt,
                        %cycle_id,
                        "copy attempt failed: {reason}"
                    );
                    self.ops_log
                        .copy_failure(CopyFailureRecord {
                            path: source.to_path_buf(),
                            timestamp: Utc::now(),
                            cycle_id,
                            attempt,
                            error: reason,
                        })
                        .await;

                    if attempt < self.config.max_attempts.max(1) {
                        let backoff = self.config.retry_backoff();
                        total_wait += backoff;
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(WatchError::Cancelled(format!(
                                    "acquire of {} cancelled during backoff",
                                    source.display()
                                )));
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        }

        if self.config.strict_no_direct_read {
            return Err(WatchError::SourceBusy {
                path: source.to_path_buf(),
                attempts: self.config.max_attempts.max(1),
                total_wait,
            });
        }

        // Legacy fallback: decode straight off the share. The read itself can
        // still collide with a save, which is why strict mode exists.
        warn!(
            source = %source.display(),
            "copy budget exhausted, falling back to direct read"
        );
        let stat = stat_source(source).await?;
        Ok(CacheEntry {
            source: source.to_path_buf(),
            local_path: source.to_path_buf(),
            source_mtime_ms: stat.mtime_ms,
            source_size: stat.size,
            captured_at: Utc::now(),
            direct: true,
        })
    }

    async fn try_acquire(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<CacheEntry, AttemptError> {
        let stat = stat_source(source).await.map_err(AttemptError::Fatal)?;

        // Reuse an existing copy when the source has not moved since it was
        // taken.
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(source)
                && !entry.direct
                && entry.source_mtime_ms >= stat.mtime_ms
                && entry.source_size == stat.size
                && tokio::fs::try_exists(&entry.local_path).await.unwrap_or(false)
            {
                debug!(source = %source.display(), "reusing existing cache copy");
                return Ok(entry.clone());
            }
        }

        // Confirmation window: the scheduler already judged the file settled,
        // but its verdict ages. Re-check here so a save that started in the
        // gap is caught before any read handle opens.
        for _ in 0..self.config.confirm_checks {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AttemptError::Fatal(WatchError::Cancelled(format!(
                        "acquire of {} cancelled during confirmation",
                        source.display()
                    ))));
                }
                _ = tokio::time::sleep(self.config.confirm_interval()) => {}
            }
            let now = stat_source(source).await.map_err(AttemptError::Fatal)?;
            if now != stat {
                return Err(AttemptError::Transient(
                    "source changed during confirmation window".into(),
                ));
            }
        }

        let cache_path = self.cache_path(source);
        let temp_path = self.cache_dir.join(format!(
            ".{}.partial-{}",
            target_key(source),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|err| {
                AttemptError::Fatal(WatchError::CacheWrite {
                    path: self.cache_dir.clone(),
                    source: err,
                })
            })?;

        match self.transfer(source, &temp_path, cancel).await {
            Ok(()) => {}
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(err);
            }
        }

        // The transfer read a moving target if the source mtime changed while
        // bytes were in flight; such a copy may mix pre- and post-save pages.
        let after = match stat_source(source).await {
            Ok(after) => after,
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(AttemptError::Fatal(err));
            }
        };
        if after != stat {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(AttemptError::Transient(
                "source changed during transfer".into(),
            ));
        }

        if let Err(err) = tokio::fs::rename(&temp_path, &cache_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(AttemptError::Fatal(WatchError::CacheWrite {
                path: cache_path,
                source: err,
            }));
        }

        let entry = CacheEntry {
            source: source.to_path_buf(),
            local_path: cache_path,
            source_mtime_ms: stat.mtime_ms,
            source_size: stat.size,
            captured_at: Utc::now(),
            direct: false,
        };
        self.entries
            .write()
            .await
            .insert(source.to_path_buf(), entry.clone());
        debug!(
            source = %source.display(),
            cache = %entry.local_path.display(),
            size = entry.source_size,
            "stable copy captured"
        );
        Ok(entry)
    }

    /// Chunked transfer with a cancellation check between chunks. Short
    /// chunks keep the source read handle's hold windows small.
    async fn transfer(
        &self,
        source: &Path,
        temp_path: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), AttemptError> {
        let mut reader = tokio::fs::File::open(source)
            .await
            .map_err(|err| classify_source_error(source, err))?;
        let mut writer = tokio::fs::File::create(temp_path).await.map_err(|err| {
            AttemptError::Fatal(WatchError::CacheWrite {
                path: temp_path.to_path_buf(),
                source: err,
            })
        })?;

        let mut buf = vec![0u8; self.config.chunk_size_bytes.max(4096)];
        loop {
            if cancel.is_cancelled() {
                return Err(AttemptError::Fatal(WatchError::Cancelled(format!(
                    "copy of {} cancelled mid-transfer",
                    source.display()
                ))));
            }
            let read = reader
                .read(&mut buf)
                .await
                .map_err(|err| classify_source_error(source, err))?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read]).await.map_err(|err| {
                AttemptError::Fatal(WatchError::CacheWrite {
                    path: temp_path.to_path_buf(),
                    source: err,
                })
            })?;
        }
        writer.flush().await.map_err(|err| {
            AttemptError::Fatal(WatchError::CacheWrite {
                path: temp_path.to_path_buf(),
                source: err,
            })
        })?;
        Ok(())
    }

    /// Drop the cached copy for a source, if any.
    pub async fn evict(&self, source: &Path) {
        let removed = self.entries.write().await.remove(source);
        if let Some(entry) = removed
            && !entry.direct
        {
            let _ = tokio::fs::remove_file(&entry.local_path).await;
        }
    }
}

fn classify_source_error(source: &Path, err: std::io::Error) -> AttemptError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AttemptError::Fatal(WatchError::SourceVanished(source.to_path_buf()))
    } else if is_sharing_violation(&err) {
        AttemptError::Transient(format!("sharing violation: {err}"))
    } else {
        AttemptError::Fatal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NoopOpsLog;
    use std::sync::Mutex;

    fn fast_config() -> CopyConfig {
        CopyConfig {
            confirm_checks: 1,
            confirm_interval_ms: 10,
            max_attempts: 2,
            retry_backoff_ms: 10,
            ..CopyConfig::default()
        }
    }

    fn stable_copy(cache_dir: &Path, config: CopyConfig) -> StableCopy {
        StableCopy::new(config, cache_dir, Arc::new(NoopOpsLog))
    }

    #[tokio::test]
    async fn acquires_a_byte_identical_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"workbook bytes").unwrap();
        let copier = stable_copy(&dir.path().join("cache"), fast_config());

        let entry = copier
            .acquire(&source, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!entry.direct);
        assert_ne!(entry.local_path, source);
        assert_eq!(std::fs::read(&entry.local_path).unwrap(), b"workbook bytes");
    }

    #[tokio::test]
    async fn reuses_copy_when_source_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"workbook bytes").unwrap();
        let copier = stable_copy(&dir.path().join("cache"), fast_config());
        let cancel = CancellationToken::new();

        let first = copier.acquire(&source, &cancel).await.unwrap();
        let second = copier.acquire(&source, &cancel).await.unwrap();

        assert_eq!(first.local_path, second.local_path);
        assert_eq!(first.captured_at, second.captured_at, "entry reused, not re-copied");
    }

    #[tokio::test]
    async fn missing_source_is_source_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let copier = stable_copy(&dir.path().join("cache"), fast_config());

        let err = copier
            .acquire(&dir.path().join("gone.xlsx"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::SourceVanished(_)));
    }

    #[tokio::test]
    async fn cancelled_acquire_leaves_no_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"workbook bytes").unwrap();
        let cache_dir = dir.path().join("cache");
        let copier = stable_copy(&cache_dir, fast_config());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = copier.acquire(&source, &cancel).await.unwrap_err();
        assert!(matches!(err, WatchError::Cancelled(_)));

        if cache_dir.exists() {
            let leftovers: Vec<_> = std::fs::read_dir(&cache_dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .collect();
            assert!(leftovers.is_empty());
        }
    }

    #[tokio::test]
    async fn exhaustion_in_strict_mode_is_source_busy() {
        // A source rewritten during every confirmation window never settles.
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"v0").unwrap();
        let copier = stable_copy(&dir.path().join("cache"), fast_config());

        let writer_path = source.clone();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer_stop = stop.clone();
        let writer = tokio::spawn(async move {
            let mut i = 0u64;
            while !writer_stop.load(std::sync::atomic::Ordering::Relaxed) {
                i += 1;
                let _ = std::fs::write(&writer_path, format!("v{i}{}", "x".repeat(i as usize % 7)));
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        });

        let err = copier
            .acquire(&source, &CancellationToken::new())
            .await
            .unwrap_err();
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.await.unwrap();

        assert!(matches!(
            err,
            WatchError::SourceBusy { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn exhaustion_in_non_strict_mode_falls_back_to_direct_read() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"v0").unwrap();
        let config = CopyConfig {
            strict_no_direct_read: false,
            ..fast_config()
        };
        let copier = stable_copy(&dir.path().join("cache"), config);

        let writer_path = source.clone();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer_stop = stop.clone();
        let writer = tokio::spawn(async move {
            let mut i = 0u64;
            while !writer_stop.load(std::sync::atomic::Ordering::Relaxed) {
                i += 1;
                let _ = std::fs::write(&writer_path, format!("v{i}{}", "x".repeat(i as usize % 7)));
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        });

        let entry = copier
            .acquire(&source, &CancellationToken::new())
            .await
            .unwrap();
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.await.unwrap();

        assert!(entry.direct);
        assert_eq!(entry.local_path, source);
    }

    #[tokio::test]
    async fn failed_attempts_reach_the_operational_log() {
        struct RecordingOpsLog(Mutex<Vec<CopyFailureRecord>>);

        #[async_trait::async_trait]
        impl OperationalLogSink for RecordingOpsLog {
            async fn copy_failure(&self, record: CopyFailureRecord) {
                self.0.lock().unwrap().push(record);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"v0").unwrap();
        let ops = Arc::new(RecordingOpsLog(Mutex::new(Vec::new())));
        let copier = StableCopy::new(fast_config(), dir.path().join("cache"), ops.clone());

        let writer_path = source.clone();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer_stop = stop.clone();
        let writer = tokio::spawn(async move {
            let mut i = 0u64;
            while !writer_stop.load(std::sync::atomic::Ordering::Relaxed) {
                i += 1;
                let _ = std::fs::write(&writer_path, format!("v{i}{}", "x".repeat(i as usize % 7)));
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        });

        let _ = copier.acquire(&source, &CancellationToken::new()).await;
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.await.unwrap();

        let records = ops.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attempt, 1);
        assert_eq!(records[1].attempt, 2);
        assert_eq!(records[0].cycle_id, records[1].cycle_id);
    }

    #[tokio::test]
    async fn acquire_succeeds_once_contention_clears() {
        // Ops-log records carry their arrival instant so the gap between the
        // failed attempt and the eventual success can be measured.
        struct TimedOpsLog(Mutex<Vec<(CopyFailureRecord, std::time::Instant)>>);

        #[async_trait::async_trait]
        impl OperationalLogSink for TimedOpsLog {
            async fn copy_failure(&self, record: CopyFailureRecord) {
                self.0
                    .lock()
                    .unwrap()
                    .push((record, std::time::Instant::now()));
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"v0").unwrap();
        let config = CopyConfig {
            confirm_checks: 1,
            confirm_interval_ms: 10,
            max_attempts: 3,
            retry_backoff_ms: 200,
            ..CopyConfig::default()
        };
        let ops = Arc::new(TimedOpsLog(Mutex::new(Vec::new())));
        let copier = StableCopy::new(config, dir.path().join("cache"), ops.clone());

        // Writer churns the source until the first attempt fails, then goes
        // quiet so the next attempt finds a settled file.
        let writer_path = source.clone();
        let writer_ops = ops.clone();
        let writer = tokio::spawn(async move {
            let mut i = 0u64;
            while writer_ops.0.lock().unwrap().is_empty() {
                i += 1;
                let _ = std::fs::write(&writer_path, format!("v{i}{}", "x".repeat(i as usize % 7)));
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        });

        let entry = copier
            .acquire(&source, &CancellationToken::new())
            .await
            .unwrap();
        let done = std::time::Instant::now();
        writer.await.unwrap();

        assert!(!entry.direct, "a real copy was made after the retry");
        let records = ops.0.lock().unwrap();
        assert_eq!(records.len(), 1, "only the contended attempt was logged");
        assert_eq!(records[0].0.attempt, 1);
        assert!(
            done.duration_since(records[0].1) >= Duration::from_millis(200),
            "retry waited out the configured backoff"
        );
    }

    #[tokio::test]
    async fn evict_removes_entry_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("budget.xlsx");
        std::fs::write(&source, b"workbook bytes").unwrap();
        let copier = stable_copy(&dir.path().join("cache"), fast_config());

        let entry = copier
            .acquire(&source, &CancellationToken::new())
            .await
            .unwrap();
        copier.evict(&source).await;
        assert!(!entry.local_path.exists());
    }
}
