//! Tuning knobs for the watch scheduler and the stable-copy layer.
//!
//! All fields carry defaults so deployments can adopt individual settings
//! without supplying a full configuration payload. Durations are stored as
//! millisecond integers for serde friendliness and exposed through accessor
//! methods.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduler behaviour per watched file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Debounce window collapsing a burst of change notifications from one
    /// logical save into a single evaluation.
    pub debounce_window_ms: u64,
    /// Poll cadence for files below `size_threshold_bytes`. Small files
    /// finish saving quickly, so checking often is cheap and responsive.
    pub dense_poll_interval_ms: u64,
    /// Poll cadence for large files, which take longer to finish saving and
    /// cost more to re-copy.
    pub sparse_poll_interval_ms: u64,
    /// Boundary between dense and sparse polling.
    pub size_threshold_bytes: u64,
    /// Consecutive quiet mtime checks required before a file counts as
    /// settled. A single quiet tick during a multi-phase save is common and
    /// misleading, so one observation is never enough.
    pub stability_checks: u32,
    /// Upper bound on one settle attempt; past this the cycle is abandoned
    /// until the next natural trigger.
    pub max_stability_wait_ms: u64,
    /// Backoff applied between failed evaluation cycles, multiplied by the
    /// consecutive-failure count.
    pub failure_backoff_ms: u64,
    /// Consecutive evaluation failures before the target logs a hard failure
    /// and returns to idle.
    pub max_failures: u32,
    /// Cadence of the coarse periodic sweep that catches events the OS
    /// watcher missed (common on SMB mounts) and discovers new files.
    pub sweep_interval_ms: u64,
    /// Evaluation cycles allowed to run copy/decode work at the same time
    /// across all targets.
    pub max_concurrent_cycles: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 2_000,
            dense_poll_interval_ms: 1_000,
            sparse_poll_interval_ms: 15_000,
            size_threshold_bytes: 10 * 1024 * 1024,
            stability_checks: 5,
            max_stability_wait_ms: 5 * 60 * 1_000,
            failure_backoff_ms: 5_000,
            max_failures: 5,
            sweep_interval_ms: 60_000,
            max_concurrent_cycles: 4,
        }
    }
}

impl WatcherConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms.max(1))
    }

    pub fn poll_interval(&self, file_size: u64) -> Duration {
        if file_size < self.size_threshold_bytes {
            Duration::from_millis(self.dense_poll_interval_ms.max(1))
        } else {
            Duration::from_millis(self.sparse_poll_interval_ms.max(1))
        }
    }

    pub fn max_stability_wait(&self) -> Duration {
        Duration::from_millis(self.max_stability_wait_ms.max(1))
    }

    pub fn failure_backoff(&self, consecutive_failures: u32) -> Duration {
        Duration::from_millis(self.failure_backoff_ms.saturating_mul(u64::from(consecutive_failures.max(1))))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Stable-copy acquisition tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Refuse to hand the decoder the source path when no valid cache copy
    /// can be produced. Disabling this restores the legacy
    /// read-the-source-directly fallback, which is exactly the behaviour
    /// that contends with saves; leave it on unless debugging.
    pub strict_no_direct_read: bool,
    /// Extra mtime confirmation checks performed by the copier itself before
    /// any read handle is opened (defense in depth against racing the
    /// scheduler's stability verdict).
    pub confirm_checks: u32,
    pub confirm_interval_ms: u64,
    /// Maximum acquire attempts per cycle.
    pub max_attempts: u32,
    /// Delay between attempts after a sharing violation or lost stability.
    pub retry_backoff_ms: u64,
    /// Copy transfer chunk size. Smaller chunks shorten the window any
    /// single read holds the source handle and tighten cancellation latency.
    pub chunk_size_bytes: usize,
    /// Tolerated mtime drift when matching a baseline stat for quick-skip.
    pub mtime_tolerance_ms: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            strict_no_direct_read: true,
            confirm_checks: 2,
            confirm_interval_ms: 500,
            max_attempts: 5,
            retry_backoff_ms: 2_000,
            chunk_size_bytes: 4 * 1024 * 1024,
            mtime_tolerance_ms: 2_000,
        }
    }
}

impl CopyConfig {
    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.max(1))
    }

    pub fn mtime_tolerance(&self) -> Duration {
        Duration::from_millis(self.mtime_tolerance_ms)
    }
}
