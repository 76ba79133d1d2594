use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::decode::DecodeError;

#[derive(Error, Debug)]
pub enum WatchError {
    /// The source file stayed locked or kept changing for the whole retry
    /// budget. Fatal for this cycle only; the next filesystem event or sweep
    /// re-arms the target.
    #[error(
        "source busy: {} still contended after {attempts} attempts ({total_wait:?} total wait)",
        path.display()
    )]
    SourceBusy {
        path: PathBuf,
        attempts: u32,
        total_wait: Duration,
    },

    /// The source file disappeared mid-cycle.
    #[error("source vanished: {}", .0.display())]
    SourceVanished(PathBuf),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Writing to the local cache or baseline directory failed. This is an
    /// operational misconfiguration (disk full, permissions), not contention,
    /// and is never retried.
    #[error("cache write failed for {}: {source}", path.display())]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("filesystem watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Whether an io error looks like another process holding an incompatible
/// lock on the file. On Windows this is ERROR_SHARING_VIOLATION (32) or
/// ERROR_LOCK_VIOLATION (33); elsewhere we treat permission/busy kinds as
/// contention, which is what SMB clients surface for in-flight saves.
pub fn is_sharing_violation(err: &std::io::Error) -> bool {
    #[cfg(windows)]
    {
        if matches!(err.raw_os_error(), Some(32) | Some(33)) {
            return true;
        }
    }
    matches!(
        err.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::ResourceBusy
    )
}
