//! Change detection for spreadsheet files on local and SMB volumes.
//!
//! The pipeline never decodes a watched file in place: filesystem events and
//! a periodic sweep feed per-target schedulers, each save is debounced and
//! stat-settled, a stable local copy is captured, and only that copy is
//! decoded and diffed against the persisted baseline. Surfaced changes are
//! classified (direct edit, formula edit, external-reference refresh, or
//! recalculation fallout) and appended to the change log.

pub mod baseline;
pub mod cache;
pub mod config;
pub mod decode;
pub mod diff;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod snapshot;
pub mod watch;

pub use baseline::{BaselineStore, CompressionAlgorithm};
pub use cache::{CacheEntry, StableCopy};
pub use config::{CopyConfig, WatcherConfig};
pub use decode::{DecodeError, SnapshotDecoder, XlsxDecoder};
pub use diff::{ChangeKind, ChangeRecord, DiffEngine, DiffPolicy, Evaluation};
pub use error::{Result, WatchError};
pub use pipeline::{CycleOutcome, CycleRunner, Pipeline};
pub use sink::{
    ChangeContext, ChangeLogSink, CopyFailureRecord, CsvChangeLog, JsonlOpsLog, NoopChangeLog,
    NoopOpsLog, OperationalLogSink,
};
pub use snapshot::{CellContent, DecodedWorkbook, SheetCells, Snapshot};
pub use watch::WatchService;
