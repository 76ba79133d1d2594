//! Change-log and operational-log collaborators.
//!
//! Two append-only sinks hang off the pipeline: the change log receives every
//! surfaced [`ChangeRecord`] for audit, and the operational log receives one
//! structured record per failed copy attempt. The operational log is the
//! primary diagnostic for the lock-contention failure mode: it is what
//! separates "our copies collide with saves" from "something external holds a
//! stale handle" in a postmortem.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::diff::ChangeRecord;

/// Context shared by all records of one surfaced diff cycle.
#[derive(Debug, Clone)]
pub struct ChangeContext {
    pub path: PathBuf,
    pub author: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One structured record per failed copy attempt.
#[derive(Debug, Clone, Serialize)]
pub struct CopyFailureRecord {
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    /// Correlates the attempts of a single acquire cycle.
    pub cycle_id: uuid::Uuid,
    pub attempt: u32,
    pub error: String,
}

#[async_trait]
pub trait ChangeLogSink: Send + Sync {
    async fn record_changes(&self, context: &ChangeContext, records: &[ChangeRecord]);
}

#[async_trait]
pub trait OperationalLogSink: Send + Sync {
    async fn copy_failure(&self, record: CopyFailureRecord);
}

/// No-op sinks for tests and for callers that only want tracing output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChangeLog;

#[async_trait]
impl ChangeLogSink for NoopChangeLog {
    async fn record_changes(&self, _context: &ChangeContext, _records: &[ChangeRecord]) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOpsLog;

#[async_trait]
impl OperationalLogSink for NoopOpsLog {
    async fn copy_failure(&self, _record: CopyFailureRecord) {}
}

/// Gzip-compressed CSV change log with a date-stamped file name
/// (`change_log_YYYYMMDD.csv.gz`). Each append is written as a complete gzip
/// member, which concatenates into a single valid gzip stream.
#[derive(Debug)]
pub struct CsvChangeLog {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl CsvChangeLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.dir
            .join(format!("change_log_{}.csv.gz", Local::now().format("%Y%m%d")))
    }

    async fn append(&self, context: &ChangeContext, records: &[ChangeRecord]) -> std::io::Result<()> {
        let _guard = self.guard.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.log_path();
        let needs_header = tokio::fs::try_exists(&path).await.map(|exists| !exists)?;

        let mut csv = String::new();
        if needs_header {
            csv.push_str(
                "Timestamp,File,Sheet,Cell,Kind,Old_Value,New_Value,Old_Formula,New_Formula,Author\n",
            );
        }
        let timestamp = context.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
        let author = context.author.as_deref().unwrap_or("");
        for record in records {
            let _ = writeln!(
                csv,
                "{},{},{},{},{:?},{},{},{},{},{}",
                csv_field(&timestamp),
                csv_field(&context.path.to_string_lossy()),
                csv_field(&record.sheet),
                csv_field(&record.cell),
                record.kind,
                csv_field(&value_text(record.old_value.as_ref())),
                csv_field(&value_text(record.new_value.as_ref())),
                csv_field(record.old_formula.as_deref().unwrap_or("")),
                csv_field(record.new_formula.as_deref().unwrap_or("")),
                csv_field(author),
            );
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(csv.as_bytes())?;
        let compressed = encoder.finish()?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&compressed).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeLogSink for CsvChangeLog {
    async fn record_changes(&self, context: &ChangeContext, records: &[ChangeRecord]) {
        if records.is_empty() {
            return;
        }
        if let Err(err) = self.append(context, records).await {
            error!(
                path = %context.path.display(),
                "failed to append change log: {err}"
            );
        }
    }
}

/// Operational log as JSON lines (`ops_log_YYYYMMDD.jsonl`), one object per
/// copy failure.
#[derive(Debug)]
pub struct JsonlOpsLog {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl JsonlOpsLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.dir
            .join(format!("ops_log_{}.jsonl", Local::now().format("%Y%m%d")))
    }

    async fn append(&self, record: &CopyFailureRecord) -> std::io::Result<()> {
        let _guard = self.guard.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl OperationalLogSink for JsonlOpsLog {
    async fn copy_failure(&self, record: CopyFailureRecord) {
        if let Err(err) = self.append(&record).await {
            error!(
                path = %record.path.display(),
                "failed to append operational log: {err}"
            );
        }
    }
}

fn value_text(value: Option<&serde_json::Value>) -> String {
    match value {
        None => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Minimal RFC 4180 quoting; only fields containing separators or quotes are
/// wrapped.
fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
