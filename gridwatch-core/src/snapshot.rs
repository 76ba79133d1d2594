//! Decoded workbook snapshots and the fingerprints derived from them.
//!
//! A [`Snapshot`] is the immutable decoded content of one spreadsheet file at
//! one instant: per-sheet cell maps, the resolved external-reference table,
//! and the last-modified-by author, plus the source stat captured alongside
//! so later cycles can skip work when nothing moved.

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One cell's content: a value, a formula, or both (formula cells carry the
/// last calculated value next to the formula text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub array_formula: bool,
}

impl CellContent {
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.formula.is_none()
    }
}

/// Cell address ("A1") to content, per sheet. BTreeMaps keep serialization
/// deterministic so content hashes are stable across runs.
pub type SheetCells = BTreeMap<String, CellContent>;

/// Workbook content as produced by a [`crate::decode::SnapshotDecoder`],
/// before source stat metadata is attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedWorkbook {
    pub sheets: BTreeMap<String, SheetCells>,
    /// Placeholder index (the `[n]` in formulas) to resolved workbook path.
    pub external_refs: BTreeMap<u32, String>,
    pub last_author: Option<String>,
}

/// Immutable decoded content of a file at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sheets: BTreeMap<String, SheetCells>,
    /// Placeholder index to resolved external workbook path.
    #[serde(default)]
    pub external_refs: BTreeMap<u32, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_author: Option<String>,
    /// Fingerprint of `sheets`; equal hashes mean cell-identical content.
    pub content_hash: String,
    /// Source mtime observed when the stable copy completed, as unix
    /// milliseconds. Used for the stat quick-skip on later cycles.
    pub source_mtime_ms: i64,
    pub source_size: u64,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn from_decoded(
        decoded: DecodedWorkbook,
        source_mtime_ms: i64,
        source_size: u64,
    ) -> Self {
        let content_hash = content_hash(&decoded.sheets);
        Self {
            sheets: decoded.sheets,
            external_refs: decoded.external_refs,
            last_author: decoded.last_author,
            content_hash,
            source_mtime_ms,
            source_size,
            captured_at: Utc::now(),
        }
    }
}

/// Fingerprint of the cell content alone. Metadata (author, stat) is
/// deliberately excluded so a metadata-only save does not look like a
/// content change.
pub fn content_hash(sheets: &BTreeMap<String, SheetCells>) -> String {
    // BTreeMap iteration order makes this canonical without sorting.
    let bytes = serde_json::to_vec(sheets).unwrap_or_default();
    encode_hash(&[&bytes])
}

/// Deterministic key for a watched source path, used to derive cache and
/// baseline file names that are safe on any filesystem.
pub fn target_key(path: &Path) -> String {
    encode_hash(&[path.to_string_lossy().as_bytes()])
}

pub(crate) fn encode_hash(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..16])
}
