//! Persistence of the last-known-good snapshot per watched file.
//!
//! Baselines are compressed serde_json snapshots with a small header: magic,
//! format version, and an algorithm tag byte. Readers dispatch on the stored
//! tag, not on configuration, so baselines written under a previously
//! configured algorithm stay readable after the setting changes. Writes go
//! through a temp file and an atomic rename so a reader never observes a
//! partially written baseline.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::snapshot::{Snapshot, target_key};

const MAGIC: &[u8; 4] = b"GWBL";
const FORMAT_VERSION: u8 = 1;

/// Compression applied to newly written baselines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Store raw json. Useful for debugging baselines with a text editor.
    None,
    #[default]
    Gzip,
    Zlib,
}

impl CompressionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Gzip => 1,
            CompressionAlgorithm::Zlib => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Gzip),
            2 => Some(CompressionAlgorithm::Zlib),
            _ => None,
        }
    }
}

/// Stores one baseline file per target under a dedicated directory.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    dir: PathBuf,
    algorithm: CompressionAlgorithm,
}

impl BaselineStore {
    pub fn new(dir: impl Into<PathBuf>, algorithm: CompressionAlgorithm) -> Self {
        Self {
            dir: dir.into(),
            algorithm,
        }
    }

    pub fn baseline_path(&self, source: &Path) -> PathBuf {
        self.dir.join(format!("{}.baseline", target_key(source)))
    }

    /// Atomically replace the baseline for `source`.
    pub async fn save(&self, source: &Path, snapshot: &Snapshot) -> Result<()> {
        let payload = encode(snapshot, self.algorithm)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| cache_write(&self.dir, err))?;

        let final_path = self.baseline_path(source);
        let temp_path = self
            .dir
            .join(format!(".{}.tmp-{}", target_key(source), uuid::Uuid::new_v4()));

        if let Err(err) = tokio::fs::write(&temp_path, &payload).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(cache_write(&temp_path, err));
        }
        if let Err(err) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(cache_write(&final_path, err));
        }

        debug!(
            source = %source.display(),
            baseline = %final_path.display(),
            "baseline updated"
        );
        Ok(())
    }

    /// Load the persisted baseline, or `None` when the target has never been
    /// baselined. Corrupt content is an error; callers decide whether to
    /// treat it as absent.
    pub async fn load(&self, source: &Path) -> Result<Option<Snapshot>> {
        let path = self.baseline_path(source);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        decode(&bytes).map(Some)
    }

    pub async fn remove(&self, source: &Path) -> Result<()> {
        match tokio::fs::remove_file(self.baseline_path(source)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn cache_write(path: &Path, source: std::io::Error) -> WatchError {
    WatchError::CacheWrite {
        path: path.to_path_buf(),
        source,
    }
}

fn encode(snapshot: &Snapshot, algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(snapshot)?;
    let mut out = Vec::with_capacity(json.len() / 2 + 8);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.push(algorithm.tag());
    match algorithm {
        CompressionAlgorithm::None => out.extend_from_slice(&json),
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(&mut out, Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?;
        }
        CompressionAlgorithm::Zlib => {
            let mut encoder = ZlibEncoder::new(&mut out, Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?;
        }
    }
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<Snapshot> {
    let (header, body) = bytes
        .split_at_checked(6)
        .ok_or_else(|| WatchError::Internal("baseline file truncated".into()))?;
    if &header[..4] != MAGIC {
        return Err(WatchError::Internal("baseline magic mismatch".into()));
    }
    if header[4] != FORMAT_VERSION {
        return Err(WatchError::Internal(format!(
            "unsupported baseline format version {}",
            header[4]
        )));
    }
    let algorithm = CompressionAlgorithm::from_tag(header[5])
        .ok_or_else(|| WatchError::Internal(format!("unknown compression tag {}", header[5])))?;

    let json = match algorithm {
        CompressionAlgorithm::None => body.to_vec(),
        CompressionAlgorithm::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(body).read_to_end(&mut out)?;
            out
        }
        CompressionAlgorithm::Zlib => {
            let mut out = Vec::new();
            ZlibDecoder::new(body).read_to_end(&mut out)?;
            out
        }
    };
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{CellContent, DecodedWorkbook, SheetCells};
    use std::collections::BTreeMap;

    fn sample_snapshot() -> Snapshot {
        let mut cells = SheetCells::new();
        cells.insert(
            "A1".into(),
            CellContent {
                value: Some(serde_json::json!(10)),
                formula: None,
                array_formula: false,
            },
        );
        cells.insert(
            "B1".into(),
            CellContent {
                value: Some(serde_json::json!(84)),
                formula: Some("[1]Rates!A1*2".into()),
                array_formula: false,
            },
        );
        let mut sheets = BTreeMap::new();
        sheets.insert("Data".to_string(), cells);
        Snapshot::from_decoded(
            DecodedWorkbook {
                sheets,
                external_refs: BTreeMap::from([(1, r"\\share\rates.xlsx".into())]),
                last_author: Some("alice".into()),
            },
            123_456,
            2_048,
        )
    }

    #[tokio::test]
    async fn round_trips_under_every_algorithm() {
        for algorithm in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Zlib,
        ] {
            let dir = tempfile::tempdir().unwrap();
            let store = BaselineStore::new(dir.path(), algorithm);
            let snapshot = sample_snapshot();
            let source = Path::new("/srv/share/budget.xlsx");

            store.save(source, &snapshot).await.unwrap();
            let loaded = store.load(source).await.unwrap().unwrap();
            assert_eq!(loaded, snapshot, "algorithm {algorithm:?}");
        }
    }

    #[tokio::test]
    async fn reads_baselines_written_under_a_different_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        let source = Path::new("/srv/share/budget.xlsx");
        let snapshot = sample_snapshot();

        let gzip_store = BaselineStore::new(dir.path(), CompressionAlgorithm::Gzip);
        gzip_store.save(source, &snapshot).await.unwrap();

        // Operator reconfigures; old baseline must still load.
        let zlib_store = BaselineStore::new(dir.path(), CompressionAlgorithm::Zlib);
        let loaded = zlib_store.load(source).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn missing_baseline_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path(), CompressionAlgorithm::Gzip);
        let loaded = store.load(Path::new("/nowhere.xlsx")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn corrupt_baseline_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path(), CompressionAlgorithm::Gzip);
        let source = Path::new("/srv/share/budget.xlsx");
        std::fs::write(store.baseline_path(source), b"garbage").unwrap();

        assert!(store.load(source).await.is_err());
    }

    #[tokio::test]
    async fn save_supersedes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path(), CompressionAlgorithm::Gzip);
        let source = Path::new("/srv/share/budget.xlsx");

        let first = sample_snapshot();
        store.save(source, &first).await.unwrap();

        let mut second = sample_snapshot();
        second.last_author = Some("bob".into());
        store.save(source, &second).await.unwrap();

        let loaded = store.load(source).await.unwrap().unwrap();
        assert_eq!(loaded.last_author.as_deref(), Some("bob"));

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
