//! Configuration loading and validation for the gridwatch daemon.
//!
//! One aggregate [`GridwatchConfig`] covers watch roots, storage directories,
//! scheduler and copy tuning, and the diff policy. Every field has a default
//! so deployments override only what they need, and every load reports the
//! source it came from so startup logs can say where the settings originated.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use gridwatch_core::baseline::CompressionAlgorithm;
use gridwatch_core::config::{CopyConfig, WatcherConfig};
use gridwatch_core::diff::DiffPolicy;

fn default_extensions() -> Vec<String> {
    vec!["xlsx".to_string(), "xlsm".to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("gridwatch-data")
}

/// Source that produced the loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    /// Path passed on the command line.
    Cli(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Top-level daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridwatchConfig {
    /// Directories scanned and watched for spreadsheet files. Must be
    /// non-empty for the daemon to do anything.
    pub watch_roots: Vec<PathBuf>,
    /// File extensions treated as spreadsheets, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Parent directory for cache copies, baselines, and logs. The
    /// per-purpose directories below default to children of this one when
    /// not set explicitly.
    pub data_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub baseline_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub baseline_compression: CompressionAlgorithm,
    pub watcher: WatcherConfig,
    pub copy: CopyConfig,
    pub policy: DiffPolicy,
}

impl Default for GridwatchConfig {
    fn default() -> Self {
        Self {
            watch_roots: Vec::new(),
            extensions: default_extensions(),
            data_dir: default_data_dir(),
            cache_dir: None,
            baseline_dir: None,
            log_dir: None,
            baseline_compression: CompressionAlgorithm::default(),
            watcher: WatcherConfig::default(),
            copy: CopyConfig::default(),
            policy: DiffPolicy::default(),
        }
    }
}

impl GridwatchConfig {
    /// Load configuration overrides using environment variables.
    /// Evaluation order:
    /// 1) `$GRIDWATCH_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$GRIDWATCH_CONFIG_JSON` (inline JSON),
    /// 3) a default config file next to the working directory,
    /// 4) built-in defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var("GRIDWATCH_CONFIG_PATH")
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var("GRIDWATCH_CONFIG_JSON")
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .context("failed to parse GRIDWATCH_CONFIG_JSON")?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Some("toml") | Some("tml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // Try TOML first, then JSON for convenience.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "gridwatch.toml",
            "gridwatch.json",
            "config/gridwatch.toml",
            "config/gridwatch.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    pub fn baseline_dir(&self) -> PathBuf {
        self.baseline_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("baselines"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    /// Reject configurations that cannot work at all. Soft problems (an
    /// unreachable root at startup, say) are left to runtime handling.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.watch_roots.is_empty() {
            return Err(anyhow!("no watch_roots configured"));
        }
        if self.extensions.is_empty() {
            return Err(anyhow!("extensions list is empty"));
        }
        if self.watcher.stability_checks == 0 {
            return Err(anyhow!("watcher.stability_checks must be at least 1"));
        }
        if self.watcher.max_concurrent_cycles == 0 {
            return Err(anyhow!("watcher.max_concurrent_cycles must be at least 1"));
        }
        if self.copy.max_attempts == 0 {
            return Err(anyhow!("copy.max_attempts must be at least 1"));
        }
        if self.watcher.debounce_window_ms >= self.watcher.max_stability_wait_ms {
            return Err(anyhow!(
                "watcher.debounce_window_ms must be below watcher.max_stability_wait_ms"
            ));
        }
        Ok(())
    }
}
