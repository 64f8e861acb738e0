use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use symflow_core::default_media_extensions;

fn default_ignored_segments() -> Vec<String> {
    vec!["BDMV".to_string()]
}

/// Source that produced the loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Mount points the daemon operates between. Both are required; there is no
/// sensible default for someone else's media layout.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the (typically cloud-mounted) media tree being watched.
    pub monitored_root: PathBuf,
    /// Root under which symbolic links are created, mirroring the monitored
    /// tree's structure. This is the tree the media server should index.
    pub link_base: PathBuf,
}

/// Link creation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaterializeConfig {
    /// Extensions linked as media. Case-insensitive, leading dot optional.
    pub media_extensions: Vec<String>,
    /// Path segments excluded everywhere: scanning, linking, and the index.
    /// The default skips Blu-ray disc image internals.
    pub ignored_segments: Vec<String>,
    /// Replace an existing link target instead of leaving it untouched.
    pub overwrite: bool,
}

impl Default for MaterializeConfig {
    fn default() -> Self {
        Self {
            media_extensions: default_media_extensions(),
            ignored_segments: default_ignored_segments(),
            overwrite: false,
        }
    }
}

/// Periodic full-tree scan tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Seconds between sweeps. Lower catches missed watcher events sooner at
    /// the cost of more stat traffic on the mount.
    pub interval_secs: u64,
    /// Seconds an unchanged path may skip reconciliation via the hot cache.
    /// Must stay below the index GC age so live paths keep their records.
    pub cache_max_age_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            cache_max_age_secs: 3_600,
        }
    }
}

/// Remote change-feed poller. Disabled unless a root item id is configured.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    /// Change-feed API base URL.
    pub base_url: String,
    /// Bearer token for the feed API.
    pub api_token: String,
    /// Feed id of the remote folder mounted at `monitored_root`.
    pub root_item_id: String,
    /// Seconds between change-feed polls.
    pub interval_secs: u64,
    /// Seconds per feed request before giving up.
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_token: String::new(),
            root_item_id: String::new(),
            interval_secs: 60,
            timeout_secs: 30,
        }
    }
}

/// Task pipeline tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Worker pool size. Link creation is cheap; a handful is plenty.
    pub workers: usize,
    /// Execution attempts before a task is marked failed.
    pub max_retries: u32,
    /// Seconds a failed task waits before re-entering the queue.
    pub retry_delay_secs: u64,
    /// Seconds terminal task records stay visible for inspection.
    pub retention_secs: u64,
    /// Seconds between terminal-record purge sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_delay_secs: 5,
            retention_secs: 86_400,
            sweep_interval_secs: 600,
        }
    }
}

/// Persistent path index store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexConfig {
    /// SQLite database location. Parent directories are created as needed.
    pub path: PathBuf,
    /// Compact the database at startup once the file exceeds this many bytes.
    /// Zero disables startup compaction.
    pub compact_threshold_bytes: u64,
    /// Seconds after which a record nothing has observed is garbage
    /// collected. Must stay above the scan cache age.
    pub gc_max_age_secs: u64,
    /// Seconds between garbage collection sweeps.
    pub gc_interval_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/symflow.db"),
            compact_threshold_bytes: 100 * 1024 * 1024,
            gc_max_age_secs: 7 * 86_400,
            gc_interval_secs: 86_400,
        }
    }
}

/// Media server notification. Disabled unless a base URL is configured.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifierSettings {
    /// Emby-compatible server base URL, e.g. `http://emby:8096/emby`.
    pub base_url: String,
    pub api_token: String,
    /// Seconds per HTTP request before giving up.
    pub timeout_secs: u64,
    /// Attempts per library refresh call.
    pub retry_count: u32,
    /// Seconds between refresh attempts.
    pub retry_delay_secs: u64,
    /// Seconds between flushes of the accumulated refresh batch.
    pub flush_interval_secs: u64,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            timeout_secs: 30,
            retry_count: 3,
            retry_delay_secs: 5,
            flush_interval_secs: 30,
        }
    }
}

/// Top-level daemon configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub materialize: MaterializeConfig,
    pub scan: ScanConfig,
    pub remote: RemoteConfig,
    pub pipeline: PipelineSettings,
    pub index: IndexConfig,
    pub notifier: NotifierSettings,
}

impl Config {
    /// Load configuration using environment overrides. Evaluation order:
    /// 1) `$SYMFLOW_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$SYMFLOW_CONFIG_JSON` (inline JSON),
    /// 3) the first well-known file that exists,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var("SYMFLOW_CONFIG_PATH")
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var("SYMFLOW_CONFIG_JSON")
            && !raw.trim().is_empty()
        {
            let parsed =
                Self::parse_json(&raw).context("failed to parse SYMFLOW_CONFIG_JSON")?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Some("toml") => toml::from_str(&contents)
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
            "symflow.toml",
            "symflow.json",
            "config/symflow.toml",
            "config/symflow.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }
}
