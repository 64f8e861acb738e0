use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current Unix timestamp in seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// True when any component of `path` matches one of `segments`. Every change
/// source and the materializer apply the same filter, so paths under a
/// skipped segment never enter the index in the first place.
pub fn has_ignored_segment(path: &Path, segments: &[String]) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .map(|segment| segments.iter().any(|s| s == segment))
            .unwrap_or(false)
    })
}

/// One row of last-known file state in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    /// Size in bytes, 0 for directories.
    pub size: i64,
    /// Unix timestamp of the last observed modification.
    pub modified_time: i64,
    pub is_directory: bool,
    pub parent_path: Option<String>,
    /// Remote-source identifier (e.g. cloud file id).
    pub external_id: Option<String>,
    /// Unix timestamp of the last observation, refreshed even when unchanged.
    pub last_seen: i64,
}

/// A single `(path, size, modified_time)` entry of a full-tree listing,
/// as supplied to [`FileIndex::diff`](crate::index::FileIndex::diff).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub size: i64,
    pub modified_time: i64,
}

/// Result of comparing a full-tree snapshot against stored index state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub new: Vec<SnapshotEntry>,
    pub modified: Vec<SnapshotEntry>,
    pub deleted: Vec<String>,
}

/// Outcome of reconciling one observation against the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Modified,
    Unchanged,
}

/// Which change source produced an observation. Determines task priority:
/// watcher events are the most immediate, scan sweeps the least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOrigin {
    Watcher,
    Poller,
    Scanner,
}

impl ChangeOrigin {
    /// Lower value means higher scheduling priority.
    pub fn priority(self) -> u8 {
        match self {
            ChangeOrigin::Watcher => 0,
            ChangeOrigin::Poller => 1,
            ChangeOrigin::Scanner => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOrigin::Watcher => "watcher",
            ChangeOrigin::Poller => "poller",
            ChangeOrigin::Scanner => "scanner",
        }
    }
}

/// Raw observation handed to the reconciler by a change source.
#[derive(Debug, Clone)]
pub struct Observation {
    pub path: String,
    pub size: i64,
    pub modified_time: i64,
    pub is_directory: bool,
    pub parent_path: Option<String>,
    pub external_id: Option<String>,
    pub origin: ChangeOrigin,
}

impl Observation {
    /// Build an observation for a local file from its filesystem metadata.
    pub fn for_local_file(path: &Path, meta: &std::fs::Metadata, origin: ChangeOrigin) -> Self {
        let modified_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_else(now_ts);

        Self {
            path: path.to_string_lossy().into_owned(),
            size: if meta.is_dir() { 0 } else { meta.len() as i64 },
            modified_time,
            is_directory: meta.is_dir(),
            parent_path: path.parent().map(|p| p.to_string_lossy().into_owned()),
            external_id: None,
            origin,
        }
    }
}
