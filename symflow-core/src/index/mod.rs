use async_trait::async_trait;

use crate::error::Result;
use crate::types::{FileRecord, SnapshotEntry, TreeDiff};

pub mod sqlite;
pub use sqlite::SqliteFileIndex;

/// Persistent mapping from path to last-known file attributes.
///
/// Implementations serialize all mutating calls (and `diff`, which must see a
/// consistent snapshot) behind a single-writer discipline; concurrent readers
/// may proceed.
#[async_trait]
pub trait FileIndex: Send + Sync {
    /// Insert or update a record. Returns `true` iff the record is new or
    /// materially changed (size or modified_time differ from the stored
    /// value). `last_seen` is refreshed on every call, changed or not.
    async fn upsert(&self, record: &FileRecord) -> Result<bool>;

    async fn get(&self, path: &str) -> Result<Option<FileRecord>>;

    async fn children(&self, parent_path: &str) -> Result<Vec<FileRecord>>;

    /// Returns `true` iff a record existed and was removed.
    async fn remove(&self, path: &str) -> Result<bool>;

    /// Compare an externally supplied full listing against stored state in
    /// one pass. Atomic with respect to concurrent `upsert`/`remove`.
    async fn diff(&self, snapshot: &[SnapshotEntry]) -> Result<TreeDiff>;

    /// Delete records whose `last_seen` is older than `max_age_secs`.
    /// Returns the number of records removed.
    async fn prune_stale(&self, max_age_secs: i64) -> Result<u64>;

    /// Reclaim unused on-disk space. Never called on a user-facing path.
    async fn compact(&self) -> Result<()>;
}
