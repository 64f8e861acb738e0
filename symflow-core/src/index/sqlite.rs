use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::index::FileIndex;
use crate::types::{FileRecord, SnapshotEntry, TreeDiff, now_ts};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    modified_time INTEGER NOT NULL,
    is_directory INTEGER NOT NULL,
    parent_path TEXT,
    external_id TEXT,
    last_seen INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_parent_path ON files (parent_path);
CREATE INDEX IF NOT EXISTS idx_files_external_id ON files (external_id);
CREATE INDEX IF NOT EXISTS idx_files_last_seen ON files (last_seen);
"#;

/// Embedded SQLite-backed [`FileIndex`].
///
/// SQLite already serializes writers, but the write gate also covers `diff`,
/// which reads the whole table and must not interleave with a concurrent
/// upsert for the same path.
pub struct SqliteFileIndex {
    pool: SqlitePool,
    db_path: PathBuf,
    write_gate: RwLock<()>,
}

impl std::fmt::Debug for SqliteFileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteFileIndex")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl SqliteFileIndex {
    /// Open (creating if missing) the index store at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!("Opened file index at {}", db_path.display());

        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
            write_gate: RwLock::new(()),
        })
    }

    /// Run a compaction pass if the on-disk file has grown past `threshold`
    /// bytes. Intended for startup and timer-driven maintenance only.
    pub async fn compact_if_oversized(&self, threshold: u64) -> Result<()> {
        let size = match std::fs::metadata(&self.db_path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Failed to stat index file {}: {}", self.db_path.display(), e);
                return Ok(());
            }
        };

        if size > threshold {
            info!(
                "Index size ({} bytes) exceeds threshold ({} bytes), compacting",
                size, threshold
            );
            self.compact().await?;
        }
        Ok(())
    }

    fn record_from_row(row: &SqliteRow) -> Result<FileRecord> {
        Ok(FileRecord {
            path: row.try_get("path").map_err(sqlx_field)?,
            size: row.try_get("size").map_err(sqlx_field)?,
            modified_time: row.try_get("modified_time").map_err(sqlx_field)?,
            is_directory: row.try_get("is_directory").map_err(sqlx_field)?,
            parent_path: row.try_get("parent_path").map_err(sqlx_field)?,
            external_id: row.try_get("external_id").map_err(sqlx_field)?,
            last_seen: row.try_get("last_seen").map_err(sqlx_field)?,
        })
    }
}

fn sqlx_field(err: sqlx::Error) -> SyncError {
    SyncError::Index(format!("row decode failed: {err}"))
}

#[async_trait]
impl FileIndex for SqliteFileIndex {
    async fn upsert(&self, record: &FileRecord) -> Result<bool> {
        let _gate = self.write_gate.write().await;

        let existing = sqlx::query("SELECT size, modified_time FROM files WHERE path = ?1")
            .bind(&record.path)
            .fetch_optional(&self.pool)
            .await?;

        let now = now_ts();

        match existing {
            Some(row) => {
                let size: i64 = row.try_get("size").map_err(sqlx_field)?;
                let modified_time: i64 = row.try_get("modified_time").map_err(sqlx_field)?;

                if size == record.size && modified_time == record.modified_time {
                    sqlx::query("UPDATE files SET last_seen = ?1 WHERE path = ?2")
                        .bind(now)
                        .bind(&record.path)
                        .execute(&self.pool)
                        .await?;
                    Ok(false)
                } else {
                    sqlx::query(
                        "UPDATE files SET size = ?1, modified_time = ?2, is_directory = ?3, \
                         parent_path = ?4, external_id = ?5, last_seen = ?6 WHERE path = ?7",
                    )
                    .bind(record.size)
                    .bind(record.modified_time)
                    .bind(record.is_directory)
                    .bind(&record.parent_path)
                    .bind(&record.external_id)
                    .bind(now)
                    .bind(&record.path)
                    .execute(&self.pool)
                    .await?;
                    debug!("Updated index record for {}", record.path);
                    Ok(true)
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO files \
                     (path, size, modified_time, is_directory, parent_path, external_id, last_seen) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(&record.path)
                .bind(record.size)
                .bind(record.modified_time)
                .bind(record.is_directory)
                .bind(&record.parent_path)
                .bind(&record.external_id)
                .bind(now)
                .execute(&self.pool)
                .await?;
                debug!("Inserted index record for {}", record.path);
                Ok(true)
            }
        }
    }

    async fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let _gate = self.write_gate.read().await;

        let row = sqlx::query(
            "SELECT path, size, modified_time, is_directory, parent_path, external_id, last_seen \
             FROM files WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn children(&self, parent_path: &str) -> Result<Vec<FileRecord>> {
        let _gate = self.write_gate.read().await;

        let rows = sqlx::query(
            "SELECT path, size, modified_time, is_directory, parent_path, external_id, last_seen \
             FROM files WHERE parent_path = ?1",
        )
        .bind(parent_path)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        let _gate = self.write_gate.write().await;

        let result = sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn diff(&self, snapshot: &[SnapshotEntry]) -> Result<TreeDiff> {
        // Held exclusively so the comparison never observes a state mixing
        // pre- and mid-update records for the same path.
        let _gate = self.write_gate.write().await;

        let rows = sqlx::query("SELECT path, size, modified_time FROM files")
            .fetch_all(&self.pool)
            .await?;

        let mut stored: HashMap<String, (i64, i64)> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let path: String = row.try_get("path").map_err(sqlx_field)?;
            let size: i64 = row.try_get("size").map_err(sqlx_field)?;
            let modified_time: i64 = row.try_get("modified_time").map_err(sqlx_field)?;
            stored.insert(path, (size, modified_time));
        }

        let current_paths: HashSet<&str> = snapshot.iter().map(|e| e.path.as_str()).collect();

        let mut result = TreeDiff::default();
        for entry in snapshot {
            match stored.get(&entry.path) {
                None => result.new.push(entry.clone()),
                Some(&(size, modified_time)) => {
                    if size != entry.size || modified_time != entry.modified_time {
                        result.modified.push(entry.clone());
                    }
                }
            }
        }

        result.deleted = stored
            .into_keys()
            .filter(|path| !current_paths.contains(path.as_str()))
            .collect();

        Ok(result)
    }

    async fn prune_stale(&self, max_age_secs: i64) -> Result<u64> {
        let _gate = self.write_gate.write().await;

        let cutoff = now_ts() - max_age_secs;
        let result = sqlx::query("DELETE FROM files WHERE last_seen < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            info!("Pruned {} stale index records", pruned);
        }
        Ok(pruned)
    }

    async fn compact(&self) -> Result<()> {
        let _gate = self.write_gate.write().await;

        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!("Index compaction complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(path: &str, size: i64, mtime: i64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size,
            modified_time: mtime,
            is_directory: false,
            parent_path: Path::new(path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned()),
            external_id: None,
            last_seen: now_ts(),
        }
    }

    async fn open_index(dir: &TempDir) -> SqliteFileIndex {
        SqliteFileIndex::open(&dir.path().join("index.db"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_reports_new_then_unchanged() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;

        assert!(index.upsert(&record("/m/a.mkv", 100, 10)).await.unwrap());
        assert!(!index.upsert(&record("/m/a.mkv", 100, 10)).await.unwrap());

        let stored = index.get("/m/a.mkv").await.unwrap().unwrap();
        assert_eq!(stored.size, 100);
        assert_eq!(stored.modified_time, 10);
    }

    #[tokio::test]
    async fn upsert_detects_size_and_mtime_changes() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index.upsert(&record("/m/a.mkv", 100, 10)).await.unwrap();
        assert!(index.upsert(&record("/m/a.mkv", 50, 10)).await.unwrap());
        assert!(index.upsert(&record("/m/a.mkv", 50, 20)).await.unwrap());

        let stored = index.get("/m/a.mkv").await.unwrap().unwrap();
        assert_eq!(stored.size, 50);
        assert_eq!(stored.modified_time, 20);
    }

    #[tokio::test]
    async fn children_lists_records_under_parent() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index.upsert(&record("/m/show/e1.mkv", 1, 1)).await.unwrap();
        index.upsert(&record("/m/show/e2.mkv", 2, 2)).await.unwrap();
        index.upsert(&record("/m/other.mkv", 3, 3)).await.unwrap();

        let children = index.children("/m/show").await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|r| r.parent_path.as_deref() == Some("/m/show")));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index.upsert(&record("/m/a.mkv", 100, 10)).await.unwrap();
        assert!(index.remove("/m/a.mkv").await.unwrap());
        assert!(!index.remove("/m/a.mkv").await.unwrap());
        assert!(index.get("/m/a.mkv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn diff_classifies_new_modified_deleted() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index.upsert(&record("/m/kept.mkv", 100, 10)).await.unwrap();
        index.upsert(&record("/m/grown.mkv", 100, 10)).await.unwrap();
        index.upsert(&record("/m/gone.mkv", 100, 10)).await.unwrap();

        let snapshot = vec![
            SnapshotEntry {
                path: "/m/kept.mkv".into(),
                size: 100,
                modified_time: 10,
            },
            SnapshotEntry {
                path: "/m/grown.mkv".into(),
                size: 200,
                modified_time: 20,
            },
            SnapshotEntry {
                path: "/m/fresh.mkv".into(),
                size: 1,
                modified_time: 1,
            },
        ];

        let diff = index.diff(&snapshot).await.unwrap();
        assert_eq!(diff.new.len(), 1);
        assert_eq!(diff.new[0].path, "/m/fresh.mkv");
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].path, "/m/grown.mkv");
        assert_eq!(diff.deleted, vec!["/m/gone.mkv".to_string()]);
    }

    #[tokio::test]
    async fn diff_reports_deletion_exactly_once() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index.upsert(&record("/m/gone.mkv", 100, 10)).await.unwrap();

        let diff = index.diff(&[]).await.unwrap();
        assert_eq!(diff.deleted, vec!["/m/gone.mkv".to_string()]);

        // After the caller acts on the report the record is gone and a second
        // diff no longer mentions the path.
        index.remove("/m/gone.mkv").await.unwrap();
        let diff = index.diff(&[]).await.unwrap();
        assert!(diff.deleted.is_empty());
    }

    #[tokio::test]
    async fn prune_stale_removes_only_old_records() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index.upsert(&record("/m/live.mkv", 100, 10)).await.unwrap();
        index.upsert(&record("/m/stale.mkv", 100, 10)).await.unwrap();

        // Backdate one record past the cutoff.
        sqlx::query("UPDATE files SET last_seen = ?1 WHERE path = ?2")
            .bind(now_ts() - 100_000)
            .bind("/m/stale.mkv")
            .execute(&index.pool)
            .await
            .unwrap();

        let pruned = index.prune_stale(86_400).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(index.get("/m/stale.mkv").await.unwrap().is_none());
        assert!(index.get("/m/live.mkv").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn compact_succeeds_on_live_index() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index.upsert(&record("/m/a.mkv", 100, 10)).await.unwrap();
        index.compact().await.unwrap();
        index.compact_if_oversized(0).await.unwrap();
        assert!(index.get("/m/a.mkv").await.unwrap().is_some());
    }
}
