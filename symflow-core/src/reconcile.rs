use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::index::FileIndex;
use crate::pipeline::{TaskPayload, TaskSink};
use crate::types::{Classification, FileRecord, Observation, now_ts};

/// The single synchronization point through which every change source passes
/// before the index is mutated.
///
/// The read-classify-upsert sequence is serialized per path, so two
/// concurrent observations of the same path can never both classify as new.
/// Sources themselves need no cross-source coordination beyond this.
pub struct Reconciler {
    index: Arc<dyn FileIndex>,
    sink: Arc<dyn TaskSink>,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish()
    }
}

impl Reconciler {
    pub fn new(index: Arc<dyn FileIndex>, sink: Arc<dyn TaskSink>) -> Self {
        Self {
            index,
            sink,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_path_lock(&self, path: &str) {
        let mut locks = self.path_locks.lock().await;
        if let Some(lock) = locks.get(path)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(path);
        }
    }

    /// Classify an observation against stored state, update the index, and
    /// enqueue a materialization task for anything new or modified.
    /// Unchanged observations still refresh `last_seen` and enqueue nothing.
    pub async fn observe(&self, observation: Observation) -> Result<Classification> {
        let lock = self.path_lock(&observation.path).await;
        let result = {
            let _guard = lock.lock().await;
            self.observe_locked(&observation).await
        };
        drop(lock);
        self.release_path_lock(&observation.path).await;
        result
    }

    async fn observe_locked(&self, observation: &Observation) -> Result<Classification> {
        let existing = self.index.get(&observation.path).await?;

        let classification = match &existing {
            None => Classification::New,
            Some(record)
                if record.size != observation.size
                    || record.modified_time != observation.modified_time =>
            {
                Classification::Modified
            }
            Some(_) => Classification::Unchanged,
        };

        let record = FileRecord {
            path: observation.path.clone(),
            size: observation.size,
            modified_time: observation.modified_time,
            is_directory: observation.is_directory,
            parent_path: observation.parent_path.clone(),
            // A local re-observation must not erase the remote id learned
            // from the feed.
            external_id: observation
                .external_id
                .clone()
                .or_else(|| existing.as_ref().and_then(|r| r.external_id.clone())),
            last_seen: now_ts(),
        };
        self.index.upsert(&record).await?;

        if classification != Classification::Unchanged && !observation.is_directory {
            let task_id = self
                .sink
                .submit(
                    TaskPayload::Materialize {
                        source: PathBuf::from(&observation.path),
                    },
                    observation.origin.priority(),
                )
                .await;
            info!(
                task = %task_id,
                origin = observation.origin.as_str(),
                "Enqueued materialization for {} ({:?})",
                observation.path,
                classification
            );
        } else {
            debug!(
                origin = observation.origin.as_str(),
                "Observation for {} classified {:?}", observation.path, classification
            );
        }

        Ok(classification)
    }

    /// Handle a reported absence: drop the index record and cancel any queued
    /// task for the path. Bypasses new/modified classification entirely.
    pub async fn forget(&self, path: &Path) -> Result<bool> {
        let key = path.to_string_lossy();
        let lock = self.path_lock(&key).await;
        let removed = {
            let _guard = lock.lock().await;
            let removed = self.index.remove(&key).await?;
            let cancelled = self.sink.cancel_path(path).await;
            if removed || cancelled > 0 {
                info!(
                    "Forgot {} (record removed: {}, tasks cancelled: {})",
                    path.display(),
                    removed,
                    cancelled
                );
            }
            removed
        };
        drop(lock);
        self.release_path_lock(&key).await;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SqliteFileIndex;
    use crate::pipeline::TaskId;
    use crate::types::ChangeOrigin;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        submitted: Mutex<Vec<(TaskPayload, u8)>>,
        cancelled: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl TaskSink for RecordingSink {
        async fn submit(&self, payload: TaskPayload, priority: u8) -> TaskId {
            self.submitted.lock().await.push((payload, priority));
            Uuid::now_v7()
        }

        async fn cancel_path(&self, path: &Path) -> usize {
            self.cancelled.lock().await.push(path.to_path_buf());
            1
        }
    }

    fn observation(path: &str, size: i64, mtime: i64, origin: ChangeOrigin) -> Observation {
        Observation {
            path: path.to_string(),
            size,
            modified_time: mtime,
            is_directory: false,
            parent_path: Path::new(path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned()),
            external_id: None,
            origin,
        }
    }

    async fn setup() -> (TempDir, Arc<RecordingSink>, Reconciler) {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(
            SqliteFileIndex::open(&dir.path().join("index.db"))
                .await
                .unwrap(),
        );
        let sink = Arc::new(RecordingSink::default());
        let reconciler = Reconciler::new(index, sink.clone());
        (dir, sink, reconciler)
    }

    #[tokio::test]
    async fn first_observation_is_new_and_enqueues_at_origin_priority() {
        let (_dir, sink, reconciler) = setup().await;

        let classification = reconciler
            .observe(observation("/m/a.mkv", 100, 10, ChangeOrigin::Watcher))
            .await
            .unwrap();
        assert_eq!(classification, Classification::New);

        let submitted = sink.submitted.lock().await;
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].1, 0);
        assert_eq!(submitted[0].0.path(), Path::new("/m/a.mkv"));
    }

    #[tokio::test]
    async fn unchanged_observation_enqueues_nothing() {
        let (_dir, sink, reconciler) = setup().await;

        reconciler
            .observe(observation("/m/a.mkv", 100, 10, ChangeOrigin::Scanner))
            .await
            .unwrap();
        let second = reconciler
            .observe(observation("/m/a.mkv", 100, 10, ChangeOrigin::Scanner))
            .await
            .unwrap();

        assert_eq!(second, Classification::Unchanged);
        assert_eq!(sink.submitted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn size_or_mtime_change_classifies_modified() {
        let (_dir, sink, reconciler) = setup().await;

        reconciler
            .observe(observation("/m/a.mkv", 100, 10, ChangeOrigin::Scanner))
            .await
            .unwrap();
        let truncated = reconciler
            .observe(observation("/m/a.mkv", 50, 20, ChangeOrigin::Poller))
            .await
            .unwrap();

        assert_eq!(truncated, Classification::Modified);
        let submitted = sink.submitted.lock().await;
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].1, 1);
    }

    #[tokio::test]
    async fn concurrent_observations_classify_new_exactly_once() {
        let (_dir, _sink, reconciler) = setup().await;
        let reconciler = Arc::new(reconciler);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = Arc::clone(&reconciler);
            handles.push(tokio::spawn(async move {
                r.observe(observation("/m/race.mkv", 100, 10, ChangeOrigin::Watcher))
                    .await
                    .unwrap()
            }));
        }

        let mut new_count = 0;
        for handle in handles {
            if handle.await.unwrap() == Classification::New {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1);
    }

    #[tokio::test]
    async fn directories_are_indexed_but_never_enqueued() {
        let (_dir, sink, reconciler) = setup().await;

        let mut obs = observation("/m/show", 0, 10, ChangeOrigin::Scanner);
        obs.is_directory = true;
        assert_eq!(
            reconciler.observe(obs).await.unwrap(),
            Classification::New
        );
        assert!(sink.submitted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn forget_removes_record_and_cancels_tasks() {
        let (_dir, sink, reconciler) = setup().await;

        reconciler
            .observe(observation("/m/a.mkv", 100, 10, ChangeOrigin::Watcher))
            .await
            .unwrap();
        assert!(reconciler.forget(Path::new("/m/a.mkv")).await.unwrap());
        assert!(!reconciler.forget(Path::new("/m/a.mkv")).await.unwrap());

        let cancelled = sink.cancelled.lock().await;
        assert_eq!(cancelled[0], Path::new("/m/a.mkv"));
    }

    #[tokio::test]
    async fn local_observation_preserves_known_external_id() {
        let (_dir, _sink, reconciler) = setup().await;

        let mut remote = observation("/m/a.mkv", 100, 10, ChangeOrigin::Poller);
        remote.external_id = Some("drive-123".into());
        reconciler.observe(remote).await.unwrap();

        // Scanner re-observes the same path without a remote id.
        reconciler
            .observe(observation("/m/a.mkv", 50, 20, ChangeOrigin::Scanner))
            .await
            .unwrap();

        let record = reconciler.index.get("/m/a.mkv").await.unwrap().unwrap();
        assert_eq!(record.external_id.as_deref(), Some("drive-123"));
    }
}
