use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::index::FileIndex;
use crate::reconcile::Reconciler;
use crate::sources::failure_backoff;
use crate::status::SourceHealth;
use crate::types::{ChangeOrigin, Observation, SnapshotEntry, has_ignored_segment};

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    /// Entries walked (files and directories).
    pub seen: usize,
    /// Entries pushed through the reconciler (cache misses).
    pub observed: usize,
    /// Paths removed because the sweep no longer found them.
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    size: i64,
    modified_time: i64,
    refreshed: Instant,
}

/// Periodic full-tree sweep: the correctness backstop for missed watcher
/// events and the only source able to observe deletions by absence.
pub struct ScanSource {
    root: PathBuf,
    interval: Duration,
    /// Cache entries older than this are treated as misses, so every live
    /// path still refreshes `last_seen` at least once per cache window.
    cache_max_age: Duration,
    ignored_segments: Vec<String>,
    reconciler: Arc<Reconciler>,
    index: Arc<dyn FileIndex>,
    health: Arc<SourceHealth>,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl std::fmt::Debug for ScanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSource")
            .field("root", &self.root)
            .field("interval", &self.interval)
            .finish()
    }
}

impl ScanSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        interval: Duration,
        cache_max_age: Duration,
        ignored_segments: Vec<String>,
        reconciler: Arc<Reconciler>,
        index: Arc<dyn FileIndex>,
        health: Arc<SourceHealth>,
    ) -> Arc<Self> {
        Arc::new(Self {
            root,
            interval,
            cache_max_age,
            ignored_segments,
            reconciler,
            index,
            health,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Scan source started for {} (interval {:?})",
            self.root.display(),
            self.interval
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let wait = match self.sweep().await {
                Ok(stats) => {
                    debug!(
                        "Scan sweep complete: {} seen, {} observed, {} deleted",
                        stats.seen, stats.observed, stats.deleted
                    );
                    self.health.record_success(ChangeOrigin::Scanner).await;
                    self.interval
                }
                Err(e) => {
                    error!("Scan sweep failed: {}", e);
                    failure_backoff(self.interval)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Scan source stopped");
    }

    /// Walk the tree once: observe cache misses, then diff the full snapshot
    /// against the index to pick up deletions.
    pub async fn sweep(&self) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        let mut snapshot: Vec<SnapshotEntry> = Vec::new();

        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Error walking {}: {}", self.root.display(), e);
                    continue;
                }
            };
            if has_ignored_segment(entry.path(), &self.ignored_segments) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Could not stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            stats.seen += 1;
            let observation =
                Observation::for_local_file(entry.path(), &meta, ChangeOrigin::Scanner);
            snapshot.push(SnapshotEntry {
                path: observation.path.clone(),
                size: observation.size,
                modified_time: observation.modified_time,
            });

            if self
                .cache_hit(entry.path(), observation.size, observation.modified_time)
                .await
            {
                continue;
            }

            match self.reconciler.observe(observation).await {
                Ok(_) => {
                    stats.observed += 1;
                    self.cache_store(entry.path().to_path_buf(), &meta).await;
                }
                Err(e) => warn!("Failed to reconcile {}: {}", entry.path().display(), e),
            }
        }

        let diff = self.index.diff(&snapshot).await?;
        for path in &diff.deleted {
            let path = PathBuf::from(path);
            if let Err(e) = self.reconciler.forget(&path).await {
                warn!("Failed to forget deleted path {}: {}", path.display(), e);
            } else {
                stats.deleted += 1;
            }
        }

        self.prune_cache().await;
        Ok(stats)
    }

    async fn cache_hit(&self, path: &Path, size: i64, modified_time: i64) -> bool {
        let cache = self.cache.lock().await;
        cache.get(path).is_some_and(|entry| {
            entry.size == size
                && entry.modified_time == modified_time
                && entry.refreshed.elapsed() < self.cache_max_age
        })
    }

    async fn cache_store(&self, path: PathBuf, meta: &std::fs::Metadata) {
        let observation = Observation::for_local_file(&path, meta, ChangeOrigin::Scanner);
        self.cache.lock().await.insert(
            path,
            CacheEntry {
                size: observation.size,
                modified_time: observation.modified_time,
                refreshed: Instant::now(),
            },
        );
    }

    async fn prune_cache(&self) {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.refreshed.elapsed() < self.cache_max_age);
        let pruned = before - cache.len();
        if pruned > 0 {
            debug!("Pruned {} expired scan cache entries", pruned);
        }
    }
}
