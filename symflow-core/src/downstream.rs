use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// One browsable collection known to the media server.
#[derive(Debug, Clone)]
pub struct LibraryInfo {
    pub id: String,
    pub name: String,
    /// Library roots; a target path belongs to the library whose root
    /// prefixes it.
    pub roots: Vec<PathBuf>,
}

/// Media server operations the notifier depends on.
#[async_trait]
pub trait MediaServerClient: Send + Sync {
    async fn list_libraries(&self) -> Result<Vec<LibraryInfo>>;

    async fn refresh_library(&self, library_id: &str) -> Result<()>;
}

/// Emby-compatible HTTP client.
#[derive(Debug, Clone)]
pub struct HttpMediaServer {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct VirtualFolder {
    #[serde(rename = "ItemId")]
    item_id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Locations", default)]
    locations: Vec<String>,
}

impl HttpMediaServer {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::MediaServer(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        })
    }
}

#[async_trait]
impl MediaServerClient for HttpMediaServer {
    async fn list_libraries(&self) -> Result<Vec<LibraryInfo>> {
        let folders: Vec<VirtualFolder> = self
            .http
            .get(format!("{}/Library/VirtualFolders", self.base_url))
            .header("X-Emby-Token", &self.api_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(folders
            .into_iter()
            .map(|folder| LibraryInfo {
                id: folder.item_id,
                name: folder.name,
                roots: folder.locations.into_iter().map(PathBuf::from).collect(),
            })
            .collect())
    }

    async fn refresh_library(&self, library_id: &str) -> Result<()> {
        self.http
            .post(format!(
                "{}/Library/VirtualFolders/Refresh",
                self.base_url
            ))
            .query(&[("id", library_id)])
            .header("X-Emby-Token", &self.api_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Attempts per library refresh call.
    pub retry_count: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Accumulates materialized link paths and flushes them downstream as one
/// refresh call per owning library. Failures are never silently dropped:
/// unresolved or refresh-failed paths re-enter the pending set.
pub struct RefreshBatcher {
    client: Arc<dyn MediaServerClient>,
    config: NotifierConfig,
    pending: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for RefreshBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshBatcher").finish()
    }
}

impl RefreshBatcher {
    pub fn new(client: Arc<dyn MediaServerClient>, config: NotifierConfig) -> Self {
        Self {
            client,
            config,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Queue a materialized target path for the next flush. Deduplicated.
    pub async fn enqueue(&self, target: PathBuf) {
        self.pending.lock().await.insert(target);
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Resolve pending paths to libraries, issue one refresh per distinct
    /// library, and return a per-path success map.
    pub async fn flush(&self) -> HashMap<PathBuf, bool> {
        let paths: Vec<PathBuf> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };
        if paths.is_empty() {
            return HashMap::new();
        }

        let libraries = match self.client.list_libraries().await {
            Ok(libraries) => libraries,
            Err(e) => {
                error!("Failed to list media server libraries: {}", e);
                let mut pending = self.pending.lock().await;
                let mut results = HashMap::new();
                for path in paths {
                    results.insert(path.clone(), false);
                    pending.insert(path);
                }
                return results;
            }
        };

        let mut results = HashMap::new();
        let mut batches: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for path in paths {
            match resolve_library(&libraries, &path) {
                Some(library) => batches.entry(library.id.clone()).or_default().push(path),
                None => {
                    warn!("No library owns path {}, will retry later", path.display());
                    results.insert(path.clone(), false);
                    self.pending.lock().await.insert(path);
                }
            }
        }

        for (library_id, batch) in batches {
            let success = self.refresh_with_retries(&library_id).await;
            if !success {
                let mut pending = self.pending.lock().await;
                for path in &batch {
                    pending.insert(path.clone());
                }
            }
            for path in batch {
                results.insert(path, success);
            }
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        info!(
            "Downstream flush complete: {}/{} paths refreshed",
            succeeded,
            results.len()
        );
        results
    }

    async fn refresh_with_retries(&self, library_id: &str) -> bool {
        for attempt in 1..=self.config.retry_count.max(1) {
            match self.client.refresh_library(library_id).await {
                Ok(()) => {
                    debug!("Refreshed library {}", library_id);
                    return true;
                }
                Err(e) if attempt < self.config.retry_count => {
                    warn!(
                        "Refresh of library {} failed (attempt {}/{}), retrying in {:?}: {}",
                        library_id, attempt, self.config.retry_count, self.config.retry_delay, e
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        "Refresh of library {} failed after {} attempts: {}",
                        library_id, self.config.retry_count, e
                    );
                }
            }
        }
        false
    }
}

/// A path belongs to the library owning its longest matching root.
fn resolve_library<'a>(libraries: &'a [LibraryInfo], path: &Path) -> Option<&'a LibraryInfo> {
    libraries
        .iter()
        .filter_map(|library| {
            library
                .roots
                .iter()
                .filter(|root| path.starts_with(root))
                .map(|root| (library, root.components().count()))
                .max_by_key(|(_, depth)| *depth)
        })
        .max_by_key(|(_, depth)| *depth)
        .map(|(library, _)| library)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeServer {
        libraries: Vec<LibraryInfo>,
        refresh_calls: Mutex<Vec<String>>,
        fail_refresh: AtomicBool,
        fail_listing: AtomicBool,
    }

    impl FakeServer {
        fn new(libraries: Vec<LibraryInfo>) -> Arc<Self> {
            Arc::new(Self {
                libraries,
                refresh_calls: Mutex::new(Vec::new()),
                fail_refresh: AtomicBool::new(false),
                fail_listing: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl MediaServerClient for FakeServer {
        async fn list_libraries(&self) -> Result<Vec<LibraryInfo>> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(SyncError::MediaServer("listing unavailable".into()));
            }
            Ok(self.libraries.clone())
        }

        async fn refresh_library(&self, library_id: &str) -> Result<()> {
            self.refresh_calls.lock().await.push(library_id.to_string());
            if self.fail_refresh.load(Ordering::SeqCst) {
                Err(SyncError::MediaServer("refresh unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    fn movie_library() -> LibraryInfo {
        LibraryInfo {
            id: "lib-movies".into(),
            name: "Movies".into(),
            roots: vec![PathBuf::from("/links/Movies")],
        }
    }

    fn quick_config() -> NotifierConfig {
        NotifierConfig {
            retry_count: 3,
            retry_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn one_refresh_call_per_distinct_library() {
        let server = FakeServer::new(vec![movie_library()]);
        let batcher = RefreshBatcher::new(server.clone(), quick_config());

        batcher.enqueue(PathBuf::from("/links/Movies/a.mkv")).await;
        batcher.enqueue(PathBuf::from("/links/Movies/b.mkv")).await;

        let results = batcher.flush().await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|ok| *ok));
        assert_eq!(server.refresh_calls.lock().await.len(), 1);
        assert_eq!(batcher.pending_len().await, 0);
    }

    #[tokio::test]
    async fn enqueue_deduplicates_by_path() {
        let server = FakeServer::new(vec![movie_library()]);
        let batcher = RefreshBatcher::new(server, quick_config());

        batcher.enqueue(PathBuf::from("/links/Movies/a.mkv")).await;
        batcher.enqueue(PathBuf::from("/links/Movies/a.mkv")).await;
        assert_eq!(batcher.pending_len().await, 1);
    }

    #[tokio::test]
    async fn unresolved_paths_stay_pending() {
        let server = FakeServer::new(vec![movie_library()]);
        let batcher = RefreshBatcher::new(server.clone(), quick_config());

        batcher.enqueue(PathBuf::from("/elsewhere/c.mkv")).await;
        let results = batcher.flush().await;

        assert_eq!(results.get(Path::new("/elsewhere/c.mkv")), Some(&false));
        assert_eq!(batcher.pending_len().await, 1);
        assert!(server.refresh_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_retries_then_requeues_batch() {
        let server = FakeServer::new(vec![movie_library()]);
        server.fail_refresh.store(true, Ordering::SeqCst);
        let batcher = RefreshBatcher::new(server.clone(), quick_config());

        batcher.enqueue(PathBuf::from("/links/Movies/a.mkv")).await;
        batcher.enqueue(PathBuf::from("/links/Movies/b.mkv")).await;
        let results = batcher.flush().await;

        assert!(results.values().all(|ok| !*ok));
        assert_eq!(server.refresh_calls.lock().await.len(), 3);
        assert_eq!(batcher.pending_len().await, 2);

        // A later flush retries the same paths once the server recovers.
        server.fail_refresh.store(false, Ordering::SeqCst);
        let results = batcher.flush().await;
        assert!(results.values().all(|ok| *ok));
        assert_eq!(batcher.pending_len().await, 0);
    }

    #[tokio::test]
    async fn listing_failure_keeps_everything_pending() {
        let server = FakeServer::new(vec![movie_library()]);
        server.fail_listing.store(true, Ordering::SeqCst);
        let batcher = RefreshBatcher::new(server.clone(), quick_config());

        batcher.enqueue(PathBuf::from("/links/Movies/a.mkv")).await;
        let results = batcher.flush().await;

        assert_eq!(results.len(), 1);
        assert!(results.values().all(|ok| !*ok));
        assert_eq!(batcher.pending_len().await, 1);
    }

    #[tokio::test]
    async fn longest_root_wins_resolution() {
        let libraries = vec![
            LibraryInfo {
                id: "lib-all".into(),
                name: "Everything".into(),
                roots: vec![PathBuf::from("/links")],
            },
            movie_library(),
        ];
        let resolved = resolve_library(&libraries, Path::new("/links/Movies/a.mkv")).unwrap();
        assert_eq!(resolved.id, "lib-movies");
    }
}
