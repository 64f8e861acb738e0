use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::reconcile::Reconciler;
use crate::status::SourceHealth;
use crate::types::{ChangeOrigin, Observation, has_ignored_segment};
use tokio_util::sync::CancellationToken;

/// A single raw notification after event-kind mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RawEvent {
    Upsert(PathBuf),
    Remove(PathBuf),
}

/// Push-based filesystem change source for the monitored root.
///
/// Bursts of notifications for one path collapse through the in-flight set:
/// the first caller processes the path, later events arriving while it is in
/// flight are dropped. A subsequent scan or watcher event catches anything
/// the drop missed.
pub struct WatchSource {
    root: PathBuf,
    ignored_segments: Vec<String>,
    reconciler: Arc<Reconciler>,
    health: Arc<SourceHealth>,
    inflight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl std::fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSource").field("root", &self.root).finish()
    }
}

impl WatchSource {
    pub fn new(
        root: PathBuf,
        ignored_segments: Vec<String>,
        reconciler: Arc<Reconciler>,
        health: Arc<SourceHealth>,
    ) -> Arc<Self> {
        Arc::new(Self {
            root,
            ignored_segments,
            reconciler,
            health,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Subscribe to recursive notifications and pump them until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!("Filesystem watch error: {:?}", e),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        info!("Watching filesystem events under {}", self.root.display());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Filesystem watcher channel closed");
                        break;
                    }
                }
            }
        }

        info!("Filesystem watch source stopped");
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, event: Event) {
        for raw in convert_event(event) {
            let path = match &raw {
                RawEvent::Upsert(path) | RawEvent::Remove(path) => path.clone(),
            };

            // Same skip list as the scanner, so paths under disc-image
            // internals never get indexed here just to be forgotten by the
            // next sweep.
            if has_ignored_segment(&path, &self.ignored_segments) {
                debug!("Ignoring event under skipped segment: {}", path.display());
                continue;
            }

            {
                let mut inflight = self.inflight.lock().await;
                if !inflight.insert(path.clone()) {
                    debug!("Dropping burst event for in-flight path {}", path.display());
                    continue;
                }
            }

            let source = Arc::clone(self);
            tokio::spawn(async move {
                source.process(raw).await;
                source.inflight.lock().await.remove(&path);
            });
        }
    }

    async fn process(&self, raw: RawEvent) {
        let outcome = match raw {
            RawEvent::Remove(path) => self
                .reconciler
                .forget(&path)
                .await
                .map(|_| ()),
            RawEvent::Upsert(path) => match std::fs::metadata(&path) {
                Ok(meta) if meta.is_dir() => Ok(()),
                Ok(meta) => self
                    .reconciler
                    .observe(Observation::for_local_file(&path, &meta, ChangeOrigin::Watcher))
                    .await
                    .map(|_| ()),
                Err(e) => {
                    // The file can be gone again by the time we stat it.
                    debug!("Could not stat {}: {}", path.display(), e);
                    Ok(())
                }
            },
        };

        match outcome {
            Ok(()) => self.health.record_success(ChangeOrigin::Watcher).await,
            Err(e) => warn!("Failed to process watcher event: {}", e),
        }
    }
}

/// Map a notify event onto raw upsert/remove notifications, one per path.
/// Access and other non-mutating kinds are dropped.
fn convert_event(event: Event) -> Vec<RawEvent> {
    let make: fn(PathBuf) -> RawEvent = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => RawEvent::Upsert,
        EventKind::Remove(_) => RawEvent::Remove,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    event.paths.into_iter().map(make).collect()
}
