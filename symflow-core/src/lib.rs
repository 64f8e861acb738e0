//! Core engine for the symflow daemon: change detection, the persistent path
//! index, the prioritized materialization pipeline, and downstream media
//! server notification.
//!
//! The flow is one-directional. Three change sources (filesystem watcher,
//! periodic scanner, remote change-feed poller) feed the
//! [`Reconciler`](reconcile::Reconciler), which classifies each observation
//! against the [`FileIndex`](index::FileIndex) and enqueues work on the
//! [`TaskPipeline`](pipeline::TaskPipeline). Workers drive the
//! [`LinkMaterializer`](materialize::LinkMaterializer) and created links are
//! batched by the [`RefreshBatcher`](downstream::RefreshBatcher) into
//! per-library media server refreshes.

pub mod downstream;
pub mod error;
pub mod index;
pub mod materialize;
pub mod pipeline;
pub mod reconcile;
pub mod sources;
pub mod status;
pub mod types;

pub use downstream::{HttpMediaServer, LibraryInfo, MediaServerClient, NotifierConfig, RefreshBatcher};
pub use error::{Result, SyncError};
pub use index::{FileIndex, SqliteFileIndex};
pub use materialize::{LinkMaterializer, LinkTaskRunner, Outcome, default_media_extensions};
pub use pipeline::{
    PipelineConfig, TaskId, TaskPayload, TaskPipeline, TaskRunner, TaskSink, TaskState, TaskStatus,
};
pub use reconcile::Reconciler;
pub use sources::{
    HttpChangeFeed, RemoteChangeFeed, RemoteItem, RemoteSource, ScanSource, ScanStats, WatchSource,
};
pub use status::{SourceHealth, StatusReport};
pub use types::{ChangeOrigin, Classification, FileRecord, Observation, SnapshotEntry, TreeDiff};
