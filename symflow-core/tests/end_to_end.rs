//! Full-path exercise: scan sweep through reconciliation and the task
//! pipeline down to links on disk.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use symflow_core::{
    FileIndex, LinkMaterializer, LinkTaskRunner, PipelineConfig, Reconciler, ScanSource,
    SourceHealth, SqliteFileIndex, TaskPipeline, default_media_extensions,
};

struct World {
    _dirs: TempDir,
    index: Arc<SqliteFileIndex>,
    pipeline: Arc<TaskPipeline>,
    scan: Arc<ScanSource>,
    root: std::path::PathBuf,
    links: std::path::PathBuf,
}

async fn world() -> World {
    let dirs = TempDir::new().unwrap();
    let root = dirs.path().join("mount");
    let links = dirs.path().join("links");
    fs::create_dir_all(&root).unwrap();

    let index = Arc::new(
        SqliteFileIndex::open(&dirs.path().join("state/index.db"))
            .await
            .unwrap(),
    );

    let materializer = LinkMaterializer::new(
        root.clone(),
        links.clone(),
        default_media_extensions(),
        vec!["BDMV".into()],
        false,
    );
    let runner = Arc::new(LinkTaskRunner::new(materializer, None));
    let pipeline = TaskPipeline::new(
        PipelineConfig {
            workers: 2,
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
        },
        runner,
    );
    pipeline.start().await;

    let reconciler = Arc::new(Reconciler::new(index.clone(), pipeline.clone()));
    let scan = ScanSource::new(
        root.clone(),
        Duration::from_secs(300),
        Duration::from_secs(3600),
        vec!["BDMV".into()],
        reconciler,
        index.clone(),
        SourceHealth::new(),
    );

    World {
        _dirs: dirs,
        index,
        pipeline,
        scan,
        root,
        links,
    }
}

async fn wait_for(path: &Path) {
    for _ in 0..500 {
        if path.symlink_metadata().is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("link never appeared: {}", path.display());
}

async fn settle(pipeline: &TaskPipeline) {
    for _ in 0..500 {
        if pipeline.queue_depth().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline never drained");
}

#[tokio::test]
async fn scan_materializes_links_and_deletion_is_forgotten() {
    let w = world().await;

    let movie = w.root.join("Movies/Example (2020)/example.mkv");
    fs::create_dir_all(movie.parent().unwrap()).unwrap();
    fs::write(&movie, b"video").unwrap();
    let subtitle = w.root.join("Movies/Example (2020)/example.srt");
    fs::write(&subtitle, b"subs").unwrap();

    w.scan.sweep().await.unwrap();

    let link = w.links.join("Movies/Example (2020)/example.mkv");
    wait_for(&link).await;
    assert_eq!(fs::read_link(&link).unwrap(), movie);

    settle(&w.pipeline).await;
    // Non-media files are indexed but never linked.
    assert!(
        w.links
            .join("Movies/Example (2020)/example.srt")
            .symlink_metadata()
            .is_err()
    );
    assert!(
        w.index
            .get(&subtitle.to_string_lossy())
            .await
            .unwrap()
            .is_some()
    );

    // A second pass enqueues nothing new and leaves the link alone.
    w.scan.sweep().await.unwrap();
    settle(&w.pipeline).await;
    assert_eq!(fs::read_link(&link).unwrap(), movie);

    // Deletion by absence drops the record. The stale link stays; pruning
    // link trees is the media server's side of the contract.
    fs::remove_file(&movie).unwrap();
    w.scan.sweep().await.unwrap();
    assert!(
        w.index
            .get(&movie.to_string_lossy())
            .await
            .unwrap()
            .is_none()
    );

    w.pipeline.shutdown(Duration::from_secs(1)).await;
}
