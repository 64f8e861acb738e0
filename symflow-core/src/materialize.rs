use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::downstream::RefreshBatcher;
use crate::error::{Result, SyncError};
use crate::pipeline::{TaskPayload, TaskRunner};
use crate::types::has_ignored_segment;

#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(windows)]
use std::os::windows::fs::symlink_file as symlink;

/// Built-in extension allow-list, shared with the configuration layer so
/// user overrides start from the same set.
pub fn default_media_extensions() -> Vec<String> {
    [
        "mkv", "mp4", "avi", "mov", "wmv", "flv", "mpg", "rm", "rmvb", "ts", "m2ts", "iso",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

/// Result of a materialization attempt. Failures surface as `Err` and bubble
/// up to the task pipeline's retry logic unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A fresh link was created.
    Created,
    /// An existing target was removed and relinked (overwrite policy).
    Replaced,
    /// Target already exists and overwriting is disabled.
    SkippedExists,
    /// Path failed the extension or ignored-segment filter.
    SkippedIgnored,
}

/// Maps a source path under the monitored root to a symbolic link under the
/// link base, preserving directory structure. Idempotent: re-materializing an
/// unchanged source yields `SkippedExists` (or `Replaced` under overwrite).
#[derive(Debug, Clone)]
pub struct LinkMaterializer {
    monitored_root: PathBuf,
    link_base: PathBuf,
    /// Lowercased extensions without the leading dot.
    media_extensions: HashSet<String>,
    ignored_segments: Vec<String>,
    overwrite: bool,
}

impl LinkMaterializer {
    pub fn new(
        monitored_root: PathBuf,
        link_base: PathBuf,
        media_extensions: impl IntoIterator<Item = String>,
        ignored_segments: Vec<String>,
        overwrite: bool,
    ) -> Self {
        Self {
            monitored_root,
            link_base,
            media_extensions: media_extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            ignored_segments,
            overwrite,
        }
    }

    /// Check the extension allow-list.
    pub fn is_media_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.media_extensions.contains(&ext.to_lowercase()))
            .unwrap_or(false)
    }

    /// Compute the link target by re-rooting the source's offset from the
    /// monitored root onto the link base.
    pub fn target_for(&self, source: &Path) -> Result<PathBuf> {
        let relative = source
            .strip_prefix(&self.monitored_root)
            .map_err(|_| SyncError::OutsideRoot(source.display().to_string()))?;
        Ok(self.link_base.join(relative))
    }

    /// Create or repair the link for `source`. Returns the target path along
    /// with the outcome so callers can queue downstream notifications.
    pub fn materialize(&self, source: &Path) -> Result<(Outcome, Option<PathBuf>)> {
        if !self.is_media_file(source) || has_ignored_segment(source, &self.ignored_segments) {
            debug!("Skipping non-media or ignored path: {}", source.display());
            return Ok((Outcome::SkippedIgnored, None));
        }

        let target = self.target_for(source)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        // symlink_metadata so a dangling link still counts as existing.
        let exists = target.symlink_metadata().is_ok();
        if exists {
            if !self.overwrite {
                debug!(
                    "Target exists and overwrite is disabled: {}",
                    target.display()
                );
                return Ok((Outcome::SkippedExists, Some(target)));
            }
            fs::remove_file(&target)?;
            symlink(source, &target)?;
            info!("Replaced link {} -> {}", source.display(), target.display());
            return Ok((Outcome::Replaced, Some(target)));
        }

        symlink(source, &target)?;
        info!("Created link {} -> {}", source.display(), target.display());
        Ok((Outcome::Created, Some(target)))
    }
}

/// Pipeline runner that materializes links and feeds new or replaced targets
/// into the downstream refresh batch. Skipped paths batch nothing; errors
/// bubble to the pipeline's retry handling.
pub struct LinkTaskRunner {
    materializer: LinkMaterializer,
    /// Absent when no media server is configured; links are still created.
    batcher: Option<Arc<RefreshBatcher>>,
}

impl std::fmt::Debug for LinkTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkTaskRunner")
            .field("materializer", &self.materializer)
            .finish()
    }
}

impl LinkTaskRunner {
    pub fn new(materializer: LinkMaterializer, batcher: Option<Arc<RefreshBatcher>>) -> Self {
        Self {
            materializer,
            batcher,
        }
    }
}

#[async_trait]
impl TaskRunner for LinkTaskRunner {
    async fn run(&self, payload: &TaskPayload) -> Result<()> {
        let TaskPayload::Materialize { source } = payload;
        let (outcome, target) = self.materializer.materialize(source)?;
        if let (Outcome::Created | Outcome::Replaced, Some(target)) = (outcome, target)
            && let Some(batcher) = &self.batcher
        {
            batcher.enqueue(target).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn default_extensions() -> Vec<String> {
        vec!["mkv".into(), "mp4".into(), ".iso".into()]
    }

    fn materializer(root: &Path, base: &Path, overwrite: bool) -> LinkMaterializer {
        LinkMaterializer::new(
            root.to_path_buf(),
            base.to_path_buf(),
            default_extensions(),
            vec!["BDMV".into()],
            overwrite,
        )
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"content").unwrap();
    }

    #[test]
    fn creates_link_preserving_structure() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("mount");
        let base = dir.path().join("links");
        let source = root.join("Movies/Example (2020)/example.mkv");
        touch(&source);

        let m = materializer(&root, &base, false);
        let (outcome, target) = m.materialize(&source).unwrap();

        assert_eq!(outcome, Outcome::Created);
        let target = target.unwrap();
        assert_eq!(target, base.join("Movies/Example (2020)/example.mkv"));
        assert_eq!(fs::read_link(&target).unwrap(), source);
    }

    #[test]
    fn second_materialization_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("mount");
        let base = dir.path().join("links");
        let source = root.join("movie.mkv");
        touch(&source);

        let m = materializer(&root, &base, false);
        let (first, target) = m.materialize(&source).unwrap();
        let link_before = fs::read_link(target.as_ref().unwrap()).unwrap();
        let (second, _) = m.materialize(&source).unwrap();

        assert_eq!(first, Outcome::Created);
        assert_eq!(second, Outcome::SkippedExists);
        assert_eq!(
            fs::read_link(target.unwrap()).unwrap(),
            link_before,
            "link must be unchanged after the second call"
        );
    }

    #[test]
    fn overwrite_policy_replaces_existing_target() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("mount");
        let base = dir.path().join("links");
        let source = root.join("movie.mkv");
        touch(&source);

        let m = materializer(&root, &base, true);
        m.materialize(&source).unwrap();
        let (outcome, target) = m.materialize(&source).unwrap();

        assert_eq!(outcome, Outcome::Replaced);
        assert_eq!(fs::read_link(target.unwrap()).unwrap(), source);
    }

    #[test]
    fn filters_by_extension_and_ignored_segment() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("mount");
        let base = dir.path().join("links");
        let m = materializer(&root, &base, false);

        let subtitle = root.join("movie.srt");
        touch(&subtitle);
        assert_eq!(
            m.materialize(&subtitle).unwrap().0,
            Outcome::SkippedIgnored
        );

        let disc_internal = root.join("Disc/BDMV/STREAM/00000.mkv");
        touch(&disc_internal);
        assert_eq!(
            m.materialize(&disc_internal).unwrap().0,
            Outcome::SkippedIgnored
        );

        // Extension matching is case-insensitive and tolerates a configured
        // leading dot.
        assert!(m.is_media_file(Path::new("/m/MOVIE.MKV")));
        assert!(m.is_media_file(Path::new("/m/image.iso")));
        assert!(!m.is_media_file(Path::new("/m/noext")));
    }

    #[test]
    fn rejects_sources_outside_monitored_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("mount");
        let base = dir.path().join("links");
        let m = materializer(&root, &base, false);

        let stray = dir.path().join("elsewhere/movie.mkv");
        touch(&stray);
        assert!(matches!(
            m.materialize(&stray),
            Err(SyncError::OutsideRoot(_))
        ));
    }

    mod runner {
        use super::*;
        use crate::downstream::{LibraryInfo, MediaServerClient, NotifierConfig};

        struct NullServer;

        #[async_trait]
        impl MediaServerClient for NullServer {
            async fn list_libraries(&self) -> Result<Vec<LibraryInfo>> {
                Ok(Vec::new())
            }

            async fn refresh_library(&self, _library_id: &str) -> Result<()> {
                Ok(())
            }
        }

        #[tokio::test]
        async fn created_targets_enter_the_refresh_batch() {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("mount");
            let base = dir.path().join("links");
            let source = root.join("Movies/a.mkv");
            touch(&source);

            let batcher = Arc::new(RefreshBatcher::new(
                Arc::new(NullServer),
                NotifierConfig::default(),
            ));
            let runner = LinkTaskRunner::new(
                materializer(&root, &base, false),
                Some(batcher.clone()),
            );

            runner
                .run(&TaskPayload::Materialize {
                    source: source.clone(),
                })
                .await
                .unwrap();
            assert_eq!(batcher.pending_len().await, 1);

            // Idempotent rerun skips the existing link and batches nothing new.
            runner
                .run(&TaskPayload::Materialize { source })
                .await
                .unwrap();
            assert_eq!(batcher.pending_len().await, 1);
        }

        #[tokio::test]
        async fn skipped_paths_batch_nothing() {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("mount");
            let base = dir.path().join("links");
            let subtitle = root.join("movie.srt");
            touch(&subtitle);

            let batcher = Arc::new(RefreshBatcher::new(
                Arc::new(NullServer),
                NotifierConfig::default(),
            ));
            let runner = LinkTaskRunner::new(
                materializer(&root, &base, false),
                Some(batcher.clone()),
            );

            runner
                .run(&TaskPayload::Materialize { source: subtitle })
                .await
                .unwrap();
            assert_eq!(batcher.pending_len().await, 0);
        }
    }
}
