//! Thumbnail janitor.
//!
//! Sweeps the sharded thumbnail directory (`{root}/{h}/{hh}/{id}`) and removes
//! thumbnails that no image record references. Anything that does not look
//! exactly like a thumbnail is left alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::store::MetadataStore;

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Thumbnail files examined
    pub scanned: usize,
    /// Unreferenced thumbnails removed (or that would be, on a dry run)
    pub deleted: usize,
    /// Thumbnails still referenced
    pub kept: usize,
    /// Files outside the thumbnail naming scheme
    pub ignored: usize,
}

pub struct Janitor {
    root: PathBuf,
    metadata: Arc<dyn MetadataStore>,
    dry_run: bool,
}

impl Janitor {
    pub fn new(root: impl Into<PathBuf>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            root: root.into(),
            metadata,
            dry_run: false,
        }
    }

    /// Count what would be deleted without touching the file system.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn sweep(&self) -> Result<SweepStats, StoreError> {
        let root = self.root.clone();
        let (candidates, ignored) = tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

        let mut stats = SweepStats {
            ignored,
            ..Default::default()
        };
        for (path, image_id) in candidates {
            stats.scanned += 1;
            if self.metadata.references_thumbnail(image_id).await? {
                stats.kept += 1;
                continue;
            }
            if self.dry_run {
                tracing::info!("Would delete unreferenced thumbnail {:?}", path);
                stats.deleted += 1;
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!("Deleted unreferenced thumbnail {:?}", path);
                    stats.deleted += 1;
                }
                // Gone already: another sweep got there first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!("Failed to delete {:?}: {}", path, e);
                    return Err(StoreError::Io(e));
                }
            }
        }

        tracing::info!(
            "Thumbnail sweep of {:?}: {} scanned, {} deleted, {} kept, {} ignored",
            self.root,
            stats.scanned,
            stats.deleted,
            stats.kept,
            stats.ignored
        );
        Ok(stats)
    }
}

/// Files at depth three that match the naming scheme, plus a count of the ones that don't.
fn scan(root: &Path) -> (Vec<(PathBuf, Uuid)>, usize) {
    let mut candidates = Vec::new();
    let mut ignored = 0;
    for entry in WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        match thumbnail_id(entry.path()) {
            Some(id) => candidates.push((entry.path().to_path_buf(), id)),
            None => ignored += 1,
        }
    }
    (candidates, ignored)
}

/// The image id a thumbnail path encodes, if the path follows `{h}/{hh}/{id}` exactly.
fn thumbnail_id(path: &Path) -> Option<Uuid> {
    let name = path.file_name()?.to_str()?;
    let id = Uuid::try_parse(name).ok()?;
    // Only the canonical lowercase hyphenated form is ever written.
    if id.hyphenated().to_string() != name {
        return None;
    }
    let parent = path.parent()?;
    let grandparent = parent.parent()?;
    let shard = parent.file_name()?.to_str()?;
    let bucket = grandparent.file_name()?.to_str()?;
    (shard == &name[..2] && bucket == &name[..1]).then_some(id)
}
