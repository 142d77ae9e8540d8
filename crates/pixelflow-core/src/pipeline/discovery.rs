//! File discovery under anchor roots.
//!
//! The extension allow-list is checked on the directory entry name before any
//! metadata call, so unsupported files cost no I/O.

use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;
use walkdir::{DirEntry, WalkDir};

/// Discovers image files in directories.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    supported_formats: Vec<String>,
}

/// Information about a discovered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Full path to the file
    pub path: PathBuf,
    /// Path relative to the anchor root, `/`-separated
    pub relative_path: String,
    /// File size in bytes
    pub size: u64,
}

impl FileDiscovery {
    /// Create a discovery instance for an extension allow-list.
    pub fn new(supported_formats: &[String]) -> Self {
        Self {
            supported_formats: supported_formats
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// Walk on a blocking thread, streaming files through a bounded channel.
    ///
    /// The walker blocks when the buffer is full, so memory stays bounded on
    /// very large trees. Dropping the receiver stops the walk.
    pub fn spawn_walk(
        &self,
        root: PathBuf,
        subtree: String,
        buffer: usize,
    ) -> mpsc::Receiver<DiscoveredFile> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let discovery = self.clone();
        tokio::task::spawn_blocking(move || {
            for file in discovery.walk(&root, &subtree) {
                if tx.blocking_send(file).is_err() {
                    tracing::debug!("Walk of {:?} stopped by receiver", root);
                    break;
                }
            }
        });
        rx
    }

    fn walk<'a>(&'a self, root: &'a Path, subtree: &str) -> impl Iterator<Item = DiscoveredFile> + 'a {
        let start = if subtree.is_empty() {
            root.to_path_buf()
        } else {
            root.join(subtree)
        };
        WalkDir::new(start)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(move |entry| entry.file_type().is_file() && self.is_supported(entry.path()))
            .filter_map(move |entry| self.describe(root, &entry))
    }

    fn describe(&self, root: &Path, entry: &DirEntry) -> Option<DiscoveredFile> {
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!("Cannot stat {:?}: {}", entry.path(), e);
                return None;
            }
        };
        let relative_path = relative_path(root, entry.path())?;
        Some(DiscoveredFile {
            path: entry.path().to_path_buf(),
            relative_path,
            size,
        })
    }

    /// Check if a file has a supported extension (case-insensitive).
    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext_lower = ext.to_lowercase();
                self.supported_formats.iter().any(|fmt| *fmt == ext_lower)
            })
            .unwrap_or(false)
    }
}

/// `path` relative to `root`, joined with `/`. `None` for non-UTF-8 names.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
