//! Object storage for source images, analysis images, and thumbnails.
//!
//! Three layouts are provided:
//! - [`MemoryBlobStore`]: in-process map, used by tests and by runs without a
//!   configured storage root.
//! - [`DirBlobStore`]: one flat directory per bucket.
//! - [`ShardedBlobStore`]: `{root}/{h}/{hh}/{key}` where `h` and `hh` are the
//!   first one and two characters of the key. Thumbnails use this layout.
//!
//! File-backed stores write to a temporary name and rename, so a blob is
//! either absent or complete.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::{Config, Environment};
use crate::error::StoreError;

/// What a blob holds; decides the bucket and key shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Raw source bytes, `{id}.jpg`
    Source,
    /// Grayscale analysis image, `{id}.png`
    Analysis,
    /// JPEG thumbnail, `{id}`
    Thumbnail,
}

impl ArtifactKind {
    /// Object key for an image id.
    pub fn key(self, image_id: Uuid) -> String {
        match self {
            ArtifactKind::Source => format!("{image_id}.jpg"),
            ArtifactKind::Analysis => format!("{image_id}.png"),
            ArtifactKind::Thumbnail => image_id.to_string(),
        }
    }

    /// Base bucket name (before environment prefixing).
    pub fn bucket(self) -> &'static str {
        match self {
            ArtifactKind::Source => "images",
            ArtifactKind::Analysis => "preprocessed",
            ArtifactKind::Thumbnail => "thumbnails",
        }
    }

    /// Bucket name for an environment.
    pub fn bucket_name(self, environment: Environment) -> String {
        match environment {
            Environment::Production => self.bucket().to_string(),
            Environment::Isolated => format!("isolated-{}", self.bucket()),
        }
    }
}

/// A flat key/value object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bucket name, for logging.
    fn name(&self) -> &str;

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch a blob; `StoreError::NotFound` when absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove a blob. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    name: String,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// Sorted list of stored keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError> {
        validate_key(key)?;
        self.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", self.name, key)))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove(key).is_some())
    }
}

/// One directory per bucket, one file per key.
pub struct DirBlobStore {
    name: String,
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError> {
        write_atomic(&self.path(key)?, data).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        read(&self.path(key)?, &self.name, key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path(key)?).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        remove(&self.path(key)?).await
    }
}

/// Two-level sharded directory layout: `{root}/{h}/{hh}/{key}`.
pub struct ShardedBlobStore {
    name: String,
    root: PathBuf,
}

impl ShardedBlobStore {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of a key under the sharded layout.
    pub fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        if key.len() < 2 || !key.is_char_boundary(2) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(&key[..1]).join(&key[..2]).join(key))
    }
}

#[async_trait]
impl BlobStore for ShardedBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError> {
        write_atomic(&self.path(key)?, data).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        read(&self.path(key)?, &self.name, key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path(key)?).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        remove(&self.path(key)?).await
    }
}

/// One store per artifact kind.
#[derive(Clone)]
pub struct Buckets {
    pub images: Arc<dyn BlobStore>,
    pub preprocessed: Arc<dyn BlobStore>,
    pub thumbnails: Arc<dyn BlobStore>,
}

impl Buckets {
    /// In-memory buckets named for the environment.
    pub fn in_memory(environment: Environment) -> Self {
        Self {
            images: Arc::new(MemoryBlobStore::new(
                ArtifactKind::Source.bucket_name(environment),
            )),
            preprocessed: Arc::new(MemoryBlobStore::new(
                ArtifactKind::Analysis.bucket_name(environment),
            )),
            thumbnails: Arc::new(MemoryBlobStore::new(
                ArtifactKind::Thumbnail.bucket_name(environment),
            )),
        }
    }

    /// Buckets per the storage section: flat directories under `blob_root`,
    /// the sharded tree at `thumbnail_root`, memory for whatever is unset.
    pub fn from_config(config: &Config) -> Self {
        let environment = config.general.environment;
        let mut buckets = Self::in_memory(environment);
        if let Some(root) = &config.storage.blob_root {
            let root = crate::config::expand(root);
            for kind in [ArtifactKind::Source, ArtifactKind::Analysis] {
                let name = kind.bucket_name(environment);
                let store: Arc<dyn BlobStore> = Arc::new(DirBlobStore::new(&name, root.join(&name)));
                match kind {
                    ArtifactKind::Source => buckets.images = store,
                    _ => buckets.preprocessed = store,
                }
            }
        }
        if let Some(root) = &config.storage.thumbnail_root {
            buckets.thumbnails = Arc::new(ShardedBlobStore::new(
                ArtifactKind::Thumbnail.bucket_name(environment),
                crate::config::expand(root),
            ));
        }
        buckets
    }

    pub fn get(&self, kind: ArtifactKind) -> &Arc<dyn BlobStore> {
        match kind {
            ArtifactKind::Source => &self.images,
            ArtifactKind::Analysis => &self.preprocessed,
            ArtifactKind::Thumbnail => &self.thumbnails,
        }
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.starts_with('.')
        || key.contains('/')
        || key.contains('\\')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read(path: &Path, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(StoreError::NotFound(format!("{bucket}/{key}")))
        }
        Err(e) => Err(e.into()),
    }
}

async fn remove(path: &Path) -> Result<bool, StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
