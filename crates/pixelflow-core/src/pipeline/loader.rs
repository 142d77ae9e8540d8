//! File walker / loader.
//!
//! Walks anchor roots, makes sure every supported file has a metadata record,
//! and publishes a `LoadJob` carrying only the work the record is still
//! missing. Files with nothing missing cost one store lookup and nothing else.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broker::{Destination, Message};
use crate::config::Config;
use crate::dynamic::DynamicCell;
use crate::error::{PipelineError, PipelineResult, StoreError};
use crate::store::{ArtifactKind, Versioned};
use crate::types::{ImageRecord, LoadJob};

use super::discovery::{DiscoveredFile, FileDiscovery};
use super::dispatch::MessageHandler;
use super::rate_limit::RateLimiter;
use super::StageContext;

/// Counters for one walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Supported files found
    pub seen: usize,
    /// Records created on first sight
    pub created: usize,
    /// Jobs published
    pub published: usize,
    /// Files whose record already had everything
    pub complete: usize,
    /// Files over the size limit
    pub too_large: usize,
    /// Files skipped after an I/O, store, or publish failure
    pub failed: usize,
}

impl WalkStats {
    fn merge(&mut self, other: WalkStats) {
        self.seen += other.seen;
        self.created += other.created;
        self.published += other.published;
        self.complete += other.complete;
        self.too_large += other.too_large;
        self.failed += other.failed;
    }
}

/// What every record is expected to have.
#[derive(Debug, Clone)]
struct Requirements {
    hash_algorithms: Vec<String>,
    custom_hash_algorithms: Vec<String>,
    thumbnails: bool,
}

/// Publishes load jobs for files under the configured anchors.
pub struct Loader {
    anchors: BTreeMap<String, PathBuf>,
    discovery: FileDiscovery,
    requirements: Requirements,
    max_file_size: u64,
    walk_buffer: usize,
    context: StageContext,
    destination: Destination,
    limiter: RateLimiter,
    cancelled: AtomicBool,
}

impl Loader {
    /// Create a loader publishing to `destination` (the loader-command exchange).
    pub fn new(
        config: &Config,
        context: StageContext,
        destination: Destination,
        rate: Arc<DynamicCell<f64>>,
    ) -> Self {
        Self {
            anchors: config.anchor_roots(),
            discovery: FileDiscovery::new(&config.loader.supported_formats),
            requirements: Requirements {
                hash_algorithms: config.loader.hash_algorithms.clone(),
                custom_hash_algorithms: config.loader.custom_hash_algorithms.clone(),
                thumbnails: config.loader.generate_thumbnails,
            },
            max_file_size: config.limits.max_file_size_mb * 1024 * 1024,
            walk_buffer: config.loader.walk_buffer,
            context,
            destination,
            limiter: RateLimiter::new(rate),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Stop the walk before its next file.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn anchors(&self) -> impl Iterator<Item = &str> {
        self.anchors.keys().map(String::as_str)
    }

    fn root(&self, anchor: &str) -> PipelineResult<&PathBuf> {
        self.anchors
            .get(anchor)
            .ok_or_else(|| PipelineError::UnknownAnchor(anchor.to_string()))
    }

    /// Walk every configured anchor.
    pub async fn walk_all(&self) -> WalkStats {
        let mut total = WalkStats::default();
        let anchors: Vec<String> = self.anchors.keys().cloned().collect();
        for anchor in anchors {
            match self.walk(&anchor, "", true).await {
                Ok(stats) => total.merge(stats),
                Err(e) => tracing::error!("Walk of {} failed: {}", anchor, e),
            }
        }
        total
    }

    /// Walk one anchor subtree (`""` for the whole anchor).
    ///
    /// `generate_thumbnail` can only narrow the configured requirement.
    pub async fn walk(
        &self,
        anchor: &str,
        subtree: &str,
        generate_thumbnail: bool,
    ) -> PipelineResult<WalkStats> {
        let root = self.root(anchor)?.clone();
        let mut stats = WalkStats::default();
        let start = std::time::Instant::now();
        tracing::info!("Walking {} ({:?}{})", anchor, root, if subtree.is_empty() {
            String::new()
        } else {
            format!(", subtree {subtree}")
        });

        let mut files = self
            .discovery
            .spawn_walk(root, subtree.to_string(), self.walk_buffer);
        while let Some(file) = files.recv().await {
            if self.is_cancelled() {
                tracing::info!("Walk of {} cancelled", anchor);
                break;
            }
            stats.seen += 1;
            self.load_file(anchor, &file, generate_thumbnail, &mut stats)
                .await;
        }

        tracing::info!(
            "Walked {} in {:.1}s: {} seen, {} created, {} published, {} complete, {} too large, {} failed",
            anchor,
            start.elapsed().as_secs_f64(),
            stats.seen,
            stats.created,
            stats.published,
            stats.complete,
            stats.too_large,
            stats.failed
        );
        Ok(stats)
    }

    async fn load_file(
        &self,
        anchor: &str,
        file: &DiscoveredFile,
        generate_thumbnail: bool,
        stats: &mut WalkStats,
    ) {
        if file.size > self.max_file_size {
            tracing::warn!(
                "Skipping {}/{}: {} bytes exceeds limit",
                anchor,
                file.relative_path,
                file.size
            );
            stats.too_large += 1;
            return;
        }

        let record = match self.find_or_create(anchor, file, stats).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Metadata lookup for {}/{} failed: {}", anchor, file.relative_path, e);
                stats.failed += 1;
                return;
            }
        };

        let job = self.plan(&record, generate_thumbnail);
        if job.is_empty() {
            tracing::debug!("{}/{} is complete", anchor, file.relative_path);
            stats.complete += 1;
            return;
        }

        let bytes = match tokio::fs::read(&file.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot read {:?}: {}", file.path, e);
                stats.failed += 1;
                return;
            }
        };
        let key = ArtifactKind::Source.key(record.image_id);
        if let Err(e) = self.context.buckets.images.put(&key, bytes).await {
            tracing::error!("Upload of {} failed, not publishing: {}", key, e);
            stats.failed += 1;
            return;
        }

        self.limiter.acquire().await;
        match self.publish(&job).await {
            Ok(()) => {
                tracing::debug!(
                    "Published {}/{} ({} digests, {} custom, thumbnail: {})",
                    anchor,
                    file.relative_path,
                    job.missing_hash_algorithms.len(),
                    job.missing_custom_hash_algorithms.len(),
                    job.generate_thumbnail
                );
                stats.published += 1;
            }
            Err(e) => {
                tracing::error!("Publishing job for {}/{} failed: {}", anchor, file.relative_path, e);
                stats.failed += 1;
            }
        }
    }

    async fn find_or_create(
        &self,
        anchor: &str,
        file: &DiscoveredFile,
        stats: &mut WalkStats,
    ) -> Result<ImageRecord, StoreError> {
        let metadata = &self.context.metadata;
        if let Some(Versioned { value, .. }) = metadata.find(anchor, &file.relative_path).await? {
            return Ok(value);
        }
        let fresh = ImageRecord::new(anchor, &file.relative_path, file.size);
        let fresh_id = fresh.image_id;
        let stored = metadata.create_if_absent(fresh).await?;
        if stored.value.image_id == fresh_id {
            stats.created += 1;
        }
        Ok(stored.value)
    }

    /// The job for everything `record` is still missing.
    fn plan(&self, record: &ImageRecord, generate_thumbnail: bool) -> LoadJob {
        LoadJob {
            anchor: record.anchor.clone(),
            relative_path: record.relative_path.clone(),
            image_id: record.image_id,
            missing_hash_algorithms: record.missing_hashes(&self.requirements.hash_algorithms),
            missing_custom_hash_algorithms: record
                .missing_hashes(&self.requirements.custom_hash_algorithms),
            generate_thumbnail: self.requirements.thumbnails
                && generate_thumbnail
                && record.thumbnail.is_none(),
            recreate_thumbnail_only: false,
        }
    }

    async fn publish(&self, job: &LoadJob) -> PipelineResult<()> {
        let message: Message = self.context.codec.encode_job(job)?;
        self.context
            .publisher
            .publish(&self.destination, message)
            .await?;
        Ok(())
    }

    /// Walk every uncompleted loader task and mark it completed.
    ///
    /// Tasks naming an unknown anchor stay pending.
    pub async fn run_pending_tasks(&self) -> Result<WalkStats, StoreError> {
        let mut total = WalkStats::default();
        for task in self.context.metadata.pending_tasks().await? {
            if self.is_cancelled() {
                break;
            }
            match self
                .walk(&task.anchor, &task.relative_path, task.generate_thumbnail)
                .await
            {
                Ok(stats) => {
                    total.merge(stats);
                    if self.is_cancelled() {
                        break;
                    }
                    self.context.metadata.mark_task_completed(task.job_id).await?;
                    tracing::info!("Loader task {} completed", task.job_id);
                }
                Err(e) => tracing::warn!("Loader task {} left pending: {}", task.job_id, e),
            }
        }
        Ok(total)
    }

    /// Re-upload a source file and ask the preprocessor to rebuild its thumbnail.
    async fn request_thumbnail(&self, anchor: &str, relative_path: &str) -> PipelineResult<()> {
        let record = self
            .context
            .metadata
            .find(anchor, relative_path)
            .await?
            .ok_or_else(|| PipelineError::UnknownRecord {
                anchor: anchor.to_string(),
                relative_path: relative_path.to_string(),
            })?
            .value;
        let path = self.root(anchor)?.join(relative_path);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::Fetch {
                    image_id: record.image_id,
                    message: format!("{} no longer exists", path.display()),
                }
            } else {
                PipelineError::Io { path, source: e }
            }
        })?;
        self.context
            .buckets
            .images
            .put(&ArtifactKind::Source.key(record.image_id), bytes)
            .await?;

        let job = LoadJob {
            anchor: record.anchor.clone(),
            relative_path: record.relative_path.clone(),
            image_id: record.image_id,
            missing_hash_algorithms: Vec::new(),
            missing_custom_hash_algorithms: Vec::new(),
            generate_thumbnail: false,
            recreate_thumbnail_only: true,
        };
        self.publish(&job).await
    }
}

/// Consumes `thumbnail-requests`: each `ImagePath` becomes a
/// thumbnail-only load job.
pub struct ThumbnailRequestHandler {
    loader: Arc<Loader>,
}

impl ThumbnailRequestHandler {
    pub fn new(loader: Arc<Loader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl MessageHandler for ThumbnailRequestHandler {
    fn stage(&self) -> &'static str {
        "thumbnail-request"
    }

    async fn handle(&self, message: &Message) -> PipelineResult<()> {
        let path = self.loader.context.codec.decode_path(message)?;
        tracing::debug!("Thumbnail requested for {}/{}", path.anchor, path.relative_path);
        self.loader
            .request_thumbnail(&path.anchor, &path.relative_path)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Channel, Connection, Consumer, QueueOptions};
    use crate::codec::Generation;
    use crate::dynamic::keys;
    use crate::store::{BlobStore, Buckets, MemoryMetadataStore, MetadataStore};
    use crate::types::{FileLoaderTask, ImagePath, UpdateKind};
    use std::collections::BTreeMap as Map;
    use std::time::Duration;

    struct Harness {
        _connection: Connection,
        consumer: Consumer,
        metadata: Arc<MemoryMetadataStore>,
        buckets: Buckets,
        loader: Arc<Loader>,
        dir: tempfile::TempDir,
    }

    fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
        harness_with_images(configure, None)
    }

    /// Source bucket that refuses every upload.
    struct RejectingStore;

    #[async_trait]
    impl BlobStore for RejectingStore {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn put(&self, _key: &str, _data: Vec<u8>) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("bucket unavailable")))
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::NotFound(key.to_string()))
        }

        async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    fn harness_with_images(
        configure: impl FnOnce(&mut Config),
        images: Option<Arc<dyn BlobStore>>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config
            .loader
            .anchors
            .insert("photos".to_string(), dir.path().to_path_buf());
        config.loader.custom_hash_algorithms = vec![];
        configure(&mut config);

        let broker = Broker::new();
        let connection = broker.connect();
        let channel: Channel = connection.channel().unwrap();
        channel.queue_declare("jobs", QueueOptions::DURABLE).unwrap();
        let consumer = channel.basic_consume("jobs").unwrap();

        let metadata = Arc::new(MemoryMetadataStore::new());
        let mut buckets = Buckets::in_memory(config.general.environment);
        if let Some(images) = images {
            buckets.images = images;
        }
        let context = StageContext {
            codec: Generation::Structured.codec(),
            publisher: Arc::new(channel),
            buckets: buckets.clone(),
            metadata: metadata.clone(),
        };
        let rate = Arc::new(DynamicCell::new(keys::RATE_LIMIT, 1000.0));
        let loader = Arc::new(Loader::new(
            &config,
            context,
            Destination::queue("jobs"),
            rate,
        ));
        Harness {
            _connection: connection,
            consumer,
            metadata,
            buckets,
            loader,
            dir,
        }
    }

    async fn next_job(consumer: &mut Consumer) -> LoadJob {
        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .unwrap()
            .unwrap();
        let job = Generation::Structured
            .codec()
            .decode_job(delivery.message())
            .unwrap();
        delivery.ack();
        job
    }

    #[tokio::test]
    async fn test_first_walk_creates_and_publishes() {
        let mut h = harness(|_| {});
        std::fs::write(h.dir.path().join("a.jpg"), b"jpeg bytes").unwrap();
        std::fs::write(h.dir.path().join("skip.txt"), b"text").unwrap();

        let stats = h.loader.walk("photos", "", true).await.unwrap();
        assert_eq!(stats.seen, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.published, 1);

        let job = next_job(&mut h.consumer).await;
        assert_eq!(job.relative_path, "a.jpg");
        assert_eq!(job.missing_hash_algorithms, vec!["SHA-256"]);
        assert!(job.generate_thumbnail);

        // Eager creation: the record exists before any worker ran.
        let record = h.metadata.find("photos", "a.jpg").await.unwrap().unwrap();
        assert_eq!(record.value.image_id, job.image_id);
        let uploaded = h
            .buckets
            .images
            .get(&ArtifactKind::Source.key(job.image_id))
            .await
            .unwrap();
        assert_eq!(uploaded, b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_complete_record_is_skipped() {
        let h = harness(|_| {});
        std::fs::write(h.dir.path().join("a.jpg"), b"x").unwrap();
        let mut record = ImageRecord::new("photos", "a.jpg", 1);
        let mut digests = Map::new();
        digests.insert("SHA-256".to_string(), vec![0; 32]);
        record.apply(&UpdateKind::Hashes { digests });
        record.apply(&UpdateKind::Thumbnail { max_dimension: 256 });
        h.metadata.save(&record, None).await.unwrap();

        let stats = h.loader.walk("photos", "", true).await.unwrap();
        assert_eq!(stats.complete, 1);
        assert_eq!(stats.published, 0);
        assert!(h.buckets.images.get(&ArtifactKind::Source.key(record.image_id)).await.is_err());
    }

    #[tokio::test]
    async fn test_only_missing_work_is_requested() {
        let mut h = harness(|config| {
            config.loader.hash_algorithms = vec!["SHA-256".to_string(), "SHA-512".to_string()];
        });
        std::fs::write(h.dir.path().join("a.jpg"), b"x").unwrap();
        let mut record = ImageRecord::new("photos", "a.jpg", 1);
        let mut digests = Map::new();
        digests.insert("SHA-256".to_string(), vec![0; 32]);
        record.apply(&UpdateKind::Hashes { digests });
        record.apply(&UpdateKind::Thumbnail { max_dimension: 256 });
        h.metadata.save(&record, None).await.unwrap();

        h.loader.walk("photos", "", true).await.unwrap();
        let job = next_job(&mut h.consumer).await;
        assert_eq!(job.image_id, record.image_id);
        assert_eq!(job.missing_hash_algorithms, vec!["SHA-512"]);
        assert!(!job.generate_thumbnail);
    }

    #[tokio::test]
    async fn test_oversized_file_is_skipped() {
        let h = harness(|config| config.limits.max_file_size_mb = 1);
        std::fs::write(h.dir.path().join("big.jpg"), vec![0u8; 1024 * 1024 + 1]).unwrap();
        let stats = h.loader.walk("photos", "", true).await.unwrap();
        assert_eq!(stats.too_large, 1);
        assert!(h.metadata.all_records().is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_is_not_published() {
        let mut h = harness_with_images(|_| {}, Some(Arc::new(RejectingStore)));
        std::fs::write(h.dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(h.dir.path().join("b.jpg"), b"y").unwrap();

        let stats = h.loader.walk("photos", "", true).await.unwrap();
        assert_eq!(stats.seen, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.published, 0);
        assert!(tokio::time::timeout(Duration::from_millis(50), h.consumer.next())
            .await
            .is_err());
        // Records were still created eagerly.
        assert_eq!(h.metadata.all_records().len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_file_does_not_stop_the_walk() {
        let mut h = harness(|_| {});
        std::fs::write(h.dir.path().join("b.jpg"), b"present").unwrap();
        let vanished = DiscoveredFile {
            path: h.dir.path().join("a.jpg"),
            relative_path: "a.jpg".to_string(),
            size: 3,
        };
        let present = DiscoveredFile {
            path: h.dir.path().join("b.jpg"),
            relative_path: "b.jpg".to_string(),
            size: 7,
        };

        let mut stats = WalkStats::default();
        for file in [&vanished, &present] {
            h.loader.load_file("photos", file, true, &mut stats).await;
        }
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.published, 1);
        assert_eq!(next_job(&mut h.consumer).await.relative_path, "b.jpg");
    }

    #[tokio::test]
    async fn test_cancelled_walk_publishes_nothing() {
        let h = harness(|_| {});
        std::fs::write(h.dir.path().join("a.jpg"), b"x").unwrap();
        h.loader.cancel();
        let stats = h.loader.walk("photos", "", true).await.unwrap();
        assert_eq!(stats.seen, 0);
    }

    #[tokio::test]
    async fn test_unknown_anchor() {
        let h = harness(|_| {});
        assert!(matches!(
            h.loader.walk("nowhere", "", true).await,
            Err(PipelineError::UnknownAnchor(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_tasks_are_walked_and_completed() {
        let mut h = harness(|_| {});
        std::fs::create_dir_all(h.dir.path().join("2021")).unwrap();
        std::fs::write(h.dir.path().join("2021/a.jpg"), b"x").unwrap();
        std::fs::write(h.dir.path().join("b.jpg"), b"y").unwrap();
        let mut task = FileLoaderTask::new("photos", "2021");
        task.generate_thumbnail = false;
        h.metadata.insert_task(task).await.unwrap();
        h.metadata
            .insert_task(FileLoaderTask::new("elsewhere", ""))
            .await
            .unwrap();

        let stats = h.loader.run_pending_tasks().await.unwrap();
        assert_eq!(stats.published, 1);
        let job = next_job(&mut h.consumer).await;
        assert_eq!(job.relative_path, "2021/a.jpg");
        assert!(!job.generate_thumbnail);

        let pending = h.metadata.pending_tasks().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].anchor, "elsewhere");
    }

    #[tokio::test]
    async fn test_thumbnail_request_becomes_recreate_job() {
        let mut h = harness(|_| {});
        std::fs::write(h.dir.path().join("a.jpg"), b"source").unwrap();
        let record = ImageRecord::new("photos", "a.jpg", 6);
        h.metadata.save(&record, None).await.unwrap();

        let handler = ThumbnailRequestHandler::new(Arc::clone(&h.loader));
        let message = Generation::Structured
            .codec()
            .encode_path(&ImagePath {
                anchor: "photos".to_string(),
                relative_path: "a.jpg".to_string(),
            })
            .unwrap();
        handler.handle(&message).await.unwrap();

        let job = next_job(&mut h.consumer).await;
        assert!(job.recreate_thumbnail_only);
        assert!(job.missing_hash_algorithms.is_empty());
        assert_eq!(job.image_id, record.image_id);
    }

    #[tokio::test]
    async fn test_thumbnail_request_for_unknown_record_is_dropped() {
        let h = harness(|_| {});
        let handler = ThumbnailRequestHandler::new(Arc::clone(&h.loader));
        let message = Generation::Structured
            .codec()
            .encode_path(&ImagePath {
                anchor: "photos".to_string(),
                relative_path: "ghost.jpg".to_string(),
            })
            .unwrap();
        let err = handler.handle(&message).await.unwrap_err();
        assert_eq!(
            err.disposition(),
            crate::pipeline::dispatch::Disposition::Ack
        );
    }
}
