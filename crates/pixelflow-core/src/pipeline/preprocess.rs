//! Preprocessor stage.
//!
//! Consumes load jobs, writes the thumbnail (when asked) and the grayscale
//! analysis image, then forwards the hash work to the hash worker queues.
//! A thumbnail blob is always written before the update announcing it.

use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;
use uuid::Uuid;

use crate::broker::{Destination, Message};
use crate::config::Config;
use crate::dynamic::DynamicCell;
use crate::error::{PipelineError, PipelineResult};
use crate::store::ArtifactKind;
use crate::topology::UpdateRoutes;
use crate::types::{LoadJob, PersistenceUpdate, UpdateKind};

use super::decode::ImageDecoder;
use super::dispatch::MessageHandler;
use super::thumbnail::{analysis_png, longest_edge, ThumbnailGenerator};
use super::StageContext;

/// Next-stage destinations for forwarded jobs.
#[derive(Debug, Clone)]
pub struct PreprocessRoutes {
    /// Jobs with standard digest work
    pub digests: Destination,
    /// Jobs with perceptual hash work
    pub perceptual: Destination,
    /// Persistence updates
    pub updates: UpdateRoutes,
}

pub struct Preprocessor {
    context: StageContext,
    routes: PreprocessRoutes,
    decoder: ImageDecoder,
    thumbnails: ThumbnailGenerator,
    thumbnail_size: Arc<DynamicCell<u32>>,
    analysis_size: u32,
}

impl Preprocessor {
    pub fn new(
        config: &Config,
        context: StageContext,
        routes: PreprocessRoutes,
        thumbnail_size: Arc<DynamicCell<u32>>,
    ) -> Self {
        Self {
            context,
            routes,
            decoder: ImageDecoder::new(config.limits.clone()),
            thumbnails: ThumbnailGenerator::new(config.thumbnail.quality),
            thumbnail_size,
            analysis_size: config.analysis.size,
        }
    }

    async fn process(&self, job: LoadJob) -> PipelineResult<()> {
        let image_id = job.image_id;
        let source_key = ArtifactKind::Source.key(image_id);
        let bytes = self
            .context
            .buckets
            .images
            .get(&source_key)
            .await
            .map_err(|e| PipelineError::Fetch {
                image_id,
                message: e.to_string(),
            })?;
        let decoded = self.decoder.decode_from_bytes(bytes, image_id).await?;
        let image = Arc::new(decoded.image);

        if job.recreate_thumbnail_only {
            return self.write_thumbnail(&job, &image).await;
        }

        if job.generate_thumbnail {
            let size = self.thumbnail_size.read();
            match self.stored_thumbnail_edge(image_id).await? {
                // Blob written by an earlier attempt that never got announced.
                Some(edge) if edge == size => {
                    tracing::debug!("Thumbnail for {} already stored at {}px", image_id, edge);
                    self.announce_thumbnail(&job, size).await?;
                }
                _ => self.write_thumbnail(&job, &image).await?,
            }
        }

        let forwarded = job.without_thumbnail_flags();
        if forwarded.missing_hash_algorithms.is_empty()
            && forwarded.missing_custom_hash_algorithms.is_empty()
        {
            return Ok(());
        }

        if !forwarded.missing_custom_hash_algorithms.is_empty() {
            let size = self.analysis_size;
            let source = Arc::clone(&image);
            let png = tokio::task::spawn_blocking(move || analysis_png(&source, size))
                .await
                .map_err(|e| PipelineError::Encode {
                    image_id,
                    message: format!("Task join error: {}", e),
                })?
                .map_err(|message| PipelineError::Encode { image_id, message })?;
            self.context
                .buckets
                .preprocessed
                .put(&ArtifactKind::Analysis.key(image_id), png)
                .await?;
        }

        self.forward(forwarded).await
    }

    /// Split hash work by worker and publish each non-empty part.
    async fn forward(&self, job: LoadJob) -> PipelineResult<()> {
        let codec = &self.context.codec;
        if !job.missing_hash_algorithms.is_empty() {
            let digests = LoadJob {
                missing_custom_hash_algorithms: Vec::new(),
                ..job.clone()
            };
            self.publish(&self.routes.digests, codec.encode_job(&digests)?)
                .await?;
        }
        if !job.missing_custom_hash_algorithms.is_empty() {
            let perceptual = LoadJob {
                missing_hash_algorithms: Vec::new(),
                ..job
            };
            self.publish(&self.routes.perceptual, codec.encode_job(&perceptual)?)
                .await?;
        }
        Ok(())
    }

    async fn write_thumbnail(&self, job: &LoadJob, image: &Arc<DynamicImage>) -> PipelineResult<()> {
        let image_id = job.image_id;
        let size = self.thumbnail_size.read();
        let generator = self.thumbnails;
        let source = Arc::clone(image);
        let bytes = tokio::task::spawn_blocking(move || generator.generate_bytes(&source, size))
            .await
            .map_err(|e| PipelineError::Encode {
                image_id,
                message: format!("Task join error: {}", e),
            })?
            .map_err(|message| PipelineError::Encode { image_id, message })?;

        self.context
            .buckets
            .thumbnails
            .put(&ArtifactKind::Thumbnail.key(image_id), bytes)
            .await?;
        self.announce_thumbnail(job, size).await
    }

    /// Longest edge of the stored thumbnail; `None` when absent or unreadable.
    async fn stored_thumbnail_edge(&self, image_id: Uuid) -> PipelineResult<Option<u32>> {
        let thumbnails = &self.context.buckets.thumbnails;
        let key = ArtifactKind::Thumbnail.key(image_id);
        if !thumbnails.exists(&key).await? {
            return Ok(None);
        }
        Ok(longest_edge(&thumbnails.get(&key).await?))
    }

    async fn announce_thumbnail(&self, job: &LoadJob, max_dimension: u32) -> PipelineResult<()> {
        let update = PersistenceUpdate {
            anchor: job.anchor.clone(),
            relative_path: job.relative_path.clone(),
            kind: UpdateKind::Thumbnail { max_dimension },
        };
        let message = self.context.codec.encode_update(&update)?;
        self.publish(&self.routes.updates.thumbnails, message).await?;
        tracing::debug!(
            "Thumbnail {}px for {}/{}",
            max_dimension,
            job.anchor,
            job.relative_path
        );
        Ok(())
    }

    async fn publish(&self, destination: &Destination, message: Message) -> PipelineResult<()> {
        self.context.publisher.publish(destination, message).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Preprocessor {
    fn stage(&self) -> &'static str {
        "preprocess"
    }

    async fn handle(&self, message: &Message) -> PipelineResult<()> {
        let job = self.context.codec.decode_job(message)?;
        tracing::debug!("Preprocessing {}/{}", job.anchor, job.relative_path);
        self.process(job).await
    }
}
