//! Hash worker stage.
//!
//! Two kinds of consumers share this handler: digest workers hash the raw
//! source bytes, perceptual workers hash the analysis image. Each job yields
//! exactly one hash update carrying every digest that was computed.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::algorithm::{Algorithm, AlgorithmKind};
use crate::broker::{Destination, Message};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::store::ArtifactKind;
use crate::types::{LoadJob, PersistenceUpdate, UpdateKind};

use super::decode::ImageDecoder;
use super::dispatch::MessageHandler;
use super::hash::Hasher;
use super::StageContext;

/// Which half of the hash work a worker does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Standard digests over raw bytes (`missing_hash_algorithms`)
    Digest,
    /// Perceptual hashes over the analysis image (`missing_custom_hash_algorithms`)
    Perceptual,
}

impl WorkerKind {
    fn algorithm_kind(self) -> AlgorithmKind {
        match self {
            WorkerKind::Digest => AlgorithmKind::Digest,
            WorkerKind::Perceptual => AlgorithmKind::Perceptual,
        }
    }

    fn requested(self, job: &LoadJob) -> &[String] {
        match self {
            WorkerKind::Digest => &job.missing_hash_algorithms,
            WorkerKind::Perceptual => &job.missing_custom_hash_algorithms,
        }
    }
}

pub struct HashWorker {
    kind: WorkerKind,
    context: StageContext,
    /// Where hash updates are published
    updates: Destination,
    hasher: Arc<Hasher>,
    decoder: ImageDecoder,
}

impl HashWorker {
    pub fn new(
        kind: WorkerKind,
        config: &Config,
        context: StageContext,
        updates: Destination,
    ) -> Self {
        Self {
            kind,
            context,
            updates,
            hasher: Arc::new(Hasher::new()),
            decoder: ImageDecoder::new(config.limits.clone()),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Known algorithms of this worker's kind; everything else is logged and skipped.
    fn algorithms(&self, job: &LoadJob) -> Vec<Algorithm> {
        let mut algorithms = Vec::new();
        for name in self.kind.requested(job) {
            match Algorithm::from_name(name) {
                Some(alg) if alg.kind() == self.kind.algorithm_kind() => {
                    if !algorithms.contains(&alg) {
                        algorithms.push(alg);
                    }
                }
                Some(alg) => tracing::warn!(
                    "{:?} worker skipping {} for {}/{}: wrong worker kind",
                    self.kind,
                    alg,
                    job.anchor,
                    job.relative_path
                ),
                None => tracing::warn!(
                    "{:?} worker skipping unknown algorithm {:?} for {}/{}",
                    self.kind,
                    name,
                    job.anchor,
                    job.relative_path
                ),
            }
        }
        algorithms
    }

    async fn compute(
        &self,
        job: &LoadJob,
        algorithms: Vec<Algorithm>,
    ) -> PipelineResult<BTreeMap<String, Vec<u8>>> {
        let image_id = job.image_id;
        let (bucket, kind) = match self.kind {
            WorkerKind::Digest => (&self.context.buckets.images, ArtifactKind::Source),
            WorkerKind::Perceptual => (&self.context.buckets.preprocessed, ArtifactKind::Analysis),
        };
        let bytes = bucket
            .get(&kind.key(image_id))
            .await
            .map_err(|e| PipelineError::Fetch {
                image_id,
                message: e.to_string(),
            })?;

        let results: Vec<(Algorithm, Option<Vec<u8>>)> = match self.kind {
            WorkerKind::Digest => {
                tokio::task::spawn_blocking(move || {
                    algorithms
                        .into_iter()
                        .map(|alg| (alg, Hasher::digest(alg, &bytes)))
                        .collect()
                })
                .await
            }
            WorkerKind::Perceptual => {
                let image = self.decoder.decode_from_bytes(bytes, image_id).await?.image;
                let hasher = Arc::clone(&self.hasher);
                tokio::task::spawn_blocking(move || {
                    algorithms
                        .into_iter()
                        .map(|alg| (alg, hasher.perceptual(alg, &image)))
                        .collect()
                })
                .await
            }
        }
        .map_err(|e| PipelineError::Encode {
            image_id,
            message: format!("Task join error: {}", e),
        })?;

        Ok(results
            .into_iter()
            .filter_map(|(alg, digest)| digest.map(|d| (alg.name().to_string(), d)))
            .collect())
    }
}

#[async_trait]
impl MessageHandler for HashWorker {
    fn stage(&self) -> &'static str {
        match self.kind {
            WorkerKind::Digest => "digest",
            WorkerKind::Perceptual => "perceptual",
        }
    }

    async fn handle(&self, message: &Message) -> PipelineResult<()> {
        let job = self.context.codec.decode_job(message)?;
        let algorithms = self.algorithms(&job);
        if algorithms.is_empty() {
            tracing::debug!("Nothing to hash for {}/{}", job.anchor, job.relative_path);
            return Ok(());
        }

        let digests = self.compute(&job, algorithms).await?;
        if digests.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "Hashed {}/{}: {:?}",
            job.anchor,
            job.relative_path,
            digests.keys().collect::<Vec<_>>()
        );

        let update = PersistenceUpdate {
            anchor: job.anchor,
            relative_path: job.relative_path,
            kind: UpdateKind::Hashes { digests },
        };
        let message = self.context.codec.encode_update(&update)?;
        self.context.publisher.publish(&self.updates, message).await?;
        Ok(())
    }
}
