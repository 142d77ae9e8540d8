//! Persistence sink: the single writer of hashes and thumbnail descriptors.

use async_trait::async_trait;

use crate::broker::Message;
use crate::codec::Codec;
use crate::error::PipelineResult;
use crate::store::MetadataStore;
use crate::types::{ImageRecord, PersistenceUpdate};

use super::dispatch::MessageHandler;
use super::StageContext;

/// Merges persistence updates into image records.
///
/// Every write is a compare-and-set against the version that was read. A lost
/// race surfaces as a store error, which leaves the message for redelivery.
pub struct PersistenceSink {
    context: StageContext,
}

impl PersistenceSink {
    pub fn new(context: StageContext) -> Self {
        Self { context }
    }

    fn metadata(&self) -> &dyn MetadataStore {
        self.context.metadata.as_ref()
    }

    fn codec(&self) -> &dyn Codec {
        self.context.codec.as_ref()
    }

    /// Apply one update and write the record back. Returns the new version.
    pub async fn persist(&self, update: &PersistenceUpdate) -> PipelineResult<u64> {
        let (mut record, expected) = match self
            .metadata()
            .find(&update.anchor, &update.relative_path)
            .await?
        {
            Some(stored) => (stored.value, Some(stored.version)),
            None => {
                tracing::warn!(
                    "No record for {}/{}, creating one",
                    update.anchor,
                    update.relative_path
                );
                (
                    ImageRecord::new(update.anchor.clone(), update.relative_path.clone(), 0),
                    None,
                )
            }
        };

        record.apply(&update.kind);
        let version = self.metadata().save(&record, expected).await?;
        Ok(version)
    }
}

#[async_trait]
impl MessageHandler for PersistenceSink {
    fn stage(&self) -> &'static str {
        "persistence"
    }

    async fn handle(&self, message: &Message) -> PipelineResult<()> {
        let update = self.codec().decode_update(message)?;
        let version = self.persist(&update).await?;
        tracing::debug!(
            "Persisted {}/{} at version {}",
            update.anchor,
            update.relative_path,
            version
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::codec::Generation;
    use crate::error::{PipelineError, StoreError};
    use crate::pipeline::Disposition;
    use crate::store::{Buckets, MemoryMetadataStore};
    use crate::types::UpdateKind;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn sink(metadata: Arc<MemoryMetadataStore>, generation: Generation) -> PersistenceSink {
        let broker = Broker::new();
        let connection = broker.connect();
        PersistenceSink::new(StageContext {
            codec: generation.codec(),
            publisher: Arc::new(connection.channel().unwrap()),
            buckets: Buckets::in_memory(Default::default()),
            metadata,
        })
    }

    fn hashes(anchor: &str, path: &str, pairs: &[(&str, Vec<u8>)]) -> PersistenceUpdate {
        PersistenceUpdate {
            anchor: anchor.to_string(),
            relative_path: path.to_string(),
            kind: UpdateKind::Hashes {
                digests: pairs
                    .iter()
                    .map(|(name, digest)| (name.to_string(), digest.clone()))
                    .collect::<BTreeMap<_, _>>(),
            },
        }
    }

    fn thumbnail(anchor: &str, path: &str, size: u32) -> PersistenceUpdate {
        PersistenceUpdate {
            anchor: anchor.to_string(),
            relative_path: path.to_string(),
            kind: UpdateKind::Thumbnail {
                max_dimension: size,
            },
        }
    }

    #[tokio::test]
    async fn test_updates_merge_into_existing_record() {
        let record = ImageRecord::new("photos", "a.jpg", 10);
        let id = record.image_id;
        let metadata = Arc::new(MemoryMetadataStore::from_records([record]));
        let sink = sink(Arc::clone(&metadata), Generation::Structured);

        sink.persist(&hashes("photos", "a.jpg", &[("SHA-256", vec![1; 32])]))
            .await
            .unwrap();
        sink.persist(&hashes("photos", "a.jpg", &[("BLAKE3", vec![2; 32])]))
            .await
            .unwrap();
        let version = sink.persist(&thumbnail("photos", "a.jpg", 128)).await.unwrap();
        assert_eq!(version, 4);

        let stored = metadata.find("photos", "a.jpg").await.unwrap().unwrap().value;
        assert_eq!(stored.hashes.len(), 2);
        assert_eq!(stored.hashes["SHA-256"].digest, vec![1; 32]);
        let thumb = stored.thumbnail.unwrap();
        assert_eq!(thumb.image_id, id);
        assert_eq!(thumb.max_dimension, 128);
    }

    #[tokio::test]
    async fn test_repeated_update_is_idempotent() {
        let metadata = Arc::new(MemoryMetadataStore::from_records([ImageRecord::new(
            "photos", "a.jpg", 10,
        )]));
        let sink = sink(Arc::clone(&metadata), Generation::Structured);
        let update = hashes("photos", "a.jpg", &[("SHA-256", vec![7; 32])]);

        sink.persist(&update).await.unwrap();
        let once = metadata.find("photos", "a.jpg").await.unwrap().unwrap().value;
        sink.persist(&update).await.unwrap();
        let twice = metadata.find("photos", "a.jpg").await.unwrap().unwrap().value;
        assert_eq!(once.hashes, twice.hashes);
        assert_eq!(once.thumbnail, twice.thumbnail);
    }

    #[tokio::test]
    async fn test_missing_record_is_synthesized() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let sink = sink(Arc::clone(&metadata), Generation::Legacy);
        let message = sink
            .codec()
            .encode_update(&thumbnail("photos", "new.jpg", 64))
            .unwrap();
        sink.handle(&message).await.unwrap();

        let stored = metadata.find("photos", "new.jpg").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        let thumb = stored.value.thumbnail.unwrap();
        assert_eq!(thumb.image_id, stored.value.image_id);
        assert_eq!(thumb.max_dimension, 64);
    }

    #[tokio::test]
    async fn test_lost_race_is_requeued() {
        struct Racing {
            inner: MemoryMetadataStore,
        }

        #[async_trait]
        impl MetadataStore for Racing {
            async fn find(
                &self,
                anchor: &str,
                relative_path: &str,
            ) -> Result<Option<crate::store::Versioned<ImageRecord>>, StoreError> {
                let found = self.inner.find(anchor, relative_path).await?;
                // Another writer commits between our read and our write.
                if let Some(stored) = &found {
                    self.inner.save(&stored.value, Some(stored.version)).await?;
                }
                Ok(found)
            }
            async fn create_if_absent(
                &self,
                record: ImageRecord,
            ) -> Result<crate::store::Versioned<ImageRecord>, StoreError> {
                self.inner.create_if_absent(record).await
            }
            async fn save(&self, record: &ImageRecord, expected: Option<u64>) -> Result<u64, StoreError> {
                self.inner.save(record, expected).await
            }
            async fn references_thumbnail(&self, id: uuid::Uuid) -> Result<bool, StoreError> {
                self.inner.references_thumbnail(id).await
            }
            async fn pending_tasks(&self) -> Result<Vec<crate::types::FileLoaderTask>, StoreError> {
                self.inner.pending_tasks().await
            }
            async fn insert_task(&self, task: crate::types::FileLoaderTask) -> Result<(), StoreError> {
                self.inner.insert_task(task).await
            }
            async fn mark_task_completed(&self, job_id: uuid::Uuid) -> Result<(), StoreError> {
                self.inner.mark_task_completed(job_id).await
            }
        }

        let broker = Broker::new();
        let connection = broker.connect();
        let sink = PersistenceSink::new(StageContext {
            codec: Generation::Structured.codec(),
            publisher: Arc::new(connection.channel().unwrap()),
            buckets: Buckets::in_memory(Default::default()),
            metadata: Arc::new(Racing {
                inner: MemoryMetadataStore::from_records([ImageRecord::new("photos", "a.jpg", 1)]),
            }),
        });

        let err = sink
            .persist(&thumbnail("photos", "a.jpg", 32))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Store(StoreError::VersionConflict { .. })
        ));
        assert_eq!(err.disposition(), Disposition::Requeue);
    }
}
