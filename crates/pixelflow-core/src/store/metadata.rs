//! Metadata store for image records and the loader task ledger.
//!
//! Writes are compare-and-set on a per-record version: `save` succeeds only
//! if the stored version still equals the version the caller read. The
//! persistence sink relies on this to turn concurrent updates of one record
//! into a redelivery instead of a lost write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{FileLoaderTask, ImageRecord};

/// A stored value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up a record by key.
    async fn find(
        &self,
        anchor: &str,
        relative_path: &str,
    ) -> Result<Option<Versioned<ImageRecord>>, StoreError>;

    /// Insert a record unless one exists for its key; returns whichever
    /// record is stored afterwards.
    async fn create_if_absent(&self, record: ImageRecord)
        -> Result<Versioned<ImageRecord>, StoreError>;

    /// Write the whole record if the stored version equals `expected_version`
    /// (`None`: the record must not exist yet). Returns the new version.
    async fn save(
        &self,
        record: &ImageRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Whether any record's thumbnail descriptor points at `image_id`.
    async fn references_thumbnail(&self, image_id: Uuid) -> Result<bool, StoreError>;

    /// Loader tasks not yet completed.
    async fn pending_tasks(&self) -> Result<Vec<FileLoaderTask>, StoreError>;

    async fn insert_task(&self, task: FileLoaderTask) -> Result<(), StoreError>;

    /// Mark a loader task completed. Tasks are never deleted.
    async fn mark_task_completed(&self, job_id: Uuid) -> Result<(), StoreError>;
}

type RecordKey = (String, String);

/// In-memory metadata store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<RecordKey, Versioned<ImageRecord>>>,
    tasks: Mutex<Vec<FileLoaderTask>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing records, each at version 1.
    pub fn from_records(records: impl IntoIterator<Item = ImageRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = lock(&store.records);
            for record in records {
                map.insert(
                    key_of(&record),
                    Versioned {
                        value: record,
                        version: 1,
                    },
                );
            }
        }
        store
    }

    /// Snapshot of every record, ordered by key.
    pub fn all_records(&self) -> Vec<ImageRecord> {
        let map = lock(&self.records);
        let mut records: Vec<ImageRecord> = map.values().map(|v| v.value.clone()).collect();
        records.sort_by(|a, b| {
            (&a.anchor, &a.relative_path).cmp(&(&b.anchor, &b.relative_path))
        });
        records
    }

    /// Snapshot of every loader task.
    pub fn all_tasks(&self) -> Vec<FileLoaderTask> {
        lock(&self.tasks).clone()
    }
}

fn key_of(record: &ImageRecord) -> RecordKey {
    (record.anchor.clone(), record.relative_path.clone())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn find(
        &self,
        anchor: &str,
        relative_path: &str,
    ) -> Result<Option<Versioned<ImageRecord>>, StoreError> {
        let key = (anchor.to_string(), relative_path.to_string());
        Ok(lock(&self.records).get(&key).cloned())
    }

    async fn create_if_absent(
        &self,
        record: ImageRecord,
    ) -> Result<Versioned<ImageRecord>, StoreError> {
        let mut map = lock(&self.records);
        let entry = map.entry(key_of(&record)).or_insert_with(|| Versioned {
            value: record,
            version: 1,
        });
        Ok(entry.clone())
    }

    async fn save(
        &self,
        record: &ImageRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut map = lock(&self.records);
        let key = key_of(record);
        let actual = map.get(&key).map(|stored| stored.version);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                anchor: record.anchor.clone(),
                relative_path: record.relative_path.clone(),
                expected: expected_version,
                actual,
            });
        }
        let version = actual.map_or(1, |v| v + 1);
        map.insert(
            key,
            Versioned {
                value: record.clone(),
                version,
            },
        );
        Ok(version)
    }

    async fn references_thumbnail(&self, image_id: Uuid) -> Result<bool, StoreError> {
        Ok(lock(&self.records).values().any(|stored| {
            stored
                .value
                .thumbnail
                .as_ref()
                .is_some_and(|thumbnail| thumbnail.image_id == image_id)
        }))
    }

    async fn pending_tasks(&self) -> Result<Vec<FileLoaderTask>, StoreError> {
        Ok(lock(&self.tasks)
            .iter()
            .filter(|task| !task.completed)
            .cloned()
            .collect())
    }

    async fn insert_task(&self, task: FileLoaderTask) -> Result<(), StoreError> {
        lock(&self.tasks).push(task);
        Ok(())
    }

    async fn mark_task_completed(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut tasks = lock(&self.tasks);
        let task = tasks
            .iter_mut()
            .find(|task| task.job_id == job_id)
            .ok_or_else(|| StoreError::NotFound(format!("loader task {job_id}")))?;
        task.completed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateKind;

    #[tokio::test]
    async fn test_create_if_absent_keeps_first_record() {
        let store = MemoryMetadataStore::new();
        let first = store
            .create_if_absent(ImageRecord::new("photos", "a.jpg", 10))
            .await
            .unwrap();
        let second = store
            .create_if_absent(ImageRecord::new("photos", "a.jpg", 10))
            .await
            .unwrap();
        assert_eq!(first.value.image_id, second.value.image_id);
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn test_save_is_compare_and_set() {
        let store = MemoryMetadataStore::new();
        let mut record = ImageRecord::new("photos", "a.jpg", 10);

        assert_eq!(store.save(&record, None).await.unwrap(), 1);
        assert!(matches!(
            store.save(&record, None).await,
            Err(StoreError::VersionConflict {
                expected: None,
                actual: Some(1),
                ..
            })
        ));

        record.tags.insert("beach".to_string());
        assert_eq!(store.save(&record, Some(1)).await.unwrap(), 2);
        // A writer still holding version 1 loses.
        assert!(store.save(&record, Some(1)).await.is_err());

        let stored = store.find("photos", "a.jpg").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert!(stored.value.tags.contains("beach"));
    }

    #[tokio::test]
    async fn test_references_thumbnail() {
        let mut record = ImageRecord::new("photos", "a.jpg", 10);
        let id = record.image_id;
        let store = MemoryMetadataStore::from_records([record.clone()]);
        assert!(!store.references_thumbnail(id).await.unwrap());

        record.apply(&UpdateKind::Thumbnail { max_dimension: 128 });
        store.save(&record, Some(1)).await.unwrap();
        assert!(store.references_thumbnail(id).await.unwrap());
        assert!(!store.references_thumbnail(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_task_ledger() {
        let store = MemoryMetadataStore::new();
        let task = FileLoaderTask::new("photos", "2021");
        let job_id = task.job_id;
        store.insert_task(task).await.unwrap();
        assert_eq!(store.pending_tasks().await.unwrap().len(), 1);

        store.mark_task_completed(job_id).await.unwrap();
        assert!(store.pending_tasks().await.unwrap().is_empty());
        // Completed tasks stay in the ledger.
        assert_eq!(store.all_tasks().len(), 1);
        assert!(store.mark_task_completed(Uuid::new_v4()).await.is_err());
    }

    #[test]
    fn test_all_records_sorted() {
        let store = MemoryMetadataStore::from_records([
            ImageRecord::new("photos", "b.jpg", 1),
            ImageRecord::new("photos", "a.jpg", 1),
            ImageRecord::new("archive", "z.jpg", 1),
        ]);
        let keys: Vec<_> = store
            .all_records()
            .into_iter()
            .map(|r| format!("{}/{}", r.anchor, r.relative_path))
            .collect();
        assert_eq!(keys, vec!["archive/z.jpg", "photos/a.jpg", "photos/b.jpg"]);
    }
}
