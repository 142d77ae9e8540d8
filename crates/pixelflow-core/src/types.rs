//! Core data types: the persisted image record and the in-flight messages.
//!
//! `ImageRecord` and `FileLoaderTask` live in the metadata store. `LoadJob`,
//! `PersistenceUpdate`, and `ImagePath` only ever exist on the wire.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::codec::structured::{base64_bytes, base64_map};

/// Current version of the digest serialization stored in `HashValue`.
pub const HASH_FORMAT_VERSION: u32 = 1;

/// The canonical metadata unit, keyed by (`anchor`, `relative_path`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Named root of the tree the file was found under
    pub anchor: String,

    /// Path relative to the anchor root, always `/`-separated
    pub relative_path: String,

    /// Stable identifier assigned at first sight; object-store key
    pub image_id: Uuid,

    /// Source file size in bytes
    pub file_size: u64,

    /// Computed hashes keyed by canonical algorithm name
    #[serde(default)]
    pub hashes: BTreeMap<String, HashValue>,

    /// Thumbnail descriptor; present only after the blob was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<ThumbnailRef>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Seconds since the Unix epoch
    pub creation_time: u64,
}

impl ImageRecord {
    /// Create a record for a file seen for the first time, minting a fresh id.
    pub fn new(anchor: impl Into<String>, relative_path: impl Into<String>, file_size: u64) -> Self {
        Self {
            anchor: anchor.into(),
            relative_path: relative_path.into(),
            image_id: Uuid::new_v4(),
            file_size,
            hashes: BTreeMap::new(),
            thumbnail: None,
            tags: BTreeSet::new(),
            creation_time: unix_now(),
        }
    }

    /// Names from `required` that have no entry in `hashes`, in input order.
    pub fn missing_hashes(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.hashes.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// Merge an update into this record.
    ///
    /// Hash updates overwrite entries of the same algorithm and never remove
    /// others. Thumbnail updates set the size and keep an existing identifier.
    pub fn apply(&mut self, update: &UpdateKind) {
        match update {
            UpdateKind::Hashes { digests } => {
                for (algorithm, digest) in digests {
                    self.hashes.insert(
                        algorithm.clone(),
                        HashValue {
                            algorithm: algorithm.clone(),
                            digest: digest.clone(),
                            format_version: HASH_FORMAT_VERSION,
                        },
                    );
                }
            }
            UpdateKind::Thumbnail { max_dimension } => {
                let image_id = self.image_id;
                let thumbnail = self.thumbnail.get_or_insert(ThumbnailRef {
                    max_dimension: *max_dimension,
                    image_id,
                });
                thumbnail.max_dimension = *max_dimension;
            }
        }
    }
}

/// One computed hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashValue {
    pub algorithm: String,
    #[serde(with = "base64_bytes")]
    pub digest: Vec<u8>,
    pub format_version: u32,
}

/// Embedded thumbnail descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailRef {
    /// Longest edge in pixels
    pub max_dimension: u32,
    /// Thumbnail blob identifier
    pub image_id: Uuid,
}

/// Work order emitted by the loader for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadJob {
    pub anchor: String,
    pub relative_path: String,
    pub image_id: Uuid,
    #[serde(default)]
    pub missing_hash_algorithms: Vec<String>,
    #[serde(default)]
    pub missing_custom_hash_algorithms: Vec<String>,
    #[serde(default)]
    pub generate_thumbnail: bool,
    #[serde(default)]
    pub recreate_thumbnail_only: bool,
}

impl LoadJob {
    /// True when the job asks for no work at all.
    pub fn is_empty(&self) -> bool {
        self.missing_hash_algorithms.is_empty()
            && self.missing_custom_hash_algorithms.is_empty()
            && !self.generate_thumbnail
            && !self.recreate_thumbnail_only
    }

    /// Copy of this job with thumbnail work stripped, for forwarding to hashers.
    pub fn without_thumbnail_flags(&self) -> Self {
        Self {
            generate_thumbnail: false,
            recreate_thumbnail_only: false,
            ..self.clone()
        }
    }
}

/// Update consumed by the persistence sink, scoped to one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceUpdate {
    pub anchor: String,
    pub relative_path: String,
    pub kind: UpdateKind,
}

/// Payload of a persistence update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateKind {
    /// Algorithm name -> digest bytes
    Hashes {
        #[serde(with = "base64_map")]
        digests: BTreeMap<String, Vec<u8>>,
    },
    /// A thumbnail of the given size has been stored
    Thumbnail { max_dimension: u32 },
}

/// Bare record key, used for thumbnail re-creation requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePath {
    pub anchor: String,
    pub relative_path: String,
}

/// Persisted ledger entry asking the loader to walk a subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLoaderTask {
    pub job_id: Uuid,
    pub anchor: String,
    /// Subtree relative to the anchor root; empty for the whole anchor
    #[serde(default)]
    pub relative_path: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub generate_thumbnail: bool,
}

impl FileLoaderTask {
    pub fn new(anchor: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            anchor: anchor.into(),
            relative_path: relative_path.into(),
            completed: false,
            generate_thumbnail: true,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
