//! Sub-configuration structs with their defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::codec::Generation;
use crate::topology::names;

/// Deployment environment, which decides queue and bucket naming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    /// Parallel test runs: prefixed names, auto-deleted queues
    Isolated,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Production or isolated naming
    pub environment: Environment,

    /// Append a random per-instance suffix to isolated names
    pub unique_names: bool,

    /// Message encoding generation
    pub codec: Generation,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            unique_names: true,
            codec: Generation::Structured,
        }
    }
}

/// Loader (file walker) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Extension allow-list, matched case-insensitively
    pub supported_formats: Vec<String>,

    /// Standard digests every image must have
    pub hash_algorithms: Vec<String>,

    /// Perceptual hashes every image must have
    pub custom_hash_algorithms: Vec<String>,

    /// Whether every image must have a thumbnail
    pub generate_thumbnails: bool,

    /// Initial publication rate in messages per second (live-updated afterwards)
    pub rate_limit: f64,

    /// Files buffered between the directory walker and the publisher
    pub walk_buffer: usize,

    /// Anchor name -> root directory
    pub anchors: BTreeMap<String, PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            supported_formats: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "gif".to_string(),
                "bmp".to_string(),
                "webp".to_string(),
                "tif".to_string(),
                "tiff".to_string(),
            ],
            hash_algorithms: vec!["SHA-256".to_string()],
            custom_hash_algorithms: vec!["phash".to_string()],
            generate_thumbnails: true,
            rate_limit: 50.0,
            walk_buffer: 100,
            anchors: BTreeMap::new(),
        }
    }
}

/// Consumer pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Consumers per hash worker kind; 0 uses the available CPU parallelism
    pub count: usize,

    /// Unacknowledged deliveries allowed per consumer channel
    pub prefetch: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 0,
            prefetch: 4,
        }
    }
}

impl WorkerConfig {
    /// Resolved pool size.
    pub fn pool_size(&self) -> usize {
        if self.count > 0 {
            self.count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Thumbnail generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Initial thumbnail size in pixels (longest edge, live-updated afterwards)
    pub size: u32,

    /// JPEG quality (1-100)
    pub quality: u8,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            size: 256,
            quality: 85,
        }
    }
}

/// Normalized analysis image settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Longest edge of the grayscale analysis image
    pub size: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { size: 256 }
    }
}

/// Resource limits to protect against problematic inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum source file size in megabytes
    pub max_file_size_mb: u64,

    /// Maximum image dimension (width or height)
    pub max_image_dimension: u32,

    /// Decode timeout in milliseconds
    pub decode_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 100,
            max_image_dimension: 20000,
            decode_timeout_ms: 10000,
        }
    }
}

/// Queue and exchange naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Logical name -> configured physical name
    pub names: BTreeMap<String, String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            names: names::ALL
                .iter()
                .map(|name| (name.to_string(), name.to_string()))
                .collect(),
        }
    }
}

/// Blob storage locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for source and analysis buckets; in-memory when unset
    pub blob_root: Option<PathBuf>,

    /// Root of the sharded thumbnail tree; in-memory when unset
    pub thumbnail_root: Option<PathBuf>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Log format (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
