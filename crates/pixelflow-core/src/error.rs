//! Error types for the pixelflow pipeline.
//!
//! Errors are organized by layer. Stage errors (`PipelineError`) additionally
//! know how the dispatch loop must settle the message that caused them.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::dispatch::Disposition;

/// Top-level error type for pixelflow operations.
#[derive(Error, Debug)]
pub enum PixelflowError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Message encoding/decoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Queue topology errors
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Object store or metadata store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Stage processing errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// A required value is absent from the config store
    #[error("Missing required configuration value: {0}")]
    Missing(String),
}

/// Errors raised while building or parsing wire messages.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A required argument was absent (empty)
    #[error("Missing required argument: {0}")]
    MissingArgument(&'static str),

    /// Digest length does not match the algorithm's fixed output length
    #[error("Invalid digest length for {algorithm}: expected {expected} bytes, got {actual}")]
    InvalidDigestLength {
        algorithm: String,
        expected: usize,
        actual: usize,
    },

    /// Algorithm name has no entry in the digest length table
    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// A required header is absent
    #[error("Missing message header: {0}")]
    MissingHeader(&'static str),

    /// A header carries a value that cannot be parsed
    #[error("Invalid value for header {key}: {value}")]
    InvalidHeader { key: &'static str, value: String },

    /// The packed body length disagrees with the announced algorithms
    #[error("Body length mismatch: expected {expected} bytes, got {actual}")]
    BodyLength { expected: usize, actual: usize },

    /// An encoded identifier is not exactly 16 bytes
    #[error("Invalid identifier encoding: expected 16 bytes, got {0}")]
    InvalidIdentifier(usize),

    /// Structured body could not be (de)serialized
    #[error("Structured body error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Queue topology errors.
#[derive(Error, Debug)]
pub enum TopologyError {
    /// No physical name exists for the logical name
    #[error("Unknown queue or exchange: {0}")]
    UnknownQueue(String),
}

/// Errors reported by the embedded broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Queue does not exist (also returned by a failing passive declare)
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Exchange does not exist
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Re-declaration with different properties
    #[error("Precondition failed for {name}: {message}")]
    PreconditionFailed { name: String, message: String },

    /// The owning connection has been closed
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Object store and metadata store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Blob or record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Compare-and-set write lost against a concurrent writer
    #[error("Version conflict for {anchor}/{relative_path}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        anchor: String,
        relative_path: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Key cannot be mapped onto the store's layout
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Backing file system failure
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-message stage errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Source or intermediate artifact could not be fetched
    #[error("Fetch failed for {image_id}: {message}")]
    Fetch { image_id: Uuid, message: String },

    /// Image decoding failed
    #[error("Decode error for {image_id}: {message}")]
    Decode { image_id: Uuid, message: String },

    /// Operation timed out
    #[error("Timeout in {stage} stage for {image_id} after {timeout_ms}ms")]
    Timeout {
        image_id: Uuid,
        stage: String,
        timeout_ms: u64,
    },

    /// Image dimensions exceed limit
    #[error("Image too large: {image_id} ({width}x{height} > {max_dim})")]
    ImageTooLarge {
        image_id: Uuid,
        width: u32,
        height: u32,
        max_dim: u32,
    },

    /// Encoding a derived image failed
    #[error("Encode error for {image_id}: {message}")]
    Encode { image_id: Uuid, message: String },

    /// Request refers to a record the metadata store does not know
    #[error("No record for {anchor}/{relative_path}")]
    UnknownRecord {
        anchor: String,
        relative_path: String,
    },

    /// Anchor name has no configured root
    #[error("Unknown anchor: {0}")]
    UnknownAnchor(String),

    /// File system failure for a specific path
    #[error("IO error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed message payload
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Store read or write failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Publishing a follow-up message failed
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl PipelineError {
    /// How the dispatch loop settles a message whose handler failed with this error.
    ///
    /// Permanent per-message failures are dropped; store and broker failures
    /// stay un-acked so the broker redelivers them.
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::Fetch { .. }
            | PipelineError::UnknownRecord { .. }
            | PipelineError::UnknownAnchor(_) => Disposition::Ack,
            PipelineError::Decode { .. }
            | PipelineError::Timeout { .. }
            | PipelineError::ImageTooLarge { .. }
            | PipelineError::Encode { .. }
            | PipelineError::Codec(_) => Disposition::Reject,
            PipelineError::Io { .. } | PipelineError::Store(_) | PipelineError::Broker(_) => {
                Disposition::Requeue
            }
        }
    }
}

/// Convenience type alias for pixelflow results.
pub type Result<T> = std::result::Result<T, PixelflowError>;

/// Convenience type alias for stage-specific results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
