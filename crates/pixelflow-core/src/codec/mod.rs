//! Wire encodings for pipeline messages.
//!
//! Two generations coexist:
//! - **structured**: JSON bodies with optional-field-safe decoding
//! - **legacy**: string headers plus a packed binary body
//!
//! Both implement [`Codec`]; a deployment picks one through
//! `general.codec` and every stage uses the same instance.

pub mod id;
pub mod legacy;
pub mod structured;

pub use id::{decode_id, encode_id};
pub use legacy::{decode_hash_message, HashMessage, HashMessageBuilder, LegacyCodec};
pub use structured::StructuredCodec;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::Message;
use crate::error::CodecError;
use crate::types::{ImagePath, LoadJob, PersistenceUpdate};

/// Header keys of the legacy format.
pub mod headers {
    pub const ANCHOR: &str = "anchor";
    pub const PATH: &str = "path";
    pub const HASH_ALGO: &str = "hash-algo";
    pub const CUSTOM_HASH_ALGO: &str = "cust-hash-algo";
    pub const THUMBNAIL_FOUND: &str = "thumbnail-found";
    pub const THUMBNAIL_SIZE: &str = "tn-size";
    pub const LOADER_COMMAND: &str = "loader-command";
    /// Set by the structured codec only
    pub const CONTENT_TYPE: &str = "content-type";
}

/// Message encoding generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    #[default]
    Structured,
    Legacy,
}

impl Generation {
    /// Codec implementing this generation.
    pub fn codec(self) -> Arc<dyn Codec> {
        match self {
            Generation::Structured => Arc::new(StructuredCodec),
            Generation::Legacy => Arc::new(LegacyCodec),
        }
    }
}

/// Encodes and decodes every message family.
pub trait Codec: Send + Sync {
    fn generation(&self) -> Generation;

    fn encode_job(&self, job: &LoadJob) -> Result<Message, CodecError>;
    fn decode_job(&self, message: &Message) -> Result<LoadJob, CodecError>;

    fn encode_update(&self, update: &PersistenceUpdate) -> Result<Message, CodecError>;
    fn decode_update(&self, message: &Message) -> Result<PersistenceUpdate, CodecError>;

    fn encode_path(&self, path: &ImagePath) -> Result<Message, CodecError>;
    fn decode_path(&self, message: &Message) -> Result<ImagePath, CodecError>;
}
