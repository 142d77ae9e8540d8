//! Pipeline stages and the machinery they share.
//!
//! - **dispatch**: consumer loop that settles deliveries from handler results
//! - **loader**: walks anchor roots and publishes load jobs
//! - **preprocess**: thumbnails and normalized analysis images
//! - **hash_worker**: digest and perceptual hash consumers
//! - **sink**: the single writer of image records
//! - **janitor**: removes thumbnails no record references
//! - **decode**, **thumbnail**, **hash**, **discovery**: per-image building blocks
//! - **rate_limit**: token bucket for loader publication

pub mod decode;
pub mod discovery;
pub mod dispatch;
pub mod hash;
pub mod hash_worker;
pub mod janitor;
pub mod loader;
pub mod preprocess;
pub mod rate_limit;
pub mod sink;
pub mod thumbnail;

use std::sync::Arc;

use crate::broker::Publisher;
use crate::codec::Codec;
use crate::store::{Buckets, MetadataStore};

// Re-exports for convenient access
pub use decode::{DecodedImage, ImageDecoder};
pub use discovery::{DiscoveredFile, FileDiscovery};
pub use dispatch::{Disposition, MessageHandler, StagePool, StageStats};
pub use hash::Hasher;
pub use hash_worker::{HashWorker, WorkerKind};
pub use janitor::{Janitor, SweepStats};
pub use loader::{Loader, ThumbnailRequestHandler, WalkStats};
pub use preprocess::Preprocessor;
pub use rate_limit::RateLimiter;
pub use sink::PersistenceSink;
pub use thumbnail::ThumbnailGenerator;

/// Collaborators every stage needs.
#[derive(Clone)]
pub struct StageContext {
    /// Encoding for every message the stage reads or writes
    pub codec: Arc<dyn Codec>,
    /// Where follow-up messages go
    pub publisher: Arc<dyn Publisher>,
    pub buckets: Buckets,
    pub metadata: Arc<dyn MetadataStore>,
}
