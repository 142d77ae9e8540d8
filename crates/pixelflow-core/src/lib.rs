//! Pixelflow Core - broker-coordinated image ingestion.
//!
//! Pixelflow walks file trees, computes content digests, perceptual hashes,
//! and thumbnails, and records the results in a metadata store. Every stage
//! is a queue consumer and stages talk only through messages.
//!
//! # Architecture
//!
//! ```text
//! Loader ─(loader-command)→ files → Preprocessor ─┬→ file-digests      → Digest worker     ─┐
//!                                                 ├→ file-preprocessed → Perceptual worker ─┤
//!                                                 └─────────────────────────────────────────┴→ persistence → Sink
//! ```
//!
//! Only the sink writes hashes and thumbnail descriptors. Messages are
//! encoded by one of two codec generations (see [`codec`]).
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pixelflow_core::{Config, MemoryMetadataStore, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> pixelflow_core::Result<()> {
//!     let config = Config::load()?;
//!     let mut pipeline = Pipeline::new(config, Arc::new(MemoryMetadataStore::new()))?;
//!     pipeline.start_workers()?;
//!     let stats = pipeline.loader().walk_all().await;
//!     pipeline.wait_idle(std::time::Duration::from_secs(60)).await;
//!     pipeline.shutdown().await;
//!     println!("Published {} jobs", stats.published);
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod algorithm;
pub mod broker;
pub mod codec;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod pipeline;
pub mod runtime;
pub mod store;
pub mod topology;
pub mod types;

// Re-exports for convenient access
pub use algorithm::Algorithm;
pub use broker::{Broker, Connection, Destination, Message, Publisher};
pub use codec::{Codec, Generation};
pub use config::{Config, Environment};
pub use dynamic::{ConfigStore, DynamicCell, MemoryConfigStore};
pub use error::{
    BrokerError, CodecError, ConfigError, PipelineError, PipelineResult, PixelflowError, Result,
    StoreError, TopologyError,
};
pub use pipeline::{Disposition, Janitor, Loader, SweepStats, WalkStats};
pub use runtime::Pipeline;
pub use store::{BlobStore, Buckets, MemoryMetadataStore, MetadataStore};
pub use topology::Topology;
pub use types::{ImagePath, ImageRecord, LoadJob, PersistenceUpdate, UpdateKind};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
