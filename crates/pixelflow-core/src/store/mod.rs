//! Storage seams: blob buckets and the metadata store.

pub mod blob;
pub mod metadata;

pub use blob::{ArtifactKind, BlobStore, Buckets, DirBlobStore, MemoryBlobStore, ShardedBlobStore};
pub use metadata::{MemoryMetadataStore, MetadataStore, Versioned};
