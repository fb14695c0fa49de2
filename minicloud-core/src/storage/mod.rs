//! Storage modules for MiniCloud
//!
//! Provides blob content storage and the metadata index kept beside it.

pub mod content_store;
pub mod fs_store;
pub mod memory_store;
pub mod metadata_index;

pub use content_store::{BlobStat, ContentStore, HashingWriter, PutBlobResult, compute_hash};
pub use fs_store::FsContentStore;
pub use memory_store::MemoryContentStore;
pub use metadata_index::{IndexEntry, MetadataIndex, SqliteMetadataIndex};
