//! MiniCloud Core - single-node object storage
//!
//! Objects are whole byte blobs addressed by a string key:
//! - blobs live in a content store (one file per key, commit-by-rename)
//! - size, SHA-256 integrity tag and timestamps live in a SQLite index
//! - an object exists if and only if it has an index entry

pub mod error;
pub mod key;
pub mod locks;
pub mod service;
pub mod storage;

pub use error::{ErrorKind, MiniCloudError, Result};
pub use key::{MAX_KEY_LEN, normalize_key};
pub use locks::{KeyGuard, KeyLocks};
pub use service::{Consistency, ObjectMeta, ObjectService, ObjectServiceOptions, PutObjectResult};
pub use storage::{
    BlobStat, ContentStore, FsContentStore, HashingWriter, IndexEntry, MemoryContentStore,
    MetadataIndex, PutBlobResult, SqliteMetadataIndex, compute_hash,
};
