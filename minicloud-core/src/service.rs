use crate::error::{MiniCloudError, Result};
use crate::key::normalize_key;
use crate::locks::{KeyGuard, KeyLocks};
use crate::storage::{ContentStore, HashingWriter, IndexEntry, MetadataIndex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub integrity_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<IndexEntry> for ObjectMeta {
    fn from(entry: IndexEntry) -> Self {
        Self {
            key: entry.key,
            size: entry.size,
            integrity_tag: entry.integrity_tag,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutObjectResult {
    pub key: String,
    pub size: u64,
    pub integrity_tag: String,
}

/// How the content store and the metadata index agree on one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Consistency {
    Consistent { size: u64 },
    Absent,
    /// Blob committed without an index entry, typically after a partial write.
    OrphanBlob { stored_size: u64 },
    /// Index entry whose blob is gone.
    MissingBlob { indexed_size: u64 },
    SizeMismatch { indexed_size: u64, stored_size: u64 },
    /// Stored bytes no longer hash to the indexed tag: corruption in place,
    /// or a same-size overwrite whose index update failed.
    TagMismatch { indexed_tag: String, stored_tag: String },
}

impl Consistency {
    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent { .. } | Self::Absent)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObjectServiceOptions {
    /// Serialize put and delete calls that target the same key.
    pub serialize_same_key: bool,
}

impl Default for ObjectServiceOptions {
    fn default() -> Self {
        Self {
            serialize_same_key: true,
        }
    }
}

/// Object operations over a content store and a metadata index.
///
/// Put commits content before metadata and delete removes content before
/// metadata, so the index never names an object whose bytes were never
/// written. The reverse mismatch (bytes without an index entry) is reported
/// as [`MiniCloudError::PartialWrite`] and can be found later with
/// [`ObjectService::verify`]. Nothing is rolled back or retried.
#[derive(Clone)]
pub struct ObjectService {
    content: Arc<dyn ContentStore>,
    index: Arc<dyn MetadataIndex>,
    locks: Option<Arc<KeyLocks>>,
}

impl ObjectService {
    pub fn new(content: Arc<dyn ContentStore>, index: Arc<dyn MetadataIndex>) -> Self {
        Self::with_options(content, index, ObjectServiceOptions::default())
    }

    pub fn with_options(
        content: Arc<dyn ContentStore>,
        index: Arc<dyn MetadataIndex>,
        options: ObjectServiceOptions,
    ) -> Self {
        let locks = options
            .serialize_same_key
            .then(|| Arc::new(KeyLocks::new()));

        Self {
            content,
            index,
            locks,
        }
    }

    async fn lock(&self, key: &str) -> Option<KeyGuard> {
        match &self.locks {
            Some(locks) => Some(locks.lock(key).await),
            None => None,
        }
    }

    pub async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PutObjectResult> {
        let key = normalize_key(key)?;
        let guard = self.lock(&key).await;

        let stored = self.content.put(&key, reader).await?;

        // The blob is committed. The index update runs on its own task so a
        // caller that stops waiting cannot leave it half done; the key lock
        // is held until the update finishes.
        let index = Arc::clone(&self.index);
        let upsert_key = key.clone();
        let size = stored.bytes_written;
        let tag = stored.sha256.clone();
        let upsert = tokio::spawn(async move {
            let result = index.upsert(&upsert_key, size, Some(&tag)).await;
            drop(guard);
            result
        });
        let upserted = match upsert.await {
            Ok(result) => result,
            Err(error) => Err(MiniCloudError::Internal(format!(
                "index update task failed: {}",
                error
            ))),
        };

        if let Err(error) = upserted {
            tracing::warn!(
                "Blob committed but index upsert failed. key={} size={} error={}",
                key,
                stored.bytes_written,
                error
            );
            return Err(MiniCloudError::PartialWrite {
                key,
                size: stored.bytes_written,
                integrity_tag: stored.sha256,
                source: Box::new(error),
            });
        }

        tracing::debug!("Put object {} ({} bytes)", key, stored.bytes_written);
        Ok(PutObjectResult {
            key,
            size: stored.bytes_written,
            integrity_tag: stored.sha256,
        })
    }

    /// Stream the object's bytes. Reads the content store directly, so a
    /// blob left behind by a partial write is served even though `head`
    /// reports it as missing.
    pub async fn get(&self, key: &str, writer: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        let key = normalize_key(key)?;
        self.content.get(&key, writer).await
    }

    /// Metadata only; never touches the content store.
    pub async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let key = normalize_key(key)?;
        Ok(self.index.lookup(&key).await?.into())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize_key(key)?;
        let _guard = self.lock(&key).await;

        let blob_removed = match self.content.delete(&key).await {
            Ok(()) => true,
            Err(error) if error.is_not_found() => false,
            Err(error) => return Err(error),
        };

        match self.index.remove(&key).await {
            Ok(()) => {
                if !blob_removed {
                    tracing::warn!("Removed index entry for {} whose blob was already gone", key);
                }
                tracing::debug!("Deleted object {}", key);
                Ok(())
            }
            Err(error) if error.is_not_found() => {
                if blob_removed {
                    tracing::warn!("Removed orphan blob {} that had no index entry", key);
                    Ok(())
                } else {
                    Err(MiniCloudError::NotFound(key))
                }
            }
            Err(error) => {
                tracing::warn!(
                    "Index removal failed after blob removal. key={} blob_removed={} error={}",
                    key,
                    blob_removed,
                    error
                );
                Err(error)
            }
        }
    }

    /// Compare the stored blob against the index entry: presence, size and,
    /// when the entry carries one, the integrity tag. Tag checks re-read the
    /// whole blob.
    pub async fn verify(&self, key: &str) -> Result<Consistency> {
        let key = normalize_key(key)?;

        let entry = match self.index.lookup(&key).await {
            Ok(entry) => Some(entry),
            Err(error) if error.is_not_found() => None,
            Err(error) => return Err(error),
        };
        let stat = self.content.stat(&key).await?;

        let consistency = match (entry, stat.exists) {
            (None, false) => Consistency::Absent,
            (None, true) => Consistency::OrphanBlob {
                stored_size: stat.size,
            },
            (Some(entry), false) => Consistency::MissingBlob {
                indexed_size: entry.size,
            },
            (Some(entry), true) if entry.size != stat.size => Consistency::SizeMismatch {
                indexed_size: entry.size,
                stored_size: stat.size,
            },
            (Some(entry), true) => self.check_integrity(&key, entry).await?,
        };

        if !consistency.is_consistent() {
            tracing::warn!("Inconsistent object {}: {:?}", key, consistency);
        }
        Ok(consistency)
    }

    async fn check_integrity(&self, key: &str, entry: IndexEntry) -> Result<Consistency> {
        let Some(indexed_tag) = entry.integrity_tag else {
            return Ok(Consistency::Consistent { size: entry.size });
        };

        let mut sink = HashingWriter::new();
        match self.content.get(key, &mut sink).await {
            Ok(_) => {}
            // Deleted between stat and read.
            Err(error) if error.is_not_found() => {
                return Ok(Consistency::MissingBlob {
                    indexed_size: entry.size,
                });
            }
            Err(error) => return Err(error),
        }

        if sink.bytes_written() != entry.size {
            return Ok(Consistency::SizeMismatch {
                indexed_size: entry.size,
                stored_size: sink.bytes_written(),
            });
        }

        let stored_tag = sink.finalize();
        if stored_tag == indexed_tag {
            Ok(Consistency::Consistent { size: entry.size })
        } else {
            Ok(Consistency::TagMismatch {
                indexed_tag,
                stored_tag,
            })
        }
    }

    pub async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectMeta>> {
        let prefix = prefix.trim_start_matches('/');
        let entries = self.index.list(prefix, limit).await?;
        Ok(entries.into_iter().map(ObjectMeta::from).collect())
    }
}
