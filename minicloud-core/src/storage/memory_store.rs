use crate::error::{MiniCloudError, Result};
use crate::key::normalize_key;
use crate::storage::content_store::{BlobStat, ContentStore, PutBlobResult, compute_hash};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;

/// Process-local content store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PutBlobResult> {
        let key = normalize_key(key)?;

        // Buffer fully before touching the map so a failed read leaves the old blob.
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let result = PutBlobResult {
            bytes_written: data.len() as u64,
            sha256: compute_hash(&data),
        };
        self.blobs.write().await.insert(key, Bytes::from(data));
        Ok(result)
    }

    async fn get(&self, key: &str, writer: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        let key = normalize_key(key)?;
        let data = self
            .blobs
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| MiniCloudError::NotFound(key.clone()))?;

        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize_key(key)?;
        match self.blobs.write().await.remove(&key) {
            Some(_) => Ok(()),
            None => Err(MiniCloudError::NotFound(key)),
        }
    }

    async fn stat(&self, key: &str) -> Result<BlobStat> {
        let key = normalize_key(key)?;
        Ok(self
            .blobs
            .read()
            .await
            .get(&key)
            .map(|data| BlobStat::present(data.len() as u64))
            .unwrap_or_else(BlobStat::missing))
    }
}
