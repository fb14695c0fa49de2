use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

/// Outcome of committing a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutBlobResult {
    pub bytes_written: u64,
    /// Hex encoded SHA-256 of the committed bytes.
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub exists: bool,
    pub size: u64,
}

impl BlobStat {
    pub fn missing() -> Self {
        Self {
            exists: false,
            size: 0,
        }
    }

    pub fn present(size: u64) -> Self {
        Self { exists: true, size }
    }
}

/// Durable byte storage addressed by key.
///
/// A store knows nothing about the metadata index. `put` must be atomic from
/// the point of view of a concurrent `get`: readers see either the previous
/// blob or the complete new one.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Drain `reader` into the blob for `key`, replacing any previous blob.
    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PutBlobResult>;

    /// Stream the stored blob into `writer`. On a mid-stream failure the
    /// writer may already hold a prefix of the blob.
    async fn get(&self, key: &str, writer: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64>;

    /// Remove the blob. Absent blobs are reported as `NotFound`.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn stat(&self, key: &str) -> Result<BlobStat>;
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Writer that keeps nothing but a running SHA-256 of what passes through.
/// Lets a stored blob be re-hashed through `ContentStore::get` without
/// buffering it.
#[derive(Default)]
pub struct HashingWriter {
    hasher: Sha256,
    bytes_written: u64,
}

impl HashingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Hex encoded digest, in the same form as [`compute_hash`].
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl AsyncWrite for HashingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.hasher.update(buf);
        self.bytes_written += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
