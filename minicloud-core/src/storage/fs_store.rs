use crate::error::{MiniCloudError, Result};
use crate::key::normalize_key;
use crate::storage::content_store::{BlobStat, ContentStore, PutBlobResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use ulid::Ulid;

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const COMMIT_ATTEMPTS: usize = 2;

/// Removes a staging file when dropped unless it was renamed into place.
/// Covers error returns as well as a `put` future dropped mid-stream.
struct StagingFile {
    path: PathBuf,
    committed: bool,
}

impl StagingFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(&mut self) {
        self.committed = true;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Discarded staging file {:?}", self.path),
            Err(error) if error.kind() == IoErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!("Failed to remove staging file {:?}: {}", self.path, error)
            }
        }
    }
}

/// FsContentStore keeps one file per key under `{root}/objects/{key}`.
///
/// Incoming bytes are staged in `{root}/tmp/` and renamed into place only
/// after the whole stream has been written and synced.
pub struct FsContentStore {
    base_path: PathBuf,
}

impl FsContentStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let store = Self { base_path };
        std::fs::create_dir_all(store.objects_dir())?;
        std::fs::create_dir_all(store.staging_dir())?;
        store.clear_staging()?;
        Ok(store)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    fn staging_dir(&self) -> PathBuf {
        self.base_path.join("tmp")
    }

    /// Resolve the on-disk location of a key.
    pub fn blob_path(&self, key: &str) -> Result<PathBuf> {
        let normalized = normalize_key(key)?;
        let objects_dir = self.objects_dir();
        let path = normalized
            .split('/')
            .fold(objects_dir.clone(), |path, component| path.join(component));

        if !path.starts_with(&objects_dir) || path == objects_dir {
            return Err(MiniCloudError::InvalidKey(format!(
                "key resolves outside the storage root: {}",
                key
            )));
        }

        Ok(path)
    }

    // Leftovers from writes interrupted by a crash; never visible to readers.
    fn clear_staging(&self) -> Result<()> {
        let mut removed = 0usize;
        for entry in std::fs::read_dir(self.staging_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} stale staging files", removed);
        }
        Ok(())
    }

    async fn stage(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        staging_path: &Path,
    ) -> Result<(u64, String)> {
        let mut file = fs::File::create(staging_path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            total += n as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok((total, hex::encode(hasher.finalize())))
    }

    async fn commit(&self, staging_path: &Path, blob_path: &Path) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(parent) = blob_path.parent() {
                fs::create_dir_all(parent).await?;
            }

            // A concurrent delete may prune the parent between the two calls.
            match fs::rename(staging_path, blob_path).await {
                Ok(()) => return Ok(()),
                Err(error) if error.kind() == IoErrorKind::NotFound && attempt < COMMIT_ATTEMPTS => {
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn prune_empty_parents(&self, blob_path: &Path) {
        let objects_dir = self.objects_dir();
        let mut current = blob_path.parent();

        while let Some(dir) = current {
            if dir == objects_dir || !dir.starts_with(&objects_dir) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PutBlobResult> {
        let blob_path = self.blob_path(key)?;
        let mut staging =
            StagingFile::new(self.staging_dir().join(format!("{}.tmp", Ulid::new())));

        let (bytes_written, sha256) = self.stage(reader, staging.path()).await?;
        self.commit(staging.path(), &blob_path).await?;
        staging.disarm();

        tracing::debug!("Stored blob {} ({} bytes, sha256 {})", key, bytes_written, sha256);

        Ok(PutBlobResult {
            bytes_written,
            sha256,
        })
    }

    async fn get(&self, key: &str, writer: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        let blob_path = self.blob_path(key)?;

        let mut file = match fs::File::open(&blob_path).await {
            Ok(file) => file,
            Err(error) if error.kind() == IoErrorKind::NotFound => {
                return Err(MiniCloudError::NotFound(key.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        if !file.metadata().await?.is_file() {
            return Err(MiniCloudError::NotFound(key.to_string()));
        }

        let copied = tokio::io::copy(&mut file, writer).await?;
        writer.flush().await?;
        Ok(copied)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let blob_path = self.blob_path(key)?;

        match fs::metadata(&blob_path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(MiniCloudError::NotFound(key.to_string())),
            Err(error) if error.kind() == IoErrorKind::NotFound => {
                return Err(MiniCloudError::NotFound(key.to_string()));
            }
            Err(error) => return Err(error.into()),
        }

        match fs::remove_file(&blob_path).await {
            Ok(()) => {}
            Err(error) if error.kind() == IoErrorKind::NotFound => {
                return Err(MiniCloudError::NotFound(key.to_string()));
            }
            Err(error) => return Err(error.into()),
        }

        self.prune_empty_parents(&blob_path).await;
        tracing::debug!("Deleted blob {}", key);
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<BlobStat> {
        let blob_path = self.blob_path(key)?;

        match fs::metadata(&blob_path).await {
            Ok(meta) if meta.is_file() => Ok(BlobStat::present(meta.len())),
            Ok(_) => Ok(BlobStat::missing()),
            Err(error) if error.kind() == IoErrorKind::NotFound => Ok(BlobStat::missing()),
            Err(error) => Err(error.into()),
        }
    }
}
