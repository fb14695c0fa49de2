use async_trait::async_trait;
use minicloud_core::{
    BlobStat, Consistency, ContentStore, ErrorKind, FsContentStore, IndexEntry, MetadataIndex,
    MiniCloudError, ObjectService, PutBlobResult, Result, SqliteMetadataIndex, compute_hash,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};

/// Content store that can be told to fail writes before anything is staged.
struct FlakyContent {
    inner: FsContentStore,
    fail_put: AtomicBool,
}

#[async_trait]
impl ContentStore for FlakyContent {
    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PutBlobResult> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(MiniCloudError::Io(std::io::Error::other("disk full")));
        }
        self.inner.put(key, reader).await
    }

    async fn get(&self, key: &str, writer: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        self.inner.get(key, writer).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn stat(&self, key: &str) -> Result<BlobStat> {
        self.inner.stat(key).await
    }
}

/// Index that can be told to fail upserts or removals, or to stall upserts.
struct FlakyIndex {
    inner: SqliteMetadataIndex,
    fail_upsert: AtomicBool,
    fail_remove: AtomicBool,
    upsert_delay_ms: AtomicU64,
}

#[async_trait]
impl MetadataIndex for FlakyIndex {
    async fn upsert(&self, key: &str, size: u64, integrity_tag: Option<&str>) -> Result<()> {
        let delay = self.upsert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_upsert.load(Ordering::SeqCst) {
            return Err(MiniCloudError::Database(rusqlite_busy()));
        }
        self.inner.upsert(key, size, integrity_tag).await
    }

    async fn lookup(&self, key: &str) -> Result<IndexEntry> {
        self.inner.lookup(key).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(MiniCloudError::Database(rusqlite_busy()));
        }
        self.inner.remove(key).await
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<IndexEntry>> {
        self.inner.list(prefix, limit).await
    }
}

fn rusqlite_busy() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    )
}

struct Harness {
    _dir: TempDir,
    root: std::path::PathBuf,
    content: Arc<FlakyContent>,
    index: Arc<FlakyIndex>,
    service: ObjectService,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");

    let content = Arc::new(FlakyContent {
        inner: FsContentStore::new(root.clone()).unwrap(),
        fail_put: AtomicBool::new(false),
    });
    let index = Arc::new(FlakyIndex {
        inner: SqliteMetadataIndex::new(dir.path().join("meta.db")).unwrap(),
        fail_upsert: AtomicBool::new(false),
        fail_remove: AtomicBool::new(false),
        upsert_delay_ms: AtomicU64::new(0),
    });
    let service = ObjectService::new(content.clone(), index.clone());

    Harness {
        _dir: dir,
        root,
        content,
        index,
        service,
    }
}

async fn read_all(service: &ObjectService, key: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let n = service.get(key, &mut out).await?;
    assert_eq!(n, out.len() as u64);
    Ok(out)
}

#[tokio::test]
async fn put_then_get_returns_same_bytes() {
    let h = harness();
    let large: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let payloads: Vec<(&str, Vec<u8>)> = vec![
        ("empty", Vec::new()),
        ("small.txt", b"hello world".to_vec()),
        ("nested/deeper/large.bin", large),
    ];

    for (key, payload) in &payloads {
        let put = h.service.put(key, &mut &payload[..]).await.unwrap();
        assert_eq!(put.size, payload.len() as u64);
        assert_eq!(put.integrity_tag, compute_hash(payload));
    }

    for (key, payload) in &payloads {
        assert_eq!(&read_all(&h.service, key).await.unwrap(), payload);
        let meta = h.service.head(key).await.unwrap();
        assert_eq!(meta.size, payload.len() as u64);
        assert_eq!(meta.integrity_tag, Some(compute_hash(payload)));
    }
}

#[tokio::test]
async fn delete_makes_get_and_head_not_found() {
    let h = harness();
    h.service.put("doc", &mut &b"content"[..]).await.unwrap();
    h.service.delete("doc").await.unwrap();

    assert_eq!(
        read_all(&h.service, "doc").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        h.service.head("doc").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn delete_of_unknown_key_is_not_found() {
    let h = harness();
    let err = h.service.delete("never-created").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    h.service.put("once", &mut &b"x"[..]).await.unwrap();
    h.service.delete("once").await.unwrap();
    assert_eq!(
        h.service.delete("once").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn overwrite_replaces_bytes_and_keeps_one_entry() {
    let h = harness();
    h.service.put("k", &mut &b"first version"[..]).await.unwrap();
    let created = h.service.head("k").await.unwrap().created_at;

    h.service.put("k", &mut &b"v2"[..]).await.unwrap();

    assert_eq!(read_all(&h.service, "k").await.unwrap(), b"v2");
    let meta = h.service.head("k").await.unwrap();
    assert_eq!(meta.size, 2);
    assert_eq!(meta.created_at, created);

    let listed = h.service.list("", 100).await.unwrap();
    assert_eq!(listed.iter().filter(|m| m.key == "k").count(), 1);
}

#[tokio::test]
async fn traversal_keys_never_escape_root() {
    let h = harness();
    for key in ["../escape", "a/../../escape", "/../escape"] {
        let err = h.service.put(key, &mut &b"p"[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKey, "key {:?}", key);
    }

    let parent = h.root.parent().unwrap();
    assert!(!parent.join("escape").exists());
    assert!(h.service.list("", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_content_write_leaves_no_object() {
    let h = harness();
    h.content.fail_put.store(true, Ordering::SeqCst);

    let err = h.service.put("k", &mut &b"data"[..]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);

    assert_eq!(h.service.head("k").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        read_all(&h.service, "k").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(h.service.verify("k").await.unwrap(), Consistency::Absent);
}

#[tokio::test]
async fn failed_content_write_keeps_previous_object() {
    let h = harness();
    h.service.put("k", &mut &b"original"[..]).await.unwrap();

    h.content.fail_put.store(true, Ordering::SeqCst);
    assert!(h.service.put("k", &mut &b"replacement"[..]).await.is_err());

    assert_eq!(read_all(&h.service, "k").await.unwrap(), b"original");
    assert_eq!(h.service.head("k").await.unwrap().size, 8);
}

#[tokio::test]
async fn index_failure_after_content_write_is_partial_write() {
    let h = harness();
    h.index.fail_upsert.store(true, Ordering::SeqCst);

    let err = h.service.put("orphan", &mut &b"bytes"[..]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialWrite);
    match &err {
        MiniCloudError::PartialWrite {
            key,
            size,
            integrity_tag,
            ..
        } => {
            assert_eq!(key, "orphan");
            assert_eq!(*size, 5);
            assert_eq!(integrity_tag, &compute_hash(b"bytes"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // Head consults only the index; get serves the committed blob.
    assert_eq!(
        h.service.head("orphan").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(read_all(&h.service, "orphan").await.unwrap(), b"bytes");
    assert_eq!(
        h.service.verify("orphan").await.unwrap(),
        Consistency::OrphanBlob { stored_size: 5 }
    );

    // Delete cleans up the orphan blob and reports success.
    h.index.fail_upsert.store(false, Ordering::SeqCst);
    h.service.delete("orphan").await.unwrap();
    assert_eq!(h.service.verify("orphan").await.unwrap(), Consistency::Absent);
}

#[tokio::test]
async fn delete_tolerates_missing_blob() {
    let h = harness();
    h.service.put("k", &mut &b"abc"[..]).await.unwrap();
    h.content.inner.delete("k").await.unwrap();

    assert_eq!(
        h.service.verify("k").await.unwrap(),
        Consistency::MissingBlob { indexed_size: 3 }
    );
    assert_eq!(read_all(&h.service, "k").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(h.service.head("k").await.unwrap().size, 3);

    h.service.delete("k").await.unwrap();
    assert_eq!(h.service.head("k").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn index_removal_failure_reports_io() {
    let h = harness();
    h.service.put("k", &mut &b"abc"[..]).await.unwrap();
    h.index.fail_remove.store(true, Ordering::SeqCst);

    let err = h.service.delete("k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);

    assert_eq!(read_all(&h.service, "k").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        h.service.verify("k").await.unwrap(),
        Consistency::MissingBlob { indexed_size: 3 }
    );

    h.index.fail_remove.store(false, Ordering::SeqCst);
    h.service.delete("k").await.unwrap();
    assert_eq!(h.service.verify("k").await.unwrap(), Consistency::Absent);
}

#[tokio::test]
async fn size_mismatch_is_detected() {
    let h = harness();
    h.service.put("k", &mut &b"abc"[..]).await.unwrap();
    h.index.inner.upsert("k", 99, None).await.unwrap();

    assert_eq!(
        h.service.verify("k").await.unwrap(),
        Consistency::SizeMismatch {
            indexed_size: 99,
            stored_size: 3
        }
    );
}

#[tokio::test]
async fn corrupted_blob_is_tag_mismatch() {
    let h = harness();
    h.service.put("k", &mut &b"hello"[..]).await.unwrap();
    assert_eq!(
        h.service.verify("k").await.unwrap(),
        Consistency::Consistent { size: 5 }
    );

    std::fs::write(h.root.join("objects").join("k"), b"HELLO").unwrap();

    let consistency = h.service.verify("k").await.unwrap();
    assert!(!consistency.is_consistent());
    assert_eq!(
        consistency,
        Consistency::TagMismatch {
            indexed_tag: compute_hash(b"hello"),
            stored_tag: compute_hash(b"HELLO"),
        }
    );
}

#[tokio::test]
async fn same_size_overwrite_with_failed_upsert_is_tag_mismatch() {
    let h = harness();
    h.service.put("k", &mut &b"hello"[..]).await.unwrap();

    h.index.fail_upsert.store(true, Ordering::SeqCst);
    let err = h.service.put("k", &mut &b"world"[..]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialWrite);

    // Index still describes the old bytes; sizes agree, tags do not.
    assert_eq!(h.service.head("k").await.unwrap().size, 5);
    assert_eq!(
        h.service.verify("k").await.unwrap(),
        Consistency::TagMismatch {
            indexed_tag: compute_hash(b"hello"),
            stored_tag: compute_hash(b"world"),
        }
    );

    // A successful retry repairs the entry.
    h.index.fail_upsert.store(false, Ordering::SeqCst);
    h.service.put("k", &mut &b"world"[..]).await.unwrap();
    assert_eq!(
        h.service.verify("k").await.unwrap(),
        Consistency::Consistent { size: 5 }
    );
}

#[tokio::test]
async fn untagged_entry_is_checked_by_size_only() {
    let h = harness();
    h.service.put("k", &mut &b"abc"[..]).await.unwrap();
    h.index.inner.upsert("k", 3, None).await.unwrap();

    assert_eq!(
        h.service.verify("k").await.unwrap(),
        Consistency::Consistent { size: 3 }
    );
}

#[tokio::test]
async fn abandoned_put_still_updates_index() {
    let h = harness();
    h.index.upsert_delay_ms.store(1500, Ordering::SeqCst);

    // The caller gives up while the index update is in flight.
    let outcome = tokio::time::timeout(
        Duration::from_millis(300),
        h.service.put("k", &mut &b"payload"[..]),
    )
    .await;
    assert!(outcome.is_err());

    assert_eq!(read_all(&h.service, "k").await.unwrap(), b"payload");

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(h.service.head("k").await.unwrap().size, 7);
    assert_eq!(
        h.service.verify("k").await.unwrap(),
        Consistency::Consistent { size: 7 }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_to_distinct_keys() {
    let h = harness();
    let mut tasks = tokio::task::JoinSet::new();

    for i in 0..32u32 {
        let service = h.service.clone();
        tasks.spawn(async move {
            let key = format!("batch/object-{}", i);
            let payload = vec![i as u8; 1024 + i as usize];
            service.put(&key, &mut &payload[..]).await.unwrap();
            (key, payload)
        });
    }

    let mut written = Vec::new();
    while let Some(result) = tasks.join_next().await {
        written.push(result.unwrap());
    }
    assert_eq!(written.len(), 32);

    for (key, payload) in written {
        assert_eq!(read_all(&h.service, &key).await.unwrap(), payload);
        assert_eq!(h.service.head(&key).await.unwrap().size, payload.len() as u64);
    }
    assert_eq!(h.service.list("batch/", 100).await.unwrap().len(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_put_and_delete_on_one_key_stay_consistent() {
    let h = harness();
    let mut tasks = tokio::task::JoinSet::new();

    for i in 0..40u32 {
        let service = h.service.clone();
        tasks.spawn(async move {
            if i % 2 == 0 {
                let payload = vec![b'x'; i as usize + 1];
                service.put("contended", &mut &payload[..]).await.map(|_| ())
            } else {
                match service.delete("contended").await {
                    Err(error) if error.is_not_found() => Ok(()),
                    other => other,
                }
            }
        });
    }

    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    assert!(h.service.verify("contended").await.unwrap().is_consistent());
}
