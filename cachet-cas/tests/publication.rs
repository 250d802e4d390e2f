use cachet_cas::{CasError, CommitOutcome, ContentStore, ContentStoreConfig, FsyncPolicy, WriteOptions};
use cachet_digest::{Algorithm, Integrity};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tempfile::tempdir;
use tokio::fs;
use tokio::io::{AsyncRead, ReadBuf};
use tracing_test::traced_test;

/// Reader that yields some bytes and then fails, like a dropped upload.
struct FailingReader {
    remaining: usize,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "source went away",
            )));
        }
        let n = self.remaining.min(buf.remaining()).min(1024);
        buf.put_slice(&vec![0xAB; n]);
        self.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

async fn store(dir: &std::path::Path) -> ContentStore {
    let config = ContentStoreConfig {
        fsync_policy: FsyncPolicy::Never,
        ..ContentStoreConfig::default()
    };
    ContentStore::new_with_config(dir, config).await.unwrap()
}

async fn tmp_entries(store: &ContentStore) -> usize {
    let mut entries = fs::read_dir(store.tmp_dir()).await.unwrap();
    let mut count = 0;
    while entries.next_entry().await.unwrap().is_some() {
        count += 1;
    }
    count
}

/// A stream that fails midway publishes nothing and leaves no temp file
#[tokio::test]
async fn test_failed_stream_leaves_no_trace() {
    let temp_dir = tempdir().unwrap();
    let store = store(temp_dir.path()).await;

    let result = store
        .write_stream(FailingReader { remaining: 10_000 }, WriteOptions::default())
        .await;

    assert!(matches!(result, Err(CasError::Io(_))));
    assert_eq!(tmp_entries(&store).await, 0);

    let would_be = Integrity::from_data(&[Algorithm::Blake3], &vec![0xAB; 10_000]);
    assert_eq!(store.has(&would_be).await.unwrap(), None);
}

/// A cancelled write future cleans up its temp file
#[tokio::test]
async fn test_cancelled_write_cleans_up() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(store(temp_dir.path()).await);

    let pending = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            // Never-ending source; the task is aborted while it is mid-write
            let reader = tokio::io::repeat(0x11);
            store.write_stream(reader, WriteOptions::default()).await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    pending.abort();
    let _ = pending.await;

    assert_eq!(tmp_entries(&store).await, 0);
}

/// Writing over a corrupt blob repairs it and says so in the logs
#[traced_test]
#[tokio::test]
async fn test_overwrite_of_corrupt_blob_is_logged() {
    let temp_dir = tempdir().unwrap();
    let store = store(temp_dir.path()).await;

    let data = b"self healing content";
    let first = store.write(data, WriteOptions::default()).await.unwrap();
    fs::write(store.content_path(first.integrity.strongest()), b"bitrot")
        .await
        .unwrap();

    let second = store.write(data, WriteOptions::default()).await.unwrap();
    assert_eq!(second.outcome, CommitOutcome::Replaced);
    assert!(logs_contain("Replacing corrupt content"));

    let read_back = store.read(&first.integrity, Some(data.len() as u64)).await.unwrap();
    assert_eq!(&read_back[..], data);
}

/// Identical content under many algorithms is addressed by the strongest
#[tokio::test]
async fn test_strongest_algorithm_addresses_blob() {
    let temp_dir = tempdir().unwrap();
    let store = store(temp_dir.path()).await;

    let opts = WriteOptions {
        algorithms: Some(vec![Algorithm::Sha256, Algorithm::Sha512]),
        ..WriteOptions::default()
    };
    let written = store.write(b"two hashes", opts).await.unwrap();

    assert_eq!(written.integrity.hashes().len(), 2);
    assert_eq!(written.integrity.pick_algorithm(), Algorithm::Sha512);

    let path = store.content_path(written.integrity.strongest());
    assert!(path.starts_with(store.content_dir().join("sha512")));
    assert!(fs::metadata(&path).await.is_ok());
}
