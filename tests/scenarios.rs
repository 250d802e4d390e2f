use cachet::{
    Algorithm, Cache, CacheConfig, CacheError, IndexBackend, Integrity, PutOptions, VerifyOptions,
};
use futures::TryStreamExt;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tokio::fs;
use tracing_test::traced_test;

async fn open(dir: &TempDir) -> Cache {
    let config = CacheConfig {
        fsync: false,
        ..CacheConfig::new(dir.path())
    };
    Cache::open(config).await.unwrap()
}

async fn blob_count(cache: &Cache) -> usize {
    let mut count = 0;
    let mut stack = vec![cache.content().content_dir()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_type().await.unwrap().is_dir() {
                stack.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    count
}

#[tokio::test]
async fn test_put_then_get() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;

    cache.put("k1", b"hello", PutOptions::default()).await.unwrap();
    let (data, entry) = cache.get("k1").await.unwrap();

    assert_eq!(&data[..], b"hello");
    assert_eq!(entry.size, 5);
    let expected = Integrity::from_data(&[Algorithm::Blake3], b"hello");
    assert_eq!(entry.integrity, Some(expected.clone()));
    assert_eq!(expected.check(&data), Some(Algorithm::Blake3));
}

#[traced_test]
#[tokio::test]
async fn test_corrupt_blob_fails_and_is_repaired() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;

    let entry = cache.put("k1", b"hello", PutOptions::default()).await.unwrap();
    let integrity = entry.integrity.unwrap();
    fs::write(cache.content().content_path(integrity.strongest()), b"jello")
        .await
        .unwrap();

    let err = cache.get("k1").await.unwrap_err();
    assert!(matches!(err, CacheError::IntegrityMismatch { .. }));
    assert!(err.is_corruption());
    assert!(logs_contain("Removing corrupt content"));
    assert!(cache.has("k1").await.unwrap().is_none());
    // The index entry itself is untouched
    assert!(cache.info("k1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_identical_puts_share_a_blob() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(open(&dir).await);

    let a = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.put("a", b"same payload", PutOptions::default()).await })
    };
    let b = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.put("b", b"same payload", PutOptions::default()).await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(a.integrity, b.integrity);
    let integrity = a.integrity.unwrap();
    assert_eq!(
        cache.content().content_path(integrity.strongest()),
        cache
            .content()
            .content_path(b.integrity.as_ref().unwrap().strongest())
    );
    assert_eq!(blob_count(&cache).await, 1);
}

#[tokio::test]
async fn test_verify_reclaims_orphan_and_keeps_referenced() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;

    cache.put("kept", b"referenced", PutOptions::default()).await.unwrap();
    cache
        .content()
        .write(b"orphaned", Default::default())
        .await
        .unwrap();

    let report = cache.verify(cache.verify_options()).await.unwrap();
    assert_eq!(report.reclaimed_count, 1);
    assert_eq!(report.verified_content, 1);
    assert_eq!(blob_count(&cache).await, 1);

    let last = cache.last_verified().await.unwrap();
    assert_eq!(last.timestamp_millis(), report.end_time.timestamp_millis());
}

#[tokio::test]
async fn test_duplicate_writes_make_one_blob() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;

    for i in 0..5 {
        cache
            .put(&format!("key-{i}"), b"duplicate", PutOptions::default())
            .await
            .unwrap();
    }
    cache.put("key-0", b"duplicate", PutOptions::default()).await.unwrap();

    assert_eq!(blob_count(&cache).await, 1);
    let entries: Vec<_> = cache.list().try_collect().await.unwrap();
    assert_eq!(entries.len(), 5);
}

#[tokio::test]
async fn test_delete_is_reference_aware() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;

    cache.put("k", b"shared", PutOptions::default()).await.unwrap();
    let entry = cache.put("k2", b"shared", PutOptions::default()).await.unwrap();
    let integrity = entry.integrity.unwrap();

    cache.delete("k").await.unwrap();
    cache.verify(VerifyOptions::default()).await.unwrap();
    assert!(cache.get("k").await.unwrap_err().is_not_found());
    let (data, _) = cache.get("k2").await.unwrap();
    assert_eq!(&data[..], b"shared");

    cache.delete("k2").await.unwrap();
    let report = cache.verify(VerifyOptions::default()).await.unwrap();
    assert_eq!(report.reclaimed_count, 1);
    assert!(cache.has_content(&integrity).await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_things_are_not_found() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;

    let err = cache.get("nope").await.unwrap_err();
    assert!(matches!(err, CacheError::NotFound(ref key) if key == "nope"));

    let unknown = Integrity::from_data(&[Algorithm::Sha256], b"never written");
    let err = cache.get_by_digest(&unknown).await.unwrap_err();
    assert!(matches!(err, CacheError::ContentNotFound(_)));
    assert!(err.is_not_found());
    assert!(cache.info("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_expected_integrity_and_size() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;

    let right = Integrity::from_data(&[Algorithm::Sha512], b"checked");
    let entry = cache
        .put("ok", b"checked", PutOptions::default().with_integrity(right.clone()))
        .await
        .unwrap();
    assert_eq!(entry.integrity, Some(right));

    let wrong = Integrity::from_data(&[Algorithm::Sha512], b"something else");
    let err = cache
        .put("bad", b"checked", PutOptions::default().with_integrity(wrong))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::IntegrityMismatch { .. }));

    let err = cache
        .put("short", b"checked", PutOptions::default().with_size(3))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::SizeMismatch { expected: 3, .. }));

    assert!(cache.info("bad").await.unwrap().is_none());
    assert!(cache.info("short").await.unwrap().is_none());
}

#[tokio::test]
async fn test_streaming_put_and_get() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;
    let payload = vec![42u8; 300_000];

    let entry = cache
        .put_stream(
            "big",
            &payload[..],
            PutOptions::default().with_metadata(serde_json::json!({"origin": "stream"})),
        )
        .await
        .unwrap();
    assert_eq!(entry.size, payload.len() as u64);

    let (mut reader, found) = cache.get_stream("big").await.unwrap();
    assert_eq!(found.metadata["origin"], "stream");
    let mut out = Vec::new();
    tokio::io::copy(&mut reader, &mut out).await.unwrap();
    reader.finish().await.unwrap();
    assert_eq!(out, payload);
}

#[tokio::test]
async fn test_delete_with_content_and_clear() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;

    let entry = cache.put("gone", b"bytes", PutOptions::default()).await.unwrap();
    cache.delete_with_content("gone").await.unwrap();
    assert!(cache
        .has_content(entry.integrity.as_ref().unwrap())
        .await
        .unwrap()
        .is_none());

    cache.put("a", b"1", PutOptions::default()).await.unwrap();
    cache.put("b", b"2", PutOptions::default()).await.unwrap();
    cache.clear().await.unwrap();
    let entries: Vec<_> = cache.list().try_collect().await.unwrap();
    assert!(entries.is_empty());
    assert_eq!(blob_count(&cache).await, 0);

    // Still usable afterwards
    cache.put("c", b"3", PutOptions::default()).await.unwrap();
    assert!(cache.has("c").await.unwrap().is_some());
}

#[tokio::test]
async fn test_memory_backend_survives_reopen() {
    let dir = tempdir().unwrap();
    let config = CacheConfig {
        fsync: false,
        index_backend: IndexBackend::Memory { snapshot_every: 1 },
        ..CacheConfig::new(dir.path())
    };

    {
        let cache = Cache::open(config.clone()).await.unwrap();
        cache.put("k", b"remembered", PutOptions::default()).await.unwrap();
        cache.put("gone", b"forgotten", PutOptions::default()).await.unwrap();
        cache.delete("gone").await.unwrap();
    }

    let cache = Cache::open(config).await.unwrap();
    let (data, _) = cache.get("k").await.unwrap();
    assert_eq!(&data[..], b"remembered");
    assert!(cache.info("gone").await.unwrap().is_none());
}

#[tokio::test]
async fn test_memoized_reads() {
    let dir = tempdir().unwrap();
    let config = CacheConfig {
        fsync: false,
        memoize: true,
        ..CacheConfig::new(dir.path())
    };
    let cache = Cache::open(config).await.unwrap();

    let entry = cache.put("k", b"in memory", PutOptions::default()).await.unwrap();
    let integrity = entry.integrity.clone().unwrap();

    // With the blob gone, memoized reads still succeed until cleared
    fs::remove_file(cache.content().content_path(integrity.strongest()))
        .await
        .unwrap();
    let (data, found) = cache.get("k").await.unwrap();
    assert_eq!(&data[..], b"in memory");
    assert_eq!(found, entry);
    assert_eq!(&cache.get_by_digest(&integrity).await.unwrap()[..], b"in memory");

    cache.clear_memoized().await;
    assert!(cache.get("k").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_per_put_memoize_override_serves_reads() {
    let dir = tempdir().unwrap();
    let cache = open(&dir).await;
    assert!(!cache.config().memoize);

    let opts = PutOptions {
        memoize: Some(true),
        ..PutOptions::default()
    };
    let entry = cache.put("hot", b"kept warm", opts.clone()).await.unwrap();
    let streamed = cache
        .put_stream("hot-stream", &b"streamed warm"[..], opts)
        .await
        .unwrap();

    for found in [&entry, &streamed] {
        let integrity = found.integrity.as_ref().unwrap();
        fs::remove_file(cache.content().content_path(integrity.strongest()))
            .await
            .unwrap();
    }

    let (data, _) = cache.get("hot").await.unwrap();
    assert_eq!(&data[..], b"kept warm");
    let (data, _) = cache.get("hot-stream").await.unwrap();
    assert_eq!(&data[..], b"streamed warm");

    // Plain puts on this cache are not memoized
    let cold = cache.put("cold", b"on disk", PutOptions::default()).await.unwrap();
    let integrity = cold.integrity.unwrap();
    fs::remove_file(cache.content().content_path(integrity.strongest()))
        .await
        .unwrap();
    assert!(cache.get("cold").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_repair_removes_only_the_failing_hash() {
    let dir = tempdir().unwrap();
    let config = CacheConfig {
        fsync: false,
        algorithms: vec![Algorithm::Sha256, Algorithm::Blake3],
        ..CacheConfig::new(dir.path())
    };
    let cache = Cache::open(config).await.unwrap();

    let entry = cache.put("k", b"two ways", PutOptions::default()).await.unwrap();
    let integrity = entry.integrity.clone().unwrap();
    let sha256 = integrity.hash_for(Algorithm::Sha256).unwrap().clone();
    let blake3 = integrity.hash_for(Algorithm::Blake3).unwrap().clone();

    // A second copy addressed by the weaker hash
    let opts = cachet::cas::WriteOptions {
        algorithms: Some(vec![Algorithm::Sha256]),
        ..cachet::cas::WriteOptions::default()
    };
    cache.content().write(b"two ways", opts).await.unwrap();
    let sha256_path = cache.content().content_path(&sha256);
    let blake3_path = cache.content().content_path(&blake3);
    assert!(sha256_path.exists());

    fs::write(&blake3_path, b"two wayz").await.unwrap();
    let err = cache.get("k").await.unwrap_err();
    assert!(err.is_corruption());
    assert!(!blake3_path.exists());
    assert!(sha256_path.exists());

    // The surviving copy still serves the key
    let (data, _) = cache.get("k").await.unwrap();
    assert_eq!(&data[..], b"two ways");
}
