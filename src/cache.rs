//! The cache facade

use bytes::Bytes;
use cachet_cas::{
    CasError, ContentReader, ContentStore, ContentStoreConfig, FsyncPolicy, RetryPolicy,
    WriteOptions, CONTENT_DIR, TMP_DIR,
};
use cachet_digest::Integrity;
use cachet_index::{
    BucketIndex, Entry, EntryStream, InsertOptions, KeyIndex, MemoryIndex, MemoryIndexConfig,
};
use cachet_verify::{VerifyOptions, VerifyReport};
use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, IndexBackend};
use crate::errors::{CacheError, Result};
use crate::memo::Memoizer;

/// Per-put options.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Stored verbatim with the entry
    pub metadata: serde_json::Value,
    /// Reject the payload unless it hashes to this
    pub expected_integrity: Option<Integrity>,
    /// Reject the payload unless it is exactly this long
    pub expected_size: Option<u64>,
    /// Override the cache-wide memoization setting
    pub memoize: Option<bool>,
}

impl PutOptions {
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_integrity(mut self, integrity: Integrity) -> Self {
        self.expected_integrity = Some(integrity);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

/// A content-addressed cache rooted at one directory.
///
/// Keys map to entries in the index; entries name blobs in the content
/// store. Reads are always verified against the digest, and a blob that
/// fails verification is deleted before the error is returned.
///
/// # Example
///
/// ```rust,no_run
/// use cachet::{Cache, CacheConfig, PutOptions};
///
/// # async fn example() -> cachet::Result<()> {
/// let cache = Cache::open(CacheConfig::new("/tmp/my-cache")).await?;
/// cache.put("greeting", b"hello", PutOptions::default()).await?;
///
/// let (data, entry) = cache.get("greeting").await?;
/// assert_eq!(&data[..], b"hello");
/// assert_eq!(entry.size, 5);
/// # Ok(())
/// # }
/// ```
pub struct Cache {
    config: CacheConfig,
    content: ContentStore,
    index: Arc<dyn KeyIndex>,
    memo: Memoizer,
}

impl Cache {
    /// Validate `config` and open (creating if needed) the cache at its root.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root).await?;

        let store_config = ContentStoreConfig {
            algorithms: config.algorithms.clone(),
            fsync_policy: if config.fsync {
                FsyncPolicy::Always
            } else {
                FsyncPolicy::Never
            },
            max_object_size: config.max_object_size,
            retry: RetryPolicy::default(),
        };
        let content = ContentStore::new_with_config(&config.root, store_config).await?;

        let index: Arc<dyn KeyIndex> = match &config.index_backend {
            IndexBackend::Bucketed => Arc::new(BucketIndex::new(&config.root)),
            IndexBackend::Memory { snapshot_every } => {
                let memory_config = MemoryIndexConfig {
                    snapshot_every: *snapshot_every,
                };
                Arc::new(MemoryIndex::open(&config.root, &content, memory_config).await?)
            }
        };

        let memo = Memoizer::new(config.memo_max_entries, config.memo_max_bytes);

        info!(
            "Opened cache at {:?} ({:?} index)",
            config.root, config.index_backend
        );
        Ok(Self {
            config,
            content,
            index,
            memo,
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn index(&self) -> &dyn KeyIndex {
        self.index.as_ref()
    }

    /// Store `data` and point `key` at it.
    pub async fn put(&self, key: &str, data: &[u8], opts: PutOptions) -> Result<Entry> {
        let written = self
            .content
            .write(data, Self::write_options(&opts))
            .await?;
        let entry = self
            .record(key, &written.integrity, written.size, opts.metadata.clone())
            .await?;

        if opts.memoize.unwrap_or(self.config.memoize) {
            self.memo.put(&entry, Bytes::copy_from_slice(data)).await;
        }
        Ok(entry)
    }

    /// Stream a payload into the store and point `key` at it.
    ///
    /// When memoizing, the payload is read back from the store once written,
    /// unless it exceeds the memo byte budget.
    pub async fn put_stream<R>(&self, key: &str, reader: R, opts: PutOptions) -> Result<Entry>
    where
        R: AsyncRead + Unpin,
    {
        let written = self
            .content
            .write_stream(reader, Self::write_options(&opts))
            .await?;
        let entry = self
            .record(key, &written.integrity, written.size, opts.metadata)
            .await?;

        let memoize = opts.memoize.unwrap_or(self.config.memoize);
        if memoize && written.size <= self.config.memo_max_bytes {
            let data = self
                .read_repairing(&written.integrity, Some(written.size))
                .await?;
            self.memo.put(&entry, data).await;
        }
        Ok(entry)
    }

    /// Read the payload for `key`, verified against its digest.
    ///
    /// Memoized payloads are served whenever present, including those
    /// memoized by a per-put override on a cache that does not memoize reads.
    pub async fn get(&self, key: &str) -> Result<(Bytes, Entry)> {
        let entry = self.entry_for(key).await?;
        let integrity = live_integrity(&entry)?;

        if let Some((data, memoized)) = self.memo.get(key).await {
            if memoized == entry {
                return Ok((data, entry));
            }
        }
        if let Some(data) = self.memo.get_digest(integrity).await {
            return Ok((data, entry));
        }

        let data = self.read_repairing(integrity, Some(entry.size)).await?;
        if self.config.memoize {
            self.memo.put(&entry, data.clone()).await;
        }
        Ok((data, entry))
    }

    /// Open a verifying stream over the payload for `key`.
    ///
    /// The bytes are only trustworthy once [`ContentReader::finish`]
    /// succeeds.
    pub async fn get_stream(&self, key: &str) -> Result<(ContentReader, Entry)> {
        let entry = self.entry_for(key).await?;
        let reader = self
            .content
            .open(live_integrity(&entry)?, Some(entry.size))
            .await?;
        Ok((reader, entry))
    }

    /// Read a payload by digest, bypassing the index.
    pub async fn get_by_digest(&self, integrity: &Integrity) -> Result<Bytes> {
        if let Some(data) = self.memo.get_digest(integrity).await {
            return Ok(data);
        }

        let data = self.read_repairing(integrity, None).await?;
        if self.config.memoize {
            self.memo.put_digest(integrity, data.clone()).await;
        }
        Ok(data)
    }

    /// The entry for `key`, without touching content.
    pub async fn info(&self, key: &str) -> Result<Option<Entry>> {
        Ok(self.index.find(key).await?)
    }

    /// The entry for `key` if its content is also present.
    pub async fn has(&self, key: &str) -> Result<Option<Entry>> {
        let Some(entry) = self.index.find(key).await? else {
            return Ok(None);
        };
        let Some(integrity) = &entry.integrity else {
            return Ok(None);
        };
        match self.content.has(integrity).await? {
            Some(_) => Ok(Some(entry)),
            None => Ok(None),
        }
    }

    /// Size of the blob for `integrity`, if present. Does not hash it.
    pub async fn has_content(&self, integrity: &Integrity) -> Result<Option<u64>> {
        Ok(self.content.has(integrity).await?)
    }

    /// Forget `key`. Its content stays until a verify pass finds it
    /// unreferenced.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.index.delete(key).await?;
        self.memo.remove_key(key).await;
        debug!(key = %key, "Deleted entry");
        Ok(())
    }

    /// Forget `key` and remove its content immediately, even if other keys
    /// still reference it.
    pub async fn delete_with_content(&self, key: &str) -> Result<()> {
        let existing = self.index.find(key).await?;
        self.delete(key).await?;
        if let Some(integrity) = existing.and_then(|entry| entry.integrity) {
            self.delete_content(&integrity).await?;
        }
        Ok(())
    }

    /// Remove a blob. Returns whether anything was removed.
    pub async fn delete_content(&self, integrity: &Integrity) -> Result<bool> {
        self.memo.remove_digest(integrity).await;
        let removed = self.content.remove(integrity).await?;
        debug!(integrity = %integrity, removed, "Deleted content");
        Ok(removed)
    }

    pub fn list(&self) -> EntryStream {
        self.index.list()
    }

    /// Verify options seeded from this cache's configuration.
    pub fn verify_options(&self) -> VerifyOptions {
        VerifyOptions::default().with_concurrency(self.config.verify_concurrency)
    }

    /// Run a verify and garbage collection pass.
    pub async fn verify(&self, opts: VerifyOptions) -> Result<VerifyReport> {
        let report = cachet_verify::verify(&self.content, self.index.as_ref(), opts).await?;
        self.memo.clear().await;
        Ok(report)
    }

    pub async fn last_verified(&self) -> Option<DateTime<Utc>> {
        cachet_verify::last_run(&self.config.root).await
    }

    /// Remove every entry, blob and temp file.
    pub async fn clear(&self) -> Result<()> {
        self.index.clear().await?;
        for dir in [CONTENT_DIR, TMP_DIR] {
            let path = self.config.root.join(dir);
            match fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&path).await?;
        }
        self.memo.clear().await;
        info!("Cleared cache at {:?}", self.config.root);
        Ok(())
    }

    pub async fn clear_memoized(&self) {
        self.memo.clear().await;
    }

    /// Persist index state held in memory. A no-op for the bucketed index.
    pub async fn flush(&self) -> Result<()> {
        Ok(self.index.flush().await?)
    }

    fn write_options(opts: &PutOptions) -> WriteOptions {
        WriteOptions {
            expected_integrity: opts.expected_integrity.clone(),
            expected_size: opts.expected_size,
            algorithms: None,
        }
    }

    async fn record(
        &self,
        key: &str,
        integrity: &Integrity,
        size: u64,
        metadata: serde_json::Value,
    ) -> Result<Entry> {
        let opts = InsertOptions {
            size,
            metadata,
            time: None,
        };
        let entry = self.index.insert(key, Some(integrity), opts).await?;
        self.memo.remove_key(key).await;
        debug!(key = %key, integrity = %integrity, size, "Stored entry");
        Ok(entry)
    }

    async fn entry_for(&self, key: &str) -> Result<Entry> {
        self.index
            .find(key)
            .await?
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    /// Read and verify a blob, deleting it if it turns out corrupt.
    ///
    /// Only the file that failed is removed; blobs stored under the other
    /// hashes of a multi-hash integrity are left alone.
    async fn read_repairing(&self, integrity: &Integrity, size: Option<u64>) -> Result<Bytes> {
        let reader = self.content.open(integrity, size).await?;
        let hash = reader.hash().clone();

        let result = match size {
            Some(expected) if reader.file_len() != expected => Err(CasError::SizeMismatch {
                expected,
                actual: reader.file_len(),
            }),
            _ => reader.read_all().await,
        };

        match result {
            Ok(data) => Ok(data),
            Err(e) if e.is_corruption() => {
                warn!(integrity = %integrity, "Removing corrupt content: {}", e);
                if let Err(remove_err) = self.content.remove_hash(&hash).await {
                    warn!("Failed to remove corrupt content {}: {}", hash, remove_err);
                }
                self.memo.remove_digest(integrity).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn live_integrity(entry: &Entry) -> Result<&Integrity> {
    entry
        .integrity
        .as_ref()
        .ok_or_else(|| CacheError::NotFound(entry.key.clone()))
}
