use bytes::Bytes;
use cachet_digest::{Algorithm, Hash, Integrity, IntegrityHasher};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::atomic::{AtomicWriter, CommitOutcome};
use crate::errors::{CasError, Result};
use crate::reader::ContentReader;
use crate::retry::RetryPolicy;
use crate::validation;

/// Directory under the cache root holding blobs.
pub const CONTENT_DIR: &str = "content-v2";

/// Directory under the cache root holding in-progress writes.
pub const TMP_DIR: &str = "tmp";

const CHUNK_SIZE: usize = 64 * 1024;

/// Fsync policy for controlling write durability vs performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync the temp file and the shard directory on every publication
    Always,
    /// Leave durability to the OS (testing, throwaway caches)
    Never,
}

/// Configuration options for the content store.
#[derive(Debug, Clone)]
pub struct ContentStoreConfig {
    /// Algorithms hashed on write when the caller gives no expected integrity
    pub algorithms: Vec<Algorithm>,
    /// Fsync policy for write operations
    pub fsync_policy: FsyncPolicy,
    /// Largest accepted object, `None` for unbounded
    pub max_object_size: Option<u64>,
    /// Retry policy for transient open/link/rename/unlink failures
    pub retry: RetryPolicy,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            algorithms: vec![Algorithm::default()],
            fsync_policy: FsyncPolicy::Always,
            max_object_size: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-write expectations.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Fail with `IntegrityMismatch` unless the content hashes to this.
    /// Its algorithms replace the configured ones for this write.
    pub expected_integrity: Option<Integrity>,
    /// Fail with `SizeMismatch` unless exactly this many bytes arrive
    pub expected_size: Option<u64>,
    /// Override the configured algorithms for this write
    pub algorithms: Option<Vec<Algorithm>>,
}

/// Reference to an object in the content-addressed storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentRef {
    pub integrity: Integrity,
    pub size: u64,
    pub outcome: CommitOutcome,
}

/// Existence probe result; does not imply the bytes are valid.
#[derive(Debug, Clone)]
pub struct ContentStat {
    pub hash: Hash,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Outcome of hashing a blob against the digest its path claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobCheck {
    Valid { size: u64 },
    Corrupt { size: u64 },
    Missing,
}

/// Content-addressed blob store.
///
/// Blobs live at `{root}/content-v2/{algorithm}/{hex[0..2]}/{hex[2..4]}/{hex[4..]}`
/// where `hex` is the digest of the strongest hash in the blob's integrity.
/// Writes stream into `{root}/tmp/` and are published by link or rename, so a
/// reader sees either no file or a complete one.
///
/// The store never consults the key index; removing a blob that is still
/// referenced is the caller's decision.
///
/// # Example
///
/// ```rust,no_run
/// use cachet_cas::{ContentStore, WriteOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = ContentStore::new("/tmp/cachet").await?;
///
/// let written = store.write(b"Hello, World!", WriteOptions::default()).await?;
/// let data = store.read(&written.integrity, Some(written.size)).await?;
/// assert_eq!(&data[..], b"Hello, World!");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ContentStore {
    root_path: PathBuf,
    config: ContentStoreConfig,
}

impl ContentStore {
    /// Create a content store with default configuration.
    pub async fn new(root_path: impl AsRef<Path>) -> Result<Self> {
        Self::new_with_config(root_path, ContentStoreConfig::default()).await
    }

    /// Create a content store, making the content and temp directories.
    pub async fn new_with_config(
        root_path: impl AsRef<Path>,
        config: ContentStoreConfig,
    ) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        fs::create_dir_all(root_path.join(CONTENT_DIR)).await?;
        fs::create_dir_all(root_path.join(TMP_DIR)).await?;

        debug!("Content store initialized at {:?} with config {:?}", root_path, config);

        Ok(Self { root_path, config })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn content_dir(&self) -> PathBuf {
        self.root_path.join(CONTENT_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root_path.join(TMP_DIR)
    }

    pub fn config(&self) -> &ContentStoreConfig {
        &self.config
    }

    /// Sharded on-disk location of a single hash.
    pub fn content_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        let (shard1, rest) = hex.split_at(2);
        let (shard2, filename) = rest.split_at(2);

        self.content_dir()
            .join(hash.algorithm().as_str())
            .join(shard1)
            .join(shard2)
            .join(filename)
    }

    /// Inverse of [`content_path`](Self::content_path). Returns `None` for
    /// paths outside the layout.
    pub fn hash_from_path(&self, path: &Path) -> Option<Hash> {
        let relative = path.strip_prefix(self.content_dir()).ok()?;
        let parts = validation::content_components(relative)?;
        let algorithm: Algorithm = parts[0].parse().ok()?;
        let hex = format!("{}{}{}", parts[1], parts[2], parts[3]);
        Hash::from_hex(algorithm, &hex).ok()
    }

    /// Write an in-memory payload.
    pub async fn write(&self, data: &[u8], opts: WriteOptions) -> Result<ContentRef> {
        validation::validate_object_size(data.len() as u64, self.config.max_object_size)?;
        if let Some(expected) = opts.expected_size {
            if expected != data.len() as u64 {
                return Err(CasError::SizeMismatch {
                    expected,
                    actual: data.len() as u64,
                });
            }
        }

        let mut writer = AtomicWriter::new(self, opts).await?;
        if let Err(e) = writer.write(data).await {
            writer.abort().await;
            return Err(e);
        }
        writer.commit().await
    }

    /// Stream a payload from `reader` into the store.
    ///
    /// On any failure, including the reader erroring midway, the temp file
    /// is removed and nothing is published.
    pub async fn write_stream<R>(&self, mut reader: R, opts: WriteOptions) -> Result<ContentRef>
    where
        R: AsyncRead + Unpin,
    {
        let mut writer = AtomicWriter::new(self, opts).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    writer.abort().await;
                    return Err(e.into());
                }
            };
            if let Err(e) = writer.write(&buf[..n]).await {
                writer.abort().await;
                return Err(e);
            }
        }

        writer.commit().await
    }

    /// Read and fully verify a blob before returning it.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no hash of `integrity` resolves to a file
    /// - `SizeMismatch` if `expected_size` is given and differs
    /// - `IntegrityMismatch` if the bytes do not hash to `integrity`
    pub async fn read(&self, integrity: &Integrity, expected_size: Option<u64>) -> Result<Bytes> {
        let reader = self.open(integrity, expected_size).await?;
        if let Some(expected) = expected_size {
            if reader.file_len() != expected {
                return Err(CasError::SizeMismatch {
                    expected,
                    actual: reader.file_len(),
                });
            }
        }
        reader.read_all().await
    }

    /// Open a verifying stream over a blob.
    ///
    /// Hashes are tried strongest first; the first one whose path exists is
    /// used.
    pub async fn open(
        &self,
        integrity: &Integrity,
        expected_size: Option<u64>,
    ) -> Result<ContentReader> {
        let mut last_missing = None;
        for hash in integrity.by_preference() {
            let path = self.content_path(hash);
            match self.config.retry.run("open content", || File::open(&path)).await {
                Ok(file) => {
                    let len = file.metadata().await?.len();
                    trace!("Opened {} at {:?}", hash, path);
                    return Ok(ContentReader::new(
                        file,
                        len,
                        hash.clone(),
                        integrity.clone(),
                        expected_size,
                    ));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => last_missing = Some(path),
                Err(e) => return Err(e.into()),
            }
        }

        debug!("Content {} not found (last tried {:?})", integrity, last_missing);
        Err(CasError::NotFound(integrity.clone()))
    }

    /// Fast existence probe. Returns the blob size without hashing it.
    pub async fn has(&self, integrity: &Integrity) -> Result<Option<u64>> {
        Ok(self.stat(integrity).await?.map(|stat| stat.size))
    }

    /// Resolve a blob and return its file metadata.
    pub async fn stat(&self, integrity: &Integrity) -> Result<Option<ContentStat>> {
        for hash in integrity.by_preference() {
            let path = self.content_path(hash);
            match fs::metadata(&path).await {
                Ok(metadata) => {
                    return Ok(Some(ContentStat {
                        hash: hash.clone(),
                        path,
                        size: metadata.len(),
                        modified: metadata.modified().ok(),
                    }))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Delete every blob addressed by `integrity`.
    ///
    /// Returns whether anything was removed.
    pub async fn remove(&self, integrity: &Integrity) -> Result<bool> {
        let mut removed = false;
        for hash in integrity.hashes() {
            if self.remove_hash(hash).await? {
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Delete the blob for a single hash, tolerating its absence.
    pub async fn remove_hash(&self, hash: &Hash) -> Result<bool> {
        let path = self.content_path(hash);
        match self
            .config
            .retry
            .run("remove content", || fs::remove_file(&path))
            .await
        {
            Ok(()) => {
                debug!("Deleted content {}", hash);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Hash the file at `hash`'s path and compare it with `hash`.
    pub async fn check_hash(&self, hash: &Hash) -> Result<BlobCheck> {
        self.check_file(hash, &self.content_path(hash)).await
    }

    /// Hash an arbitrary file and compare it with `hash`.
    pub(crate) async fn check_file(&self, hash: &Hash, path: &Path) -> Result<BlobCheck> {
        let mut file = match self.config.retry.run("open content", || File::open(path)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BlobCheck::Missing),
            Err(e) => return Err(e.into()),
        };

        let mut hasher = IntegrityHasher::new(&[hash.algorithm()]);
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BlobCheck::Missing),
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let size = hasher.bytes_hashed();
        let actual = hasher.finish();
        if actual.strongest() == hash {
            Ok(BlobCheck::Valid { size })
        } else {
            Ok(BlobCheck::Corrupt { size })
        }
    }

    pub(crate) fn should_fsync(&self) -> bool {
        self.config.fsync_policy == FsyncPolicy::Always
    }

    /// Fsync a directory so a rename or link inside it is durable.
    pub(crate) async fn fsync_directory(&self, dir: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            let dir_file = self
                .config
                .retry
                .run("open directory", || File::open(dir))
                .await?;
            dir_file.sync_all().await?;
        }
        #[cfg(not(unix))]
        let _ = dir;
        Ok(())
    }
}
