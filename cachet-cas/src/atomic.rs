//! Atomic publication of blobs for crash safety

use cachet_digest::{Integrity, IntegrityHasher};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::{CasError, Result};
use crate::retry::RetryPolicy;
use crate::storage::{BlobCheck, ContentRef, ContentStore, WriteOptions};
use crate::validation;

/// How a committed write ended up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// No blob existed; ours was published
    Created,
    /// A valid blob already existed; ours was discarded
    Deduplicated,
    /// A corrupt blob existed; ours replaced it
    Replaced,
}

/// Streams one payload into a uniquely named file under `tmp/`, hashing as
/// it goes, and publishes it under its content path on [`commit`].
///
/// Dropping a writer that was never committed removes its temp file, so an
/// early return or a cancelled future never leaks a partial blob.
///
/// [`commit`]: AtomicWriter::commit
pub struct AtomicWriter {
    store: ContentStore,
    temp_path: PathBuf,
    file: Option<fs::File>,
    hasher: Option<IntegrityHasher>,
    bytes_written: u64,
    expected_integrity: Option<Integrity>,
    expected_size: Option<u64>,
    finished: bool,
}

impl AtomicWriter {
    /// Create a new temp file in the store's temp workspace.
    pub async fn new(store: &ContentStore, opts: WriteOptions) -> Result<Self> {
        let tmp_dir = store.tmp_dir();
        fs::create_dir_all(&tmp_dir).await?;

        let temp_path = tmp_dir.join(uuid::Uuid::new_v4().simple().to_string());
        let file = store
            .config()
            .retry
            .run("create temp file", || fs::File::create(&temp_path))
            .await?;

        let algorithms = match (&opts.expected_integrity, &opts.algorithms) {
            (Some(expected), _) => expected.algorithms(),
            (None, Some(algorithms)) => algorithms.clone(),
            (None, None) => store.config().algorithms.clone(),
        };

        Ok(Self {
            store: store.clone(),
            temp_path,
            file: Some(file),
            hasher: Some(IntegrityHasher::new(&algorithms)),
            bytes_written: 0,
            expected_integrity: opts.expected_integrity,
            expected_size: opts.expected_size,
            finished: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append a chunk.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let total = self.bytes_written + data.len() as u64;
        validation::validate_object_size(total, self.store.config().max_object_size)?;
        if let Some(expected) = self.expected_size {
            if total > expected {
                return Err(CasError::SizeMismatch {
                    expected,
                    actual: total,
                });
            }
        }

        let (Some(file), Some(hasher)) = (self.file.as_mut(), self.hasher.as_mut()) else {
            return Err(finalized());
        };
        file.write_all(data).await?;
        hasher.update(data);
        self.bytes_written = total;
        Ok(())
    }

    /// Verify expectations and publish the blob.
    pub async fn commit(mut self) -> Result<ContentRef> {
        let (Some(mut file), Some(hasher)) = (self.file.take(), self.hasher.take()) else {
            return Err(finalized());
        };

        file.flush().await?;
        if self.store.should_fsync() {
            file.sync_all().await?;
        }
        drop(file);

        let integrity = hasher.finish();
        let size = self.bytes_written;

        if let Some(expected) = self.expected_size {
            if expected != size {
                self.discard().await;
                return Err(CasError::SizeMismatch {
                    expected,
                    actual: size,
                });
            }
        }

        if let Some(expected) = &self.expected_integrity {
            if integrity.matches(expected).is_none() {
                let expected = expected.clone();
                self.discard().await;
                return Err(CasError::IntegrityMismatch {
                    expected,
                    actual: integrity,
                });
            }
        }

        let outcome = self.publish(&integrity).await?;
        debug!("Committed {} ({} bytes, {:?})", integrity, size, outcome);

        Ok(ContentRef {
            integrity,
            size,
            outcome,
        })
    }

    /// Abort the write and remove the temp file.
    pub async fn abort(mut self) {
        self.file.take();
        self.discard().await;
    }

    /// Move the temp file to its content path.
    ///
    /// A hard link is the publication step because, unlike rename, it refuses
    /// to clobber an existing blob. An existing blob is hashed: if it is
    /// valid ours is dropped, otherwise ours replaces it by rename.
    async fn publish(&mut self, integrity: &Integrity) -> Result<CommitOutcome> {
        let hash = integrity.strongest();
        let final_path = self.store.content_path(hash);
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.store.content_dir());
        fs::create_dir_all(&parent).await?;

        let retry = self.store.config().retry.clone();
        let temp_path = self.temp_path.clone();

        let linked = retry
            .run("link content", || fs::hard_link(&temp_path, &final_path))
            .await;

        let outcome = match linked {
            Ok(()) => CommitOutcome::Created,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match self.store.check_file(hash, &final_path).await? {
                    BlobCheck::Valid { .. } => CommitOutcome::Deduplicated,
                    BlobCheck::Corrupt { .. } | BlobCheck::Missing => {
                        warn!("Replacing corrupt content at {:?}", final_path);
                        retry
                            .run("replace content", || fs::rename(&temp_path, &final_path))
                            .await?;
                        self.finished = true;
                        CommitOutcome::Replaced
                    }
                }
            }
            Err(e) if link_unsupported(&e) => {
                debug!("Hard links unsupported at {:?}, falling back to rename", parent);
                match self.store.check_file(hash, &final_path).await? {
                    BlobCheck::Valid { .. } => CommitOutcome::Deduplicated,
                    BlobCheck::Corrupt { .. } => {
                        retry
                            .run("replace content", || fs::rename(&temp_path, &final_path))
                            .await?;
                        self.finished = true;
                        CommitOutcome::Replaced
                    }
                    BlobCheck::Missing => {
                        retry
                            .run("publish content", || fs::rename(&temp_path, &final_path))
                            .await?;
                        self.finished = true;
                        CommitOutcome::Created
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };

        // The blob is published at this point; a leftover temp file is
        // swept by the next verify pass.
        if !self.finished {
            self.finished = true;
            remove_temp_file(&retry, &temp_path).await;
        }

        if self.store.should_fsync() && outcome != CommitOutcome::Deduplicated {
            self.store.fsync_directory(&parent).await?;
        }

        Ok(outcome)
    }

    async fn discard(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        remove_temp_file(&self.store.config().retry, &self.temp_path).await;
    }
}

/// Remove a temp file, logging rather than failing.
async fn remove_temp_file(retry: &RetryPolicy, path: &Path) {
    match retry.run("remove temp file", || fs::remove_file(path)).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to cleanup temp file {}: {}", path.display(), e),
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

fn finalized() -> CasError {
    CasError::Io(io::Error::new(
        io::ErrorKind::Other,
        "atomic writer already finalized",
    ))
}

fn link_unsupported(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    #[cfg(unix)]
    {
        if let Some(code) = e.raw_os_error() {
            return code == libc::EPERM || code == libc::EXDEV;
        }
    }
    false
}
