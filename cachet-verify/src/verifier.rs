//! The verify pipeline

use cachet_cas::{BlobCheck, ContentStore};
use cachet_digest::Hash;
use cachet_index::{BucketId, Entry, KeyIndex};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::errors::{Result, VerifyError};
use crate::marker;
use crate::options::{Owner, VerifyOptions};
use crate::report::VerifyReport;

/// Run a full pass over `content` and `index`.
pub async fn verify(
    content: &ContentStore,
    index: &dyn KeyIndex,
    opts: VerifyOptions,
) -> Result<VerifyReport> {
    Verifier::new(content, index, opts)?.run().await
}

pub struct Verifier<'a> {
    content: &'a ContentStore,
    index: &'a dyn KeyIndex,
    opts: VerifyOptions,
}

/// What happened to one file found under the content tree.
enum Swept {
    Kept(u64),
    Corrupt(u64),
    Reclaimed(u64),
    Skipped,
}

#[derive(Default)]
struct BucketOutcome {
    missing: u64,
}

impl<'a> Verifier<'a> {
    pub fn new(
        content: &'a ContentStore,
        index: &'a dyn KeyIndex,
        opts: VerifyOptions,
    ) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            content,
            index,
            opts,
        })
    }

    pub async fn run(&self) -> Result<VerifyReport> {
        let root = self.content.root_path().to_path_buf();
        let mut report = VerifyReport::started(Utc::now());
        info!("Verifying cache at {:?}", root);

        let step = Instant::now();
        report.ownership_fixed = fix_ownership(&root, self.opts.owner).await?;
        report.timings.fix_ownership = step.elapsed();

        let step = Instant::now();
        self.garbage_collect(&mut report).await?;
        report.timings.garbage_collect = step.elapsed();
        info!(
            verified = report.verified_content,
            reclaimed = report.reclaimed_count,
            bad = report.bad_content_count,
            "Content sweep complete"
        );

        let step = Instant::now();
        self.rebuild_index(&mut report).await?;
        report.timings.rebuild_index = step.elapsed();
        info!(
            total = report.total_entries,
            rejected = report.rejected_entries,
            missing = report.missing_content,
            "Index rebuild complete"
        );

        let step = Instant::now();
        report.tmp_files_removed = clean_tmp(&self.content.tmp_dir()).await?;
        report.timings.clean_tmp = step.elapsed();

        let step = Instant::now();
        report.end_time = Utc::now();
        marker::write(&root, report.end_time).await?;
        report.timings.write_marker = step.elapsed();

        info!("Verify finished in {}ms", report.duration().num_milliseconds());
        Ok(report)
    }

    /// Mark every digest referenced by a kept entry, then hash live blobs
    /// and delete everything else.
    async fn garbage_collect(&self, report: &mut VerifyReport) -> Result<()> {
        let mut live: HashSet<Hash> = HashSet::new();
        let mut entries = self.index.list();
        while let Some(entry) = entries.try_next().await? {
            if !self.opts.keeps(&entry) {
                continue;
            }
            if let Some(integrity) = &entry.integrity {
                live.extend(integrity.hashes().iter().cloned());
            }
        }
        debug!("Marked {} live digests", live.len());

        let files = content_files(&self.content.content_dir()).await?;
        let live = &live;
        let mut swept = stream::iter(files)
            .map(|path| self.sweep(path, live))
            .buffer_unordered(self.opts.concurrency);

        while let Some(outcome) = swept.next().await {
            match outcome? {
                Swept::Kept(size) => {
                    report.verified_content += 1;
                    report.kept_size += size;
                }
                Swept::Corrupt(size) => {
                    report.bad_content_count += 1;
                    report.reclaimed_count += 1;
                    report.reclaimed_size += size;
                }
                Swept::Reclaimed(size) => {
                    report.reclaimed_count += 1;
                    report.reclaimed_size += size;
                }
                Swept::Skipped => {}
            }
        }
        Ok(())
    }

    async fn sweep(&self, path: PathBuf, live: &HashSet<Hash>) -> Result<Swept> {
        let Some(hash) = self.content.hash_from_path(&path) else {
            debug!("Ignoring stray file {:?}", path);
            return Ok(Swept::Skipped);
        };

        if live.contains(&hash) {
            return match self.content.check_hash(&hash).await? {
                BlobCheck::Valid { size } => Ok(Swept::Kept(size)),
                BlobCheck::Corrupt { size } => {
                    warn!("Removing corrupt content {}", hash);
                    self.content.remove_hash(&hash).await?;
                    Ok(Swept::Corrupt(size))
                }
                BlobCheck::Missing => Ok(Swept::Skipped),
            };
        }

        let size = match fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Swept::Skipped),
            Err(e) => return Err(e.into()),
        };
        if self.content.remove_hash(&hash).await? {
            debug!("Reclaimed unreferenced content {}", hash);
            Ok(Swept::Reclaimed(size))
        } else {
            Ok(Swept::Skipped)
        }
    }

    /// Rewrite each bucket with only its kept entries whose content survived.
    async fn rebuild_index(&self, report: &mut VerifyReport) -> Result<()> {
        let mut buckets: HashMap<BucketId, Vec<Entry>> = HashMap::new();
        let mut entries = self.index.list();
        while let Some(entry) = entries.try_next().await? {
            report.total_entries += 1;
            let bucket = buckets.entry(self.index.bucket_of(&entry.key)).or_default();
            if self.opts.keeps(&entry) {
                bucket.push(entry);
            } else {
                report.rejected_entries += 1;
            }
        }

        let mut rebuilt = stream::iter(buckets)
            .map(|(bucket, entries)| self.rebuild_bucket(bucket, entries))
            .buffer_unordered(self.opts.concurrency);

        while let Some(outcome) = rebuilt.next().await {
            let outcome = outcome?;
            report.missing_content += outcome.missing;
            report.rejected_entries += outcome.missing;
        }

        self.index.flush().await?;
        Ok(())
    }

    async fn rebuild_bucket(
        &self,
        bucket: BucketId,
        entries: Vec<Entry>,
    ) -> Result<BucketOutcome> {
        let mut outcome = BucketOutcome::default();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(integrity) = &entry.integrity else {
                continue;
            };
            if self.content.has(integrity).await?.is_some() {
                kept.push(entry);
            } else {
                debug!("Dropping {}: content missing", entry.key);
                outcome.missing += 1;
            }
        }
        self.index.rewrite_bucket(&bucket, &kept).await?;
        Ok(outcome)
    }
}

/// Every regular file below the content root.
async fn content_files(content_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![content_dir.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut dir_entries = match fs::read_dir(&dir).await {
            Ok(dir_entries) => dir_entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        loop {
            let child = match dir_entries.next_entry().await {
                Ok(Some(child)) => child,
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            };
            let file_type = match child.file_type().await {
                Ok(file_type) => file_type,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if file_type.is_dir() {
                stack.push(child.path());
            } else if file_type.is_file() {
                files.push(child.path());
            }
        }
    }
    Ok(files)
}

/// Empty the temp workspace, keeping the directory itself.
async fn clean_tmp(tmp_dir: &Path) -> Result<u64> {
    let mut removed = 0;
    let mut dir_entries = match fs::read_dir(tmp_dir).await {
        Ok(dir_entries) => dir_entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(child) = dir_entries.next_entry().await? {
        let path = child.path();
        let result = match child.file_type().await {
            Ok(file_type) if file_type.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    if removed > 0 {
        debug!("Removed {} leftover temp files", removed);
    }
    Ok(removed)
}

/// Check the root is reachable and, given an owner, chown everything below
/// it. Per-path failures are logged and skipped.
async fn fix_ownership(root: &Path, owner: Option<Owner>) -> Result<u64> {
    if let Err(source) = fs::metadata(root).await {
        return Err(VerifyError::RootInaccessible {
            path: root.to_path_buf(),
            source,
        });
    }
    let Some(owner) = owner else {
        return Ok(0);
    };

    let root = root.to_path_buf();
    let fixed = tokio::task::spawn_blocking(move || chown_tree(&root, owner)).await?;
    if fixed > 0 {
        info!("Fixed ownership of {} paths", fixed);
    }
    Ok(fixed)
}

#[cfg(unix)]
fn chown_tree(root: &Path, owner: Owner) -> u64 {
    use std::os::unix::fs::MetadataExt;

    let mut fixed = 0;
    for entry in walkdir::WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable path during ownership repair: {}", e);
                continue;
            }
        };
        let Ok(metadata) = entry.path().symlink_metadata() else {
            continue;
        };
        if metadata.uid() == owner.uid && metadata.gid() == owner.gid {
            continue;
        }
        match std::os::unix::fs::lchown(entry.path(), Some(owner.uid), Some(owner.gid)) {
            Ok(()) => fixed += 1,
            Err(e) => warn!("Failed to chown {:?}: {}", entry.path(), e),
        }
    }
    fixed
}

#[cfg(not(unix))]
fn chown_tree(_root: &Path, _owner: Owner) -> u64 {
    debug!("Ownership repair is not supported on this platform");
    0
}
