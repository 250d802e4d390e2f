//! In-memory key index with periodic snapshots
//!
//! The live table is a plain map. Every `snapshot_every` mutations (and on
//! [`KeyIndex::flush`]) it is written to `index-mem-v1/snapshot.json` via a
//! temp file under `tmp/` and a rename. A snapshot records each blob's size
//! and mtime; on load, entries whose blob is gone or has changed are dropped.

use async_trait::async_trait;
use cachet_cas::ContentStore;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::entry::{now_millis, Entry};
use crate::errors::Result;
use crate::traits::{BucketId, EntryStream, KeyIndex};

/// Directory under the cache root holding the snapshot.
pub const MEMORY_INDEX_DIR: &str = "index-mem-v1";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct MemoryIndexConfig {
    /// Mutations between snapshots; 0 snapshots only on flush
    pub snapshot_every: u64,
}

impl Default for MemoryIndexConfig {
    fn default() -> Self {
        Self { snapshot_every: 64 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    taken_at: i64,
    records: Vec<SnapshotRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    entry: Entry,
    content_size: u64,
    content_mtime: Option<i64>,
}

pub struct MemoryIndex {
    dir: PathBuf,
    content: ContentStore,
    config: MemoryIndexConfig,
    table: Arc<RwLock<HashMap<String, Entry>>>,
    mutations: AtomicU64,
}

impl MemoryIndex {
    /// Load the last snapshot under `root`, keeping only entries whose
    /// content is still present and unchanged.
    pub async fn open(
        root: impl AsRef<Path>,
        content: &ContentStore,
        config: MemoryIndexConfig,
    ) -> Result<Self> {
        let dir = root.as_ref().join(MEMORY_INDEX_DIR);
        fs::create_dir_all(&dir).await?;

        let index = Self {
            dir,
            content: content.clone(),
            config,
            table: Arc::new(RwLock::new(HashMap::new())),
            mutations: AtomicU64::new(0),
        };
        index.load().await?;
        Ok(index)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn load(&self) -> Result<()> {
        let data = match fs::read(self.snapshot_path()).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = match serde_json::from_slice(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable index snapshot: {}", e);
                return Ok(());
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            warn!("Ignoring index snapshot version {}", snapshot.version);
            return Ok(());
        }

        let total = snapshot.records.len();
        let mut restored = HashMap::with_capacity(total);
        for record in snapshot.records {
            let Some(integrity) = record.entry.integrity.as_ref() else {
                continue;
            };
            let Some(stat) = self.content.stat(integrity).await? else {
                debug!("Dropping {}: content missing", record.entry.key);
                continue;
            };
            let mtime = stat.modified.and_then(millis_since_epoch);
            if stat.size != record.content_size
                || (record.content_mtime.is_some() && mtime != record.content_mtime)
            {
                debug!("Dropping {}: content changed", record.entry.key);
                continue;
            }
            restored.insert(record.entry.key.clone(), record.entry);
        }

        info!(
            "Restored {} of {} index entries from snapshot",
            restored.len(),
            total
        );
        *self.table.write().await = restored;
        Ok(())
    }

    /// Write the current table to disk.
    pub async fn snapshot(&self) -> Result<()> {
        let entries: Vec<Entry> = {
            let table = self.table.read().await;
            table.values().cloned().collect()
        };

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(integrity) = entry.integrity.as_ref() else {
                continue;
            };
            let Some(stat) = self.content.stat(integrity).await? else {
                continue;
            };
            records.push(SnapshotRecord {
                content_size: stat.size,
                content_mtime: stat.modified.and_then(millis_since_epoch),
                entry,
            });
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            taken_at: now_millis(),
            records,
        };
        let json = serde_json::to_vec(&snapshot)?;

        fs::create_dir_all(&self.dir).await?;
        let tmp_dir = self.content.tmp_dir();
        fs::create_dir_all(&tmp_dir).await?;
        let temp_path = tmp_dir.join(uuid::Uuid::new_v4().simple().to_string());
        fs::write(&temp_path, &json).await?;
        if let Err(e) = fs::rename(&temp_path, self.snapshot_path()).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        debug!("Wrote index snapshot ({} entries)", snapshot.records.len());
        Ok(())
    }

    async fn record_mutation(&self) -> Result<()> {
        let count = self.mutations.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.snapshot_every > 0 && count % self.config.snapshot_every == 0 {
            self.snapshot().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyIndex for MemoryIndex {
    async fn insert_entry(&self, entry: &Entry) -> Result<()> {
        {
            let mut table = self.table.write().await;
            if entry.is_tombstone() {
                table.remove(&entry.key);
            } else {
                table.insert(entry.key.clone(), entry.clone());
            }
        }
        self.record_mutation().await
    }

    async fn find(&self, key: &str) -> Result<Option<Entry>> {
        let table = self.table.read().await;
        Ok(table.get(key).cloned())
    }

    fn list(&self) -> EntryStream {
        let table = self.table.clone();
        stream::once(async move {
            let entries: Vec<Entry> = table.read().await.values().cloned().collect();
            stream::iter(entries.into_iter().map(Ok))
        })
        .flatten()
        .boxed()
    }

    fn bucket_of(&self, key: &str) -> BucketId {
        key.to_string()
    }

    async fn rewrite_bucket(&self, bucket: &BucketId, entries: &[Entry]) -> Result<()> {
        let latest = entries
            .iter()
            .rev()
            .find(|entry| &entry.key == bucket)
            .filter(|entry| !entry.is_tombstone())
            .cloned();
        {
            let mut table = self.table.write().await;
            match latest {
                Some(entry) => table.insert(bucket.clone(), entry),
                None => table.remove(bucket),
            };
        }
        self.record_mutation().await
    }

    async fn flush(&self) -> Result<()> {
        self.snapshot().await
    }

    async fn clear(&self) -> Result<()> {
        self.table.write().await.clear();
        match fs::remove_file(self.snapshot_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn millis_since_epoch(time: SystemTime) -> Option<i64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}
