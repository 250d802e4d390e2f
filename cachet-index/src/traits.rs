use async_trait::async_trait;
use cachet_digest::Integrity;
use futures::stream::BoxStream;

use crate::entry::{Entry, InsertOptions};
use crate::errors::Result;

/// Current entries, one per live key. Single pass; call `list` again to
/// re-enumerate.
pub type EntryStream = BoxStream<'static, Result<Entry>>;

/// Opaque name of the unit a backend rewrites atomically with respect to
/// shadowing order.
pub type BucketId = String;

/// Storage backend for the key index.
///
/// Inserting is the only mutation; deletion appends a tombstone.
#[async_trait]
pub trait KeyIndex: Send + Sync {
    /// Record `key -> integrity`. `None` records a tombstone.
    async fn insert(
        &self,
        key: &str,
        integrity: Option<&Integrity>,
        opts: InsertOptions,
    ) -> Result<Entry> {
        let entry = Entry::new(key, integrity.cloned(), opts);
        self.insert_entry(&entry).await?;
        Ok(entry)
    }

    /// Append a fully formed entry, keeping its timestamp.
    async fn insert_entry(&self, entry: &Entry) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<Entry> {
        self.insert(key, None, InsertOptions::default()).await
    }

    /// Latest entry for `key`; `None` if absent or tombstoned.
    async fn find(&self, key: &str) -> Result<Option<Entry>>;

    fn list(&self) -> EntryStream;

    fn bucket_of(&self, key: &str) -> BucketId;

    /// Replace a bucket's history with exactly `entries`, in order.
    async fn rewrite_bucket(&self, bucket: &BucketId, entries: &[Entry]) -> Result<()>;

    /// Persist anything held only in memory.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Drop every entry.
    async fn clear(&self) -> Result<()>;
}
