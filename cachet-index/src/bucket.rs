//! Append-only bucket logs
//!
//! Keys are sharded by the SHA-256 of the key into
//! `index-v5/<xx>/<yy>/<rest>`. Each insert appends one line:
//!
//! ```text
//! \n<blake3 hex of json>\t<json>
//! ```
//!
//! The leading newline means a torn previous append can only damage its
//! own line. Lines whose checksum or JSON does not hold up are skipped.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::entry::Entry;
use crate::errors::Result;
use crate::traits::{BucketId, EntryStream, KeyIndex};

/// Directory under the cache root holding bucket files.
pub const INDEX_DIR: &str = "index-v5";

#[derive(Debug, Clone)]
pub struct BucketIndex {
    index_dir: PathBuf,
}

impl BucketIndex {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            index_dir: root.as_ref().join(INDEX_DIR),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Path of the bucket file holding `key`.
    pub fn bucket_path(&self, key: &str) -> PathBuf {
        self.path_for_bucket(&hash_key(key))
    }

    fn path_for_bucket(&self, bucket: &str) -> PathBuf {
        if bucket.len() < 5 {
            return self.index_dir.join(bucket);
        }
        self.index_dir
            .join(&bucket[0..2])
            .join(&bucket[2..4])
            .join(&bucket[4..])
    }

    async fn append(&self, path: &Path, entries: &[Entry]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        for entry in entries {
            file.write_all(format_line(entry)?.as_bytes()).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl KeyIndex for BucketIndex {
    async fn insert_entry(&self, entry: &Entry) -> Result<()> {
        let path = self.bucket_path(&entry.key);
        self.append(&path, std::slice::from_ref(entry)).await?;
        trace!("Appended {} to {:?}", entry.key, path);
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<Entry>> {
        let entries = read_bucket(&self.bucket_path(key)).await?;
        Ok(entries
            .into_iter()
            .rev()
            .find(|entry| entry.key == key)
            .filter(|entry| !entry.is_tombstone()))
    }

    fn list(&self) -> EntryStream {
        let state = ListState {
            dirs: vec![self.index_dir.clone()],
            files: Vec::new(),
            ready: VecDeque::new(),
        };
        stream::try_unfold(state, next_listed).boxed()
    }

    fn bucket_of(&self, key: &str) -> BucketId {
        hash_key(key)
    }

    async fn rewrite_bucket(&self, bucket: &BucketId, entries: &[Entry]) -> Result<()> {
        let path = self.path_for_bucket(bucket);
        match fs::File::create(&path).await {
            Ok(file) => drop(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound && entries.is_empty() => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if !entries.is_empty() {
            self.append(&path, entries).await?;
        }
        debug!("Rewrote bucket {} with {} entries", bucket, entries.len());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.index_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hex SHA-256 of a key; also its bucket id.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn checksum(json: &str) -> String {
    blake3::hash(json.as_bytes()).to_hex().to_string()
}

fn format_line(entry: &Entry) -> Result<String> {
    let json = serde_json::to_string(entry)?;
    Ok(format!("\n{}\t{}", checksum(&json), json))
}

/// Parse a bucket file, dropping lines that fail their checksum or do not
/// decode.
pub(crate) fn parse_bucket(data: &[u8]) -> Vec<Entry> {
    let text = String::from_utf8_lossy(data);
    let mut entries = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        let Some((sum, json)) = line.split_once('\t') else {
            debug!("Skipping index line without checksum");
            continue;
        };
        if sum != checksum(json) {
            debug!("Skipping index line with bad checksum");
            continue;
        }
        match serde_json::from_str::<Entry>(json) {
            Ok(entry) => entries.push(entry),
            Err(e) => debug!("Skipping undecodable index line: {}", e),
        }
    }
    entries
}

async fn read_bucket(path: &Path) -> Result<Vec<Entry>> {
    match fs::read(path).await {
        Ok(data) => Ok(parse_bucket(&data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Latest entry per key, in order of first appearance, without tombstones.
fn reduce_bucket(entries: Vec<Entry>) -> Vec<Entry> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut latest: Vec<Entry> = Vec::new();
    for entry in entries {
        match positions.get(&entry.key) {
            Some(&at) => latest[at] = entry,
            None => {
                positions.insert(entry.key.clone(), latest.len());
                latest.push(entry);
            }
        }
    }
    latest.retain(|entry| !entry.is_tombstone());
    latest
}

struct ListState {
    dirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
    ready: VecDeque<Entry>,
}

async fn next_listed(mut state: ListState) -> Result<Option<(Entry, ListState)>> {
    loop {
        if let Some(entry) = state.ready.pop_front() {
            return Ok(Some((entry, state)));
        }

        if let Some(file) = state.files.pop() {
            let entries = read_bucket(&file).await?;
            state.ready.extend(reduce_bucket(entries));
            continue;
        }

        let Some(dir) = state.dirs.pop() else {
            return Ok(None);
        };
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(child) = read_dir.next_entry().await? {
            let file_type = child.file_type().await?;
            if file_type.is_dir() {
                state.dirs.push(child.path());
            } else if file_type.is_file() {
                state.files.push(child.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::InsertOptions;
    use cachet_digest::{Algorithm, Integrity};
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn integrity(data: &[u8]) -> Integrity {
        Integrity::from_data(&[Algorithm::Sha256], data)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let temp_dir = TempDir::new().unwrap();
        let index = BucketIndex::new(temp_dir.path());

        let sri = integrity(b"value");
        let opts = InsertOptions {
            size: 5,
            metadata: serde_json::json!({"mime": "text/plain"}),
            time: None,
        };
        let inserted = index.insert("my-key", Some(&sri), opts).await.unwrap();

        let found = index.find("my-key").await.unwrap().unwrap();
        assert_eq!(found, inserted);
        assert_eq!(found.metadata["mime"], "text/plain");
        assert!(index.find("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_entry_wins() {
        let temp_dir = TempDir::new().unwrap();
        let index = BucketIndex::new(temp_dir.path());

        index
            .insert("k", Some(&integrity(b"one")), InsertOptions::default())
            .await
            .unwrap();
        index
            .insert("k", Some(&integrity(b"two")), InsertOptions::default())
            .await
            .unwrap();

        let found = index.find("k").await.unwrap().unwrap();
        assert_eq!(found.integrity, Some(integrity(b"two")));

        let listed: Vec<Entry> = index.list().try_collect().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_hides_key() {
        let temp_dir = TempDir::new().unwrap();
        let index = BucketIndex::new(temp_dir.path());

        index
            .insert("k", Some(&integrity(b"x")), InsertOptions::default())
            .await
            .unwrap();
        let tombstone = index.delete("k").await.unwrap();
        assert!(tombstone.is_tombstone());

        assert!(index.find("k").await.unwrap().is_none());
        let listed: Vec<Entry> = index.list().try_collect().await.unwrap();
        assert!(listed.is_empty());

        // History is still on disk: two lines
        let raw = fs::read_to_string(index.bucket_path("k")).await.unwrap();
        assert_eq!(raw.matches('\n').count(), 2);
    }

    #[tokio::test]
    async fn test_line_format() {
        let temp_dir = TempDir::new().unwrap();
        let index = BucketIndex::new(temp_dir.path());
        index
            .insert("k", Some(&integrity(b"x")), InsertOptions::default())
            .await
            .unwrap();

        let raw = fs::read_to_string(index.bucket_path("k")).await.unwrap();
        assert!(raw.starts_with('\n'));
        let (sum, json) = raw[1..].split_once('\t').unwrap();
        assert_eq!(sum, checksum(json));
        assert_eq!(sum.len(), 64);

        let path = index.bucket_path("k");
        let hashed = hash_key("k");
        assert!(path.ends_with(
            PathBuf::from(&hashed[0..2])
                .join(&hashed[2..4])
                .join(&hashed[4..])
        ));
    }

    #[test]
    fn test_parse_skips_bad_lines() {
        let good = Entry::new("a", None, InsertOptions::default());
        let good_line = format_line(&good).unwrap();
        let mut data = String::new();
        data.push_str(&good_line);
        data.push_str("\nnot-a-checksum\t{\"key\":\"b\"}");
        data.push_str("\nno tab at all");
        data.push_str(&format!("\n{}\t{{broken", checksum("{broken")));
        data.push_str(&good_line[..good_line.len() / 2]);

        let entries = parse_bucket(data.as_bytes());
        assert_eq!(entries, vec![good]);
    }

    #[tokio::test]
    async fn test_rewrite_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let index = BucketIndex::new(temp_dir.path());

        let first = index
            .insert("k", Some(&integrity(b"1")), InsertOptions::default())
            .await
            .unwrap();
        index
            .insert("k", Some(&integrity(b"2")), InsertOptions::default())
            .await
            .unwrap();

        let bucket = index.bucket_of("k");
        index.rewrite_bucket(&bucket, &[first.clone()]).await.unwrap();
        assert_eq!(index.find("k").await.unwrap(), Some(first));

        index.rewrite_bucket(&bucket, &[]).await.unwrap();
        assert!(index.find("k").await.unwrap().is_none());

        // Rewriting a bucket that never existed is a no-op
        index
            .rewrite_bucket(&index.bucket_of("ghost"), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let index = BucketIndex::new(temp_dir.path());

        let listed: Vec<Entry> = index.list().try_collect().await.unwrap();
        assert!(listed.is_empty());

        for i in 0..20 {
            let key = format!("key-{i}");
            index
                .insert(&key, Some(&integrity(key.as_bytes())), InsertOptions::default())
                .await
                .unwrap();
        }
        let mut keys: Vec<String> = index
            .list()
            .map_ok(|entry| entry.key)
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        assert_eq!(keys.len(), 20);
        assert_eq!(keys[0], "key-0");

        index.clear().await.unwrap();
        assert!(index.find("key-3").await.unwrap().is_none());
        index.clear().await.unwrap();
    }
}
