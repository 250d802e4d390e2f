//! In-process memoization of payloads
//!
//! Owned by one [`Cache`](crate::Cache); never shared globally. Entries are
//! reachable by cache key and by digest, bounded by count and by bytes.

use bytes::Bytes;
use cachet_digest::{Hash, Integrity};
use cachet_index::Entry;
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MemoKey {
    Key(String),
    Digest(Hash),
}

struct Memoized {
    data: Bytes,
    entry: Option<Entry>,
}

struct MemoState {
    items: LruCache<MemoKey, Memoized>,
    bytes: u64,
}

pub struct Memoizer {
    state: Mutex<MemoState>,
    max_bytes: u64,
}

impl Memoizer {
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(MemoState {
                items: LruCache::new(capacity),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Remember `data` under the entry's key and under its digest.
    pub async fn put(&self, entry: &Entry, data: Bytes) {
        if let Some(integrity) = &entry.integrity {
            self.insert(
                MemoKey::Digest(integrity.strongest().clone()),
                Memoized {
                    data: data.clone(),
                    entry: None,
                },
            )
            .await;
        }
        self.insert(
            MemoKey::Key(entry.key.clone()),
            Memoized {
                data,
                entry: Some(entry.clone()),
            },
        )
        .await;
    }

    pub async fn put_digest(&self, integrity: &Integrity, data: Bytes) {
        self.insert(
            MemoKey::Digest(integrity.strongest().clone()),
            Memoized { data, entry: None },
        )
        .await;
    }

    pub async fn get(&self, key: &str) -> Option<(Bytes, Entry)> {
        let mut state = self.state.lock().await;
        let memoized = state.items.get(&MemoKey::Key(key.to_string()))?;
        let entry = memoized.entry.clone()?;
        Some((memoized.data.clone(), entry))
    }

    pub async fn get_digest(&self, integrity: &Integrity) -> Option<Bytes> {
        let mut state = self.state.lock().await;
        integrity.by_preference().into_iter().find_map(|hash| {
            state
                .items
                .get(&MemoKey::Digest(hash.clone()))
                .map(|memoized| memoized.data.clone())
        })
    }

    pub async fn remove_key(&self, key: &str) {
        let mut state = self.state.lock().await;
        if let Some(removed) = state.items.pop(&MemoKey::Key(key.to_string())) {
            state.bytes -= removed.data.len() as u64;
        }
    }

    pub async fn remove_digest(&self, integrity: &Integrity) {
        let mut state = self.state.lock().await;
        for hash in integrity.hashes() {
            if let Some(removed) = state.items.pop(&MemoKey::Digest(hash.clone())) {
                state.bytes -= removed.data.len() as u64;
            }
        }
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.items.clear();
        state.bytes = 0;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bytes held, counting a payload once per key it is reachable by.
    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.bytes
    }

    async fn insert(&self, key: MemoKey, memoized: Memoized) {
        let size = memoized.data.len() as u64;
        if size > self.max_bytes {
            trace!("Not memoizing {} byte payload", size);
            return;
        }

        let mut state = self.state.lock().await;
        if let Some((_, displaced)) = state.items.push(key, memoized) {
            state.bytes -= displaced.data.len() as u64;
        }
        state.bytes += size;

        while state.bytes > self.max_bytes {
            match state.items.pop_lru() {
                Some((_, evicted)) => state.bytes -= evicted.data.len() as u64,
                None => break,
            }
        }
    }
}
