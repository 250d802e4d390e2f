use cachet_digest::Integrity;
use serde::{Deserialize, Serialize};

/// One index record.
///
/// Records are never edited in place: a newer record for the same key
/// shadows every older one. A record without an integrity is a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub integrity: Option<Integrity>,
    /// Milliseconds since the Unix epoch
    pub time: i64,
    pub size: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Entry {
    pub fn new(key: &str, integrity: Option<Integrity>, opts: InsertOptions) -> Self {
        Self {
            key: key.to_string(),
            integrity,
            time: opts.time.unwrap_or_else(now_millis),
            size: opts.size,
            metadata: opts.metadata,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.integrity.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    pub size: u64,
    pub metadata: serde_json::Value,
    /// Defaults to now; set when re-inserting an existing entry
    pub time: Option<i64>,
}

impl From<&Entry> for InsertOptions {
    fn from(entry: &Entry) -> Self {
        Self {
            size: entry.size,
            metadata: entry.metadata.clone(),
            time: Some(entry.time),
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
