//! Cache configuration

use cachet_digest::Algorithm;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{CacheError, Result};

/// Key index backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexBackend {
    /// Append-only bucket logs under `index-v5/`
    #[default]
    Bucketed,
    /// In-memory table snapshotted under `index-mem-v1/`
    Memory { snapshot_every: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; every other path is derived from it
    pub root: PathBuf,
    /// Algorithms hashed on write (default `[blake3]`)
    pub algorithms: Vec<Algorithm>,
    pub index_backend: IndexBackend,
    /// Blobs hashed and buckets rebuilt at once during verify (default 20)
    pub verify_concurrency: usize,
    /// Keep recently read and written payloads in memory (default off)
    pub memoize: bool,
    pub memo_max_entries: usize,
    pub memo_max_bytes: u64,
    /// Fsync blobs and their directories on publication (default on)
    pub fsync: bool,
    /// Largest accepted payload, unbounded when absent
    pub max_object_size: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            algorithms: vec![Algorithm::default()],
            index_backend: IndexBackend::default(),
            verify_concurrency: 20,
            memoize: false,
            memo_max_entries: 1024,
            memo_max_bytes: 16 * 1024 * 1024,
            fsync: true,
            max_object_size: None,
        }
    }
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfig("root must be set".into()));
        }
        if self.algorithms.is_empty() {
            return Err(CacheError::InvalidConfig(
                "at least one algorithm is required".into(),
            ));
        }
        if self.verify_concurrency == 0 {
            return Err(CacheError::InvalidConfig(
                "verify_concurrency must be at least 1".into(),
            ));
        }
        if self.memoize && (self.memo_max_entries == 0 || self.memo_max_bytes == 0) {
            return Err(CacheError::InvalidConfig(
                "memoization needs non-zero entry and byte limits".into(),
            ));
        }
        if self.max_object_size == Some(0) {
            return Err(CacheError::InvalidConfig(
                "max_object_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::new("/tmp/cachet");
        assert!(config.validate().is_ok());
        assert_eq!(config.algorithms, vec![Algorithm::Blake3]);
        assert_eq!(config.index_backend, IndexBackend::Bucketed);
        assert_eq!(config.verify_concurrency, 20);
        assert!(!config.memoize);
        assert!(config.fsync);
    }

    #[test]
    fn test_validation() {
        assert!(CacheConfig::default().validate().is_err());

        let mut config = CacheConfig::new("/tmp/cachet");
        config.algorithms.clear();
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));

        let mut config = CacheConfig::new("/tmp/cachet");
        config.verify_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new("/tmp/cachet");
        config.memoize = true;
        config.memo_max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: CacheConfig = serde_json::from_str(
            r#"{"root": "/var/cache/app", "algorithms": ["sha512"],
                "index_backend": {"kind": "memory", "snapshot_every": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.algorithms, vec![Algorithm::Sha512]);
        assert_eq!(
            config.index_backend,
            IndexBackend::Memory { snapshot_every: 8 }
        );
        assert_eq!(config.memo_max_entries, 1024);
    }
}
