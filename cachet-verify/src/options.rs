use cachet_index::Entry;
use std::fmt;
use std::sync::Arc;

use crate::errors::{Result, VerifyError};

/// Predicate selecting the entries that stay live during a pass.
pub type EntryFilter = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Numeric owner applied to every path under the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone)]
pub struct VerifyOptions {
    /// Entries rejected by the filter are dropped from the index and stop
    /// protecting their content
    pub filter: Option<EntryFilter>,
    /// Upper bound on blobs hashed and buckets rebuilt at once
    pub concurrency: usize,
    /// Unix only; ignored elsewhere
    pub owner: Option<Owner>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            filter: None,
            concurrency: 20,
            owner: None,
        }
    }
}

impl fmt::Debug for VerifyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyOptions")
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("concurrency", &self.concurrency)
            .field("owner", &self.owner)
            .finish()
    }
}

impl VerifyOptions {
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Entry) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(VerifyError::InvalidOptions(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn keeps(&self, entry: &Entry) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(entry))
    }
}
