use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Statistics from one verify pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Live blobs that hashed correctly
    pub verified_content: u64,
    /// Blobs deleted, whether unreferenced or corrupt
    pub reclaimed_count: u64,
    pub reclaimed_size: u64,
    /// Live blobs that failed verification (also counted as reclaimed)
    pub bad_content_count: u64,
    pub kept_size: u64,
    /// Index entries dropped because their content was gone
    pub missing_content: u64,
    /// Index entries dropped for any reason, filter included
    pub rejected_entries: u64,
    /// Index entries seen by the rebuild
    pub total_entries: u64,
    pub tmp_files_removed: u64,
    pub ownership_fixed: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub timings: StepTimings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTimings {
    pub fix_ownership: Duration,
    pub garbage_collect: Duration,
    pub rebuild_index: Duration,
    pub clean_tmp: Duration,
    pub write_marker: Duration,
}

impl VerifyReport {
    pub(crate) fn started(start_time: DateTime<Utc>) -> Self {
        Self {
            verified_content: 0,
            reclaimed_count: 0,
            reclaimed_size: 0,
            bad_content_count: 0,
            kept_size: 0,
            missing_content: 0,
            rejected_entries: 0,
            total_entries: 0,
            tmp_files_removed: 0,
            ownership_fixed: 0,
            start_time,
            end_time: start_time,
            timings: StepTimings::default(),
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}
