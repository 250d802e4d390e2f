//! `_lastverified` marker

use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::errors::Result;

pub const LAST_VERIFIED_FILE: &str = "_lastverified";

/// Completion time of the last successful pass over `root`.
///
/// A missing or unreadable marker reads as never verified.
pub async fn last_run(root: impl AsRef<Path>) -> Option<DateTime<Utc>> {
    let path = root.as_ref().join(LAST_VERIFIED_FILE);
    let text = match fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) => {
            debug!("No verify marker at {:?}: {}", path, e);
            return None;
        }
    };
    let millis: i64 = text.trim().parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

pub(crate) async fn write(root: &Path, at: DateTime<Utc>) -> Result<()> {
    fs::write(
        root.join(LAST_VERIFIED_FILE),
        at.timestamp_millis().to_string(),
    )
    .await?;
    Ok(())
}
