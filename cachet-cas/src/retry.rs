//! Bounded retry for transient filesystem failures

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for filesystem operations that can fail transiently
/// (descriptor exhaustion, sharing violations during rename/unlink).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Backoff multiplier (exponential backoff)
    pub backoff_multiplier: f64,
    /// Jitter factor to randomize delays (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate delay for a given attempt number
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay_ms = self.base_delay.as_millis() as f64;
        let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
        let delay_ms = (base_delay_ms * multiplier).min(self.max_delay.as_millis() as f64);

        let jitter = 1.0 + (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        Duration::from_millis((delay_ms * jitter).max(0.0) as u64)
    }

    /// Run `op`, retrying while it fails with a transient error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> io::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt + 1 < attempts => {
                    attempt += 1;
                    let delay = self.calculate_delay(attempt);
                    debug!(
                        "Transient failure during {} (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, attempts, e, delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    if is_transient(&e) {
                        warn!("Giving up on {} after {} attempts: {}", what, attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Whether an I/O error is worth retrying. `NotFound` never is.
pub fn is_transient(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::NotFound {
        return false;
    }

    #[cfg(unix)]
    {
        if let Some(code) = err.raw_os_error() {
            return matches!(
                code,
                libc::EMFILE | libc::ENFILE | libc::EBUSY | libc::EAGAIN
            );
        }
    }

    #[cfg(windows)]
    {
        if err.kind() == io::ErrorKind::PermissionDenied {
            return true;
        }
    }

    matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.calculate_delay(0), Duration::ZERO);
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(20));
        assert_eq!(policy.calculate_delay(10), Duration::from_millis(200));
    }

    #[test]
    fn test_not_found_is_never_transient() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(!is_transient(&err));
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::ENOSPC)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = RetryPolicy::default()
            .run("test op", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(io::Error::new(io::ErrorKind::Interrupted, "busy"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: io::Result<()> = RetryPolicy::default()
            .run("test op", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_descriptor_exhaustion_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = RetryPolicy::default()
            .run("open content", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(io::Error::from_raw_os_error(libc::EMFILE))
                    } else {
                        Ok("opened")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "opened");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
