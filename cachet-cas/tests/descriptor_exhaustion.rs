//! Writes and reads ride out a short spell of descriptor exhaustion.
//!
//! Lowers the process-wide open file limit, so it lives in its own test
//! binary with a single test.
#![cfg(unix)]

use cachet_cas::{ContentStore, ContentStoreConfig, FsyncPolicy, RetryPolicy, WriteOptions};
use std::fs::File;
use std::io;
use std::time::Duration;
use tempfile::TempDir;

const LOW_LIMIT: libc::rlim_t = 64;

fn nofile_limit() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    assert_eq!(rc, 0, "getrlimit: {}", io::Error::last_os_error());
    limit
}

fn set_nofile_limit(limit: &libc::rlimit) {
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, limit) };
    assert_eq!(rc, 0, "setrlimit: {}", io::Error::last_os_error());
}

/// Open `/dev/null` until the process runs out of descriptors.
fn exhaust_descriptors() -> Vec<File> {
    let mut held = Vec::new();
    loop {
        match File::open("/dev/null") {
            Ok(file) => held.push(file),
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => return held,
            Err(e) => panic!("unexpected error exhausting descriptors: {}", e),
        }
        assert!(held.len() < 100_000, "descriptor limit not enforced");
    }
}

#[tokio::test]
async fn test_write_and_read_retry_through_descriptor_exhaustion() {
    let temp_dir = TempDir::new().unwrap();
    let config = ContentStoreConfig {
        fsync_policy: FsyncPolicy::Never,
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            ..RetryPolicy::default()
        },
        ..ContentStoreConfig::default()
    };
    let store = ContentStore::new_with_config(temp_dir.path(), config)
        .await
        .unwrap();

    let original = nofile_limit();
    set_nofile_limit(&libc::rlimit {
        rlim_cur: LOW_LIMIT.min(original.rlim_cur),
        rlim_max: original.rlim_max,
    });

    let held = exhaust_descriptors();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3)).await;
        drop(held);
    });
    let written = store.write(b"payload", WriteOptions::default()).await;
    release.await.unwrap();

    let held = exhaust_descriptors();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3)).await;
        drop(held);
    });
    let read = match &written {
        Ok(content) => Some(store.read(&content.integrity, Some(content.size)).await),
        Err(_) => None,
    };
    release.await.unwrap();

    set_nofile_limit(&original);

    let written = written.unwrap();
    assert_eq!(written.size, 7);
    let data = read.unwrap().unwrap();
    assert_eq!(&data[..], b"payload");
}
