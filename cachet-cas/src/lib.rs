pub mod atomic;
pub mod errors;
pub mod reader;
pub mod retry;
pub mod storage;
pub mod validation;

pub use atomic::{AtomicWriter, CommitOutcome};
pub use errors::{CasError, Result};
pub use reader::{ContentReader, Verified};
pub use retry::RetryPolicy;
pub use storage::{
    BlobCheck, ContentRef, ContentStat, ContentStore, ContentStoreConfig, FsyncPolicy,
    WriteOptions, CONTENT_DIR, TMP_DIR,
};
