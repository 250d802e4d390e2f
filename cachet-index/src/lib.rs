//! Key index for the cachet content store.
//!
//! Maps application keys to [`Entry`] records naming the content they
//! point at. Two backends implement [`KeyIndex`]:
//!
//! - [`BucketIndex`]: sharded append-only logs, one line per insert, each
//!   line guarded by a checksum so torn writes are skipped on read.
//! - [`MemoryIndex`]: an in-process table persisted as a periodic JSON
//!   snapshot, revalidated against the content store on load.

pub mod bucket;
pub mod entry;
pub mod errors;
pub mod memory;
pub mod traits;

pub use bucket::{BucketIndex, INDEX_DIR};
pub use entry::{now_millis, Entry, InsertOptions};
pub use errors::{IndexError, Result};
pub use memory::{MemoryIndex, MemoryIndexConfig, MEMORY_INDEX_DIR};
pub use traits::{BucketId, EntryStream, KeyIndex};
