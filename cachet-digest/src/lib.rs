//! Integrity digests for the cachet content store.
//!
//! An [`Integrity`] is one or more [`Hash`] values computed over the exact
//! bytes of a payload. It is the sole addressing key of the content store and
//! has a stable string form, `<algorithm>-<base64>`, with multiple hashes
//! joined by spaces.

pub mod errors;
pub mod hash;
pub mod hasher;

pub use errors::{DigestError, Result};
pub use hash::{Algorithm, Encoding, Hash, Integrity};
pub use hasher::IntegrityHasher;
