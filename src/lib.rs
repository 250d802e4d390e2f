//! Cachet: a disk-resident, content-addressable cache.
//!
//! Payloads are stored once per digest under `content-v2/`, keys are mapped
//! to them by an append-only index under `index-v5/`, and a verify pass
//! garbage-collects unreferenced or corrupt blobs.
//!
//! The building blocks are separate crates, re-exported here:
//!
//! - [`digest`]: integrity strings and hashing
//! - [`cas`]: the content store
//! - [`index`]: key index backends
//! - [`verify`]: verification and garbage collection
//!
//! [`Cache`] ties them together.

pub mod cache;
pub mod config;
pub mod errors;
pub mod memo;

pub use cachet_cas as cas;
pub use cachet_digest as digest;
pub use cachet_index as index;
pub use cachet_verify as verify;

pub use cache::{Cache, PutOptions};
pub use config::{CacheConfig, IndexBackend};
pub use errors::{CacheError, Result};
pub use memo::Memoizer;

pub use cachet_cas::{ContentReader, Verified};
pub use cachet_digest::{Algorithm, Hash, Integrity};
pub use cachet_index::{Entry, EntryStream, KeyIndex};
pub use cachet_verify::{Owner, VerifyOptions, VerifyReport};
