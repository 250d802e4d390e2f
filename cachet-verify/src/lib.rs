//! Verification and garbage collection for a cachet root.
//!
//! A pass runs these steps in order, each contributing to one
//! [`VerifyReport`]:
//!
//! 1. ownership repair
//! 2. mark-and-sweep over the content store
//! 3. index rebuild, dropping entries whose content is gone
//! 4. temp workspace cleanup
//! 5. marker write
//!
//! Any error aborts the pass before the marker is written.

pub mod errors;
pub mod marker;
pub mod options;
pub mod report;
pub mod verifier;

pub use errors::{Result, VerifyError};
pub use marker::{last_run, LAST_VERIFIED_FILE};
pub use options::{EntryFilter, Owner, VerifyOptions};
pub use report::{StepTimings, VerifyReport};
pub use verifier::{verify, Verifier};
