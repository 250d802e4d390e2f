use thiserror::Error;

use crate::hash::Algorithm;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("Integrity string contains no hashes")]
    Empty,

    #[error("Unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Malformed hash: {0}")]
    Malformed(String),

    #[error("Bad digest length for {algorithm}: expected {expected} bytes, got {actual}")]
    BadLength {
        algorithm: Algorithm,
        expected: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, DigestError>;
