use cachet_cas::CasError;
use cachet_digest::{DigestError, Integrity};
use cachet_index::IndexError;
use cachet_verify::VerifyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No cache entry for key {0:?}")]
    NotFound(String),

    #[error("Content not found: {0}")]
    ContentNotFound(Integrity),

    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        expected: Integrity,
        actual: Integrity,
    },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Content store error: {0}")]
    Cas(CasError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Verify error: {0}")]
    Verify(#[from] VerifyError),

    #[error("Digest error: {0}")]
    Digest(#[from] DigestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// True for a missing key or missing content.
    pub fn is_not_found(&self) -> bool {
        match self {
            CacheError::NotFound(_) | CacheError::ContentNotFound(_) => true,
            CacheError::Cas(e) => e.is_not_found(),
            CacheError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when stored bytes did not match their digest or size.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CacheError::IntegrityMismatch { .. } | CacheError::SizeMismatch { .. }
        )
    }
}

impl From<CasError> for CacheError {
    fn from(e: CasError) -> Self {
        match e {
            CasError::NotFound(integrity) => CacheError::ContentNotFound(integrity),
            CasError::IntegrityMismatch { expected, actual } => {
                CacheError::IntegrityMismatch { expected, actual }
            }
            CasError::SizeMismatch { expected, actual } => {
                CacheError::SizeMismatch { expected, actual }
            }
            other => CacheError::Cas(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
