use cachet_digest::{DigestError, Integrity};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Content not found: {0}")]
    NotFound(Integrity),

    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        expected: Integrity,
        actual: Integrity,
    },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Object size {size} exceeds maximum {max}")]
    ObjectTooLarge { size: u64, max: u64 },

    #[error("Invalid digest: {0}")]
    Digest(#[from] DigestError),
}

impl CasError {
    pub fn is_not_found(&self) -> bool {
        match self {
            CasError::NotFound(_) => true,
            CasError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True for errors that mean the stored bytes are bad, as opposed to
    /// the store being unreachable.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CasError::IntegrityMismatch { .. } | CasError::SizeMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CasError>;
