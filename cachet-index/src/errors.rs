use cachet_cas::CasError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Content store error: {0}")]
    Cas(#[from] CasError),
}

pub type Result<T> = std::result::Result<T, IndexError>;
