use cachet_cas::CasError;
use cachet_index::IndexError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Content store error: {0}")]
    Cas(#[from] CasError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Invalid verify options: {0}")]
    InvalidOptions(String),

    #[error("Cache root {path:?} is inaccessible: {source}")]
    RootInaccessible {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Verify worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, VerifyError>;
