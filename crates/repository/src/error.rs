//! Repository error types

use std::path::PathBuf;

use codec::CodecError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// File is not a fragment or has an unknown format version
    #[error("invalid fragment {path}: {message}")]
    InvalidFragment { path: PathBuf, message: String },

    /// Fragment is still open for writing
    #[error("fragment {0} is open for writing")]
    FragmentOpen(PathBuf),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    /// Operation needs a closed session
    #[error("session {0} is still running")]
    SessionRunning(Uuid),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("index file error: {0}")]
    Index(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepositoryError {
    pub fn invalid_fragment(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidFragment {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
