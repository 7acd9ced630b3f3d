//! Packager error types

use messenger::MessengerError;
use repository::RepositoryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackagerError {
    /// Missing or invalid destination; never retried
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Delivery failed
    #[error("transport error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        message: String,
        status: Option<u16>,
        recoverable: bool,
    },

    /// Delivery was canceled on request
    #[error("delivery canceled")]
    Canceled,

    /// Malformed package file
    #[error("invalid package: {0}")]
    InvalidPackage(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("messenger error: {0}")]
    Messenger(#[from] MessengerError),

    #[error("manifest encoding error: {0}")]
    Manifest(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackagerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn recoverable(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Transport {
            message: message.into(),
            status,
            recoverable: true,
        }
    }

    pub fn permanent(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Transport {
            message: message.into(),
            status,
            recoverable: false,
        }
    }

    /// Worth retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport { recoverable: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, PackagerError>;
