//! Error types for CLI operations.

use std::path::PathBuf;

use thiserror::Error;

/// Failures the CLI reports with a specific message
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },

    /// Configuration has no file sink, so nothing is recorded to the repository
    #[error("No file sink configured: sessions are not written to {}", repository.display())]
    NoFileSink { repository: PathBuf },

    /// A delivery was canceled by the user
    #[error("Delivery canceled")]
    Canceled,
}

impl CliError {
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }
}
