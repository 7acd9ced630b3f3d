//! Messenger error types

use contracts::ContractError;
use repository::RepositoryError;
use thiserror::Error;

/// Why a publish call did not succeed
#[derive(Debug, Error)]
pub enum PublishError {
    /// The messenger was closed
    #[error("messenger is closed")]
    Closed,

    /// Boundary packets are written by sinks themselves
    #[error("{0} packets cannot be published")]
    Reserved(String),

    /// A sink failed to process the packet (wait modes only)
    #[error("sink '{sink}' failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: ContractError,
    },
}

impl PublishError {
    pub fn sink(sink: impl Into<String>, source: ContractError) -> Self {
        Self::Sink {
            sink: sink.into(),
            source,
        }
    }
}

/// Messenger setup and lifecycle errors
#[derive(Debug, Error)]
pub enum MessengerError {
    /// Sink creation error
    #[error("failed to create sink '{name}': {message}")]
    SinkCreation { name: String, message: String },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Sink error (from contract)
    #[error("sink error: {0}")]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl MessengerError {
    /// Create a sink creation error
    pub fn sink_creation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkCreation {
            name: name.into(),
            message: message.into(),
        }
    }
}
