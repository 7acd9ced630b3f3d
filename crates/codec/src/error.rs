//! Codec error types

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while encoding or decoding packets
#[derive(Debug, Error)]
pub enum CodecError {
    /// Packet written with a newer schema than this reader understands
    #[error("unsupported schema version {version} for '{type_name}' (max supported {max_supported})")]
    SchemaVersionUnsupported {
        type_name: String,
        version: u32,
        max_supported: u32,
    },

    /// Definition header disagrees with the published field list
    #[error("schema mismatch for '{type_name}' v{version}: {message}")]
    SchemaMismatch {
        type_name: String,
        version: u32,
        message: String,
    },

    /// A dependency was not seen earlier in the stream
    #[error("'{type_name}' packet {packet_id} depends on missing packet {dependency}")]
    MissingDependency {
        type_name: String,
        packet_id: Uuid,
        dependency: Uuid,
    },

    /// Field data inside one record could not be decoded
    #[error("corrupt '{type_name}' packet: {source}")]
    CorruptPacket {
        type_name: String,
        #[source]
        source: Box<CodecError>,
    },

    /// Unknown field type code in a definition header
    #[error("unknown field type code {0:#04x}")]
    UnknownFieldType(u8),

    /// Record references a definition index never declared
    #[error("record references undefined packet definition #{0}")]
    UnknownDefinition(u64),

    /// Input ended early
    #[error("truncated data: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// Structurally invalid data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    /// Stream-level errors end a read; the rest only lose one packet
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SchemaVersionUnsupported { .. }
                | Self::SchemaMismatch { .. }
                | Self::MissingDependency { .. }
                | Self::CorruptPacket { .. }
        )
    }

    pub(crate) fn in_packet(self, type_name: &str) -> Self {
        if self.is_fatal() {
            Self::CorruptPacket {
                type_name: type_name.to_string(),
                source: Box::new(self),
            }
        } else {
            self
        }
    }
}

/// Codec Result type alias
pub type Result<T> = std::result::Result<T, CodecError>;
