//! Sink implementations
//!
//! Contains FileSink, NetworkSink and ExportSink.

mod export;
mod file;
mod network;

pub use self::export::{ExportFormat, ExportSink, ExportSinkConfig};
pub use self::file::{FileSink, FileSinkConfig};
pub use self::network::{NetworkSink, NetworkSinkConfig};
