//! # Messenger
//!
//! Packet delivery pipeline.
//!
//! Responsible for:
//! - Assigning session sequence numbers at publish time
//! - Fan-out to every configured sink through its own bounded queue
//! - Isolating slow or failing sinks from producers
//!
//! A full queue never drops a packet: the publisher waits for space, or with
//! `force_synchronous` writes the packet itself.

pub mod error;
pub mod handle;
pub mod messenger;
pub mod metrics;
pub mod sinks;

pub use contracts::{PacketSink, PublishMode};
pub use error::{MessengerError, PublishError};
pub use handle::SinkHandle;
pub use messenger::{Messenger, MessengerBuilder};
pub use crate::metrics::{MetricsSnapshot, SinkMetrics};
pub use sinks::{
    ExportFormat, ExportSink, ExportSinkConfig, FileSink, FileSinkConfig, NetworkSink,
    NetworkSinkConfig,
};
