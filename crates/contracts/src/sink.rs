//! PacketSink trait - Messenger output interface
//!
//! Defines the abstract interface for Sinks.

use std::sync::Arc;

use crate::{ContractError, Packet};

/// Packet output trait
///
/// All sink implementations must implement this trait. A sink is owned by
/// exactly one worker at a time and sees packets in sequence order.
#[trait_variant::make(PacketSink: Send)]
pub trait LocalPacketSink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Durable sinks satisfy `PublishMode::WaitForCommit`
    fn is_durable(&self) -> bool;

    /// Write one packet
    ///
    /// # Errors
    /// Returns write error (should include context)
    async fn write(&mut self, packet: &Arc<Packet>) -> Result<(), ContractError>;

    /// Close the current output unit and start a new one (no-op for most sinks)
    async fn rollover(&mut self) -> Result<(), ContractError>;

    /// Flush buffer (if any)
    async fn flush(&mut self) -> Result<(), ContractError>;

    /// Close sink
    async fn close(&mut self) -> Result<(), ContractError>;
}
