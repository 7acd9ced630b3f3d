//! NetworkSink - live packet stream to a TCP collector
//!
//! Every connection carries a self-contained stream: the fragment preamble,
//! a `SessionHeader`, then packets with their dependencies. The connection
//! is opened lazily and dropped on the first error; the next write
//! reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use codec::{DependencyTable, PacketWriter};
use contracts::{now, ContractError, Packet, PacketSink, SessionHeader, SessionIdentity};
use repository::{FRAGMENT_FORMAT_VERSION, FRAGMENT_MAGIC};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Configuration for NetworkSink
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSinkConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl NetworkSinkConfig {
    /// Create config from params map
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, String> {
        let host = params
            .get("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| "missing 'host' parameter".to_string())?
            .clone();

        let port_str = params
            .get("port")
            .ok_or_else(|| "missing 'port' parameter".to_string())?;
        let port: u16 = port_str
            .parse()
            .map_err(|e| format!("invalid port '{}': {}", port_str, e))?;

        let connect_timeout = match params.get("connect_timeout_ms") {
            Some(ms) => Duration::from_millis(
                ms.parse()
                    .map_err(|e| format!("invalid connect_timeout_ms '{}': {}", ms, e))?,
            ),
            None => Duration::from_secs(5),
        };

        Ok(Self {
            host,
            port,
            connect_timeout,
        })
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Connection {
    stream: TcpStream,
    writer: PacketWriter<Vec<u8>>,
}

/// Sink that streams packets over TCP
pub struct NetworkSink {
    name: String,
    config: NetworkSinkConfig,
    identity: SessionIdentity,
    connection: Option<Connection>,
    /// Dependency targets carried into the next connection
    known: DependencyTable,
    connections: u32,
}

impl NetworkSink {
    pub fn new(name: impl Into<String>, config: NetworkSinkConfig, identity: SessionIdentity) -> Self {
        Self {
            name: name.into(),
            config,
            identity,
            connection: None,
            known: DependencyTable::new(),
            connections: 0,
        }
    }

    /// Create from params (for factory)
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
        identity: SessionIdentity,
    ) -> Result<Self, ContractError> {
        let name = name.into();
        let config = NetworkSinkConfig::from_params(params)
            .map_err(|e| ContractError::sink_connection(&name, e))?;
        Ok(Self::new(name, config, identity))
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    #[instrument(name = "network_sink_connect", skip(self), fields(sink = %self.name))]
    async fn connect(&mut self) -> Result<&mut Connection, ContractError> {
        if self.connection.is_none() {
            let addr = self.config.addr();
            let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| ContractError::sink_connection(&self.name, format!("connect to {addr} timed out")))?
                .map_err(|e| ContractError::sink_connection(&self.name, format!("connect to {addr}: {e}")))?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(sink = %self.name, error = %e, "Could not set TCP_NODELAY");
            }

            let mut preamble = Vec::with_capacity(256);
            preamble.extend_from_slice(FRAGMENT_MAGIC);
            preamble.extend_from_slice(&FRAGMENT_FORMAT_VERSION.to_le_bytes());
            let mut writer = PacketWriter::with_known(preamble, std::mem::take(&mut self.known));
            let header = Packet::new(SessionHeader {
                identity: self.identity.clone(),
                fragment_index: self.connections,
                fragment_start: now(),
            })
            .shared();
            writer
                .write(&header)
                .map_err(|e| ContractError::sink_write(&self.name, e.to_string()))?;

            self.connections += 1;
            debug!(sink = %self.name, %addr, "NetworkSink connected");
            self.connection = Some(Connection { stream, writer });
        }
        self.connection
            .as_mut()
            .ok_or_else(|| ContractError::sink_connection(&self.name, "not connected"))
    }

    /// Forget the connection, keeping what it learned about dependencies
    fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            self.known = connection.writer.take_known();
        }
    }

    async fn transmit(&mut self, packet: &Arc<Packet>) -> Result<(), ContractError> {
        let name = self.name.clone();
        let connection = self.connect().await?;
        connection
            .writer
            .write(packet)
            .map_err(|e| ContractError::sink_write(&name, e.to_string()))?;
        let pending = std::mem::take(connection.writer.get_mut());
        connection
            .stream
            .write_all(&pending)
            .await
            .map_err(|e| ContractError::sink_write(&name, e.to_string()))
    }
}

impl PacketSink for NetworkSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_durable(&self) -> bool {
        false
    }

    #[instrument(
        name = "network_sink_write",
        skip(self, packet),
        fields(sink = %self.name, sequence = packet.sequence)
    )]
    async fn write(&mut self, packet: &Arc<Packet>) -> Result<(), ContractError> {
        let result = self.transmit(packet).await;
        if let Err(e) = &result {
            warn!(sink = %self.name, error = %e, "Send failed, dropping connection");
            self.disconnect();
        }
        result
    }

    /// Live streams have no output units
    async fn rollover(&mut self) -> Result<(), ContractError> {
        Ok(())
    }

    #[instrument(name = "network_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), ContractError> {
        if let Some(connection) = self.connection.as_mut() {
            connection.stream.flush().await?;
        }
        Ok(())
    }

    #[instrument(name = "network_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        if let Some(connection) = self.connection.as_mut() {
            if let Err(e) = connection.stream.shutdown().await {
                debug!(sink = %self.name, error = %e, "Shutdown failed");
            }
        }
        self.disconnect();
        debug!(sink = %self.name, "NetworkSink closed");
        Ok(())
    }
}
