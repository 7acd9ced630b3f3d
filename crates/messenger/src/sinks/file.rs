//! FileSink - writes the session as fragment files in the repository

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use codec::DependencyTable;
use contracts::{ContractError, Packet, PacketPayload, PacketSink, RepositoryConfig, SessionIdentity};
use repository::{FragmentLedger, FragmentWriter, Repository, RepositoryError};
use tracing::{debug, info, instrument};

/// Configuration for FileSink
#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    /// `{repository}/{product}/{application}`
    pub dir: PathBuf,
    /// Roll over once the active fragment reaches this many bytes
    pub max_fragment_size: u64,
    /// Roll over once the active fragment is this old
    pub max_fragment_duration: Duration,
}

impl FileSinkConfig {
    pub fn from_repository(
        repository: &Repository,
        config: &RepositoryConfig,
        identity: &SessionIdentity,
    ) -> Self {
        Self {
            dir: repository.session_dir(&identity.product, &identity.application),
            max_fragment_size: config.max_fragment_size_kb.saturating_mul(1024),
            max_fragment_duration: Duration::from_secs(config.max_fragment_duration_secs),
        }
    }
}

/// Durable sink writing the session to fragment files
pub struct FileSink {
    name: String,
    config: FileSinkConfig,
    identity: SessionIdentity,
    ledger: Arc<FragmentLedger>,
    current: Option<FragmentWriter>,
    next_index: u32,
    /// Dependency targets carried into the next fragment
    known: DependencyTable,
    session_ended: bool,
}

impl FileSink {
    /// Create the sink and its first fragment
    pub fn new(
        name: impl Into<String>,
        config: FileSinkConfig,
        identity: SessionIdentity,
        ledger: Arc<FragmentLedger>,
    ) -> Result<Self, RepositoryError> {
        let mut sink = Self {
            name: name.into(),
            config,
            identity,
            ledger,
            current: None,
            next_index: 0,
            known: DependencyTable::new(),
            session_ended: false,
        };
        sink.open_next()?;
        Ok(sink)
    }

    /// Path of the fragment being written
    pub fn current_path(&self) -> Option<&std::path::Path> {
        self.current.as_ref().map(FragmentWriter::path)
    }

    fn open_next(&mut self) -> Result<(), RepositoryError> {
        let writer = FragmentWriter::create(
            &self.config.dir,
            &self.identity,
            self.next_index,
            std::mem::take(&mut self.known),
            Arc::clone(&self.ledger),
        )?;
        debug!(sink = %self.name, index = self.next_index, "Fragment opened");
        self.next_index += 1;
        self.current = Some(writer);
        Ok(())
    }

    fn finish_current(&mut self, session_ended: bool) -> Result<(), RepositoryError> {
        if let Some(writer) = self.current.take() {
            let (fragment, known) = writer.finish(session_ended)?;
            self.known = known;
            info!(
                sink = %self.name,
                index = fragment.index,
                size = fragment.size,
                session_ended,
                "Fragment closed"
            );
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<(), RepositoryError> {
        self.finish_current(false)?;
        self.open_next()?;
        metrics::counter!("beacon_fragments_rolled_total").increment(1);
        Ok(())
    }

    fn persist(&mut self, packet: &Arc<Packet>) -> Result<(), RepositoryError> {
        if self.session_ended {
            debug!(sink = %self.name, sequence = packet.sequence, "Session ended, packet ignored");
            return Ok(());
        }
        if self.current.is_none() {
            self.open_next()?;
        }
        let Some(writer) = self.current.as_mut() else {
            return Ok(());
        };
        writer.write(packet)?;
        if matches!(packet.payload, PacketPayload::SessionClose(_)) {
            self.session_ended = true;
            writer.flush()?;
            return Ok(());
        }
        let full = writer.size() >= self.config.max_fragment_size
            || writer.age() >= self.config.max_fragment_duration;
        if full {
            self.roll()?;
        }
        Ok(())
    }

    fn sink_error(&self, e: RepositoryError) -> ContractError {
        ContractError::sink_write(&self.name, e.to_string())
    }
}

impl PacketSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_durable(&self) -> bool {
        true
    }

    #[instrument(
        name = "file_sink_write",
        skip(self, packet),
        fields(sink = %self.name, sequence = packet.sequence)
    )]
    async fn write(&mut self, packet: &Arc<Packet>) -> Result<(), ContractError> {
        self.persist(packet).map_err(|e| self.sink_error(e))?;
        // Durable means on disk before acknowledging
        if let Some(writer) = self.current.as_mut() {
            writer.flush().map_err(|e| ContractError::sink_write(&self.name, e.to_string()))?;
        }
        Ok(())
    }

    #[instrument(name = "file_sink_rollover", skip(self), fields(sink = %self.name))]
    async fn rollover(&mut self) -> Result<(), ContractError> {
        if self.session_ended {
            return Ok(());
        }
        self.roll().map_err(|e| self.sink_error(e))
    }

    #[instrument(name = "file_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), ContractError> {
        if let Some(writer) = self.current.as_mut() {
            writer.flush().map_err(|e| ContractError::sink_write(&self.name, e.to_string()))?;
        }
        Ok(())
    }

    #[instrument(name = "file_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        let session_ended = self.session_ended;
        self.finish_current(session_ended)
            .map_err(|e| self.sink_error(e))?;
        debug!(sink = %self.name, "FileSink closed");
        Ok(())
    }
}
