//! Messenger - sequences published packets and fans them out to sinks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use contracts::{
    AgentConfig, ContractError, Packet, PacketSink, PublishMode, SessionClose, SessionIdentity,
    SinkConfig, SinkType,
};
use repository::{FragmentLedger, Repository};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::{MessengerError, PublishError};
use crate::handle::SinkHandle;
use crate::metrics::{MetricsSnapshot, SinkMetrics};
use crate::sinks::{ExportSink, FileSink, FileSinkConfig, NetworkSink};

type SinkFactory = Box<dyn FnOnce(usize, u32) -> SinkHandle + Send>;

/// Builder for creating a Messenger
pub struct MessengerBuilder {
    config: AgentConfig,
    identity: Option<SessionIdentity>,
    repository: Option<Arc<Repository>>,
    extra_sinks: Vec<SinkFactory>,
}

impl MessengerBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            identity: None,
            repository: None,
            extra_sinks: Vec::new(),
        }
    }

    /// Record under this identity instead of a fresh one from the config
    pub fn identity(mut self, identity: SessionIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Repository the file sink writes into; shares its fragment ledger
    pub fn repository(mut self, repository: Arc<Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Add a sink that is not described by the configuration
    pub fn sink<S: PacketSink + 'static>(mut self, sink: S) -> Self {
        self.extra_sinks.push(Box::new(move |capacity, failures| {
            SinkHandle::spawn(sink, capacity, failures)
        }));
        self
    }

    /// Create every sink and start its worker
    #[instrument(name = "messenger_builder_build", skip(self), fields(sink_count = self.config.sinks.len()))]
    pub async fn build(self) -> Result<Messenger, MessengerError> {
        let identity = self
            .identity
            .unwrap_or_else(|| self.config.session.to_identity());
        let needs_repository = self
            .config
            .sinks
            .iter()
            .any(|s| s.sink_type == SinkType::File);
        let repository = match (self.repository, needs_repository) {
            (Some(repository), _) => Some(repository),
            (None, true) => Some(Arc::new(Repository::from_config(
                &self.config.repository,
                Arc::new(FragmentLedger::new()),
            )?)),
            (None, false) => None,
        };

        let mut handles = Vec::with_capacity(self.config.sinks.len() + self.extra_sinks.len());
        for sink_config in &self.config.sinks {
            handles.push(create_sink_handle(
                &self.config,
                sink_config,
                &identity,
                repository.as_deref(),
            )?);
        }
        let failures = self.config.messenger.max_consecutive_failures;
        for factory in self.extra_sinks {
            handles.push(factory(self.config.messenger.max_queue_length, failures));
        }

        info!(
            session_id = %identity.session_id,
            sinks = handles.len(),
            "Messenger started"
        );
        Ok(Messenger::new(
            identity,
            handles,
            self.config.messenger.force_synchronous,
            repository,
        ))
    }
}

/// Create a SinkHandle from configuration
#[instrument(
    name = "messenger_create_sink_handle",
    skip(config, sink, identity, repository),
    fields(sink = %sink.name, sink_type = ?sink.sink_type)
)]
fn create_sink_handle(
    config: &AgentConfig,
    sink: &SinkConfig,
    identity: &SessionIdentity,
    repository: Option<&Repository>,
) -> Result<SinkHandle, MessengerError> {
    let capacity = config.queue_capacity(sink);
    let failures = config.messenger.max_consecutive_failures;
    match sink.sink_type {
        SinkType::File => {
            let repository = repository
                .ok_or_else(|| MessengerError::sink_creation(&sink.name, "no repository"))?;
            let file_config =
                FileSinkConfig::from_repository(repository, &config.repository, identity);
            let file = FileSink::new(
                &sink.name,
                file_config,
                identity.clone(),
                Arc::clone(repository.ledger()),
            )
            .map_err(|e| MessengerError::sink_creation(&sink.name, e.to_string()))?;
            Ok(SinkHandle::spawn(file, capacity, failures))
        }
        SinkType::Network => {
            let network = NetworkSink::from_params(&sink.name, &sink.params, identity.clone())
                .map_err(|e| MessengerError::sink_creation(&sink.name, e.to_string()))?;
            Ok(SinkHandle::spawn(network, capacity, failures))
        }
        SinkType::Export => {
            let export = ExportSink::from_params(&sink.name, &sink.params)
                .map_err(|e| MessengerError::sink_creation(&sink.name, e.to_string()))?;
            Ok(SinkHandle::spawn(export, capacity, failures))
        }
    }
}

struct PublishState {
    last_sequence: u64,
    handles: Vec<SinkHandle>,
    closed: bool,
}

/// Acknowledgement awaited by a waiting publish
struct Pending {
    sink: String,
    durable: bool,
    done: oneshot::Receiver<Result<(), ContractError>>,
}

/// Session-scoped packet fan-out
///
/// Sequence numbers are assigned under the same lock that enqueues the
/// packet on every sink, so each sink sees packets in sequence order.
pub struct Messenger {
    identity: SessionIdentity,
    force_synchronous: bool,
    state: Mutex<PublishState>,
    last_sequence: AtomicU64,
    sink_metrics: Vec<(String, Arc<SinkMetrics>)>,
    repository: Option<Arc<Repository>>,
    runtime: Handle,
}

impl Messenger {
    pub fn builder(config: AgentConfig) -> MessengerBuilder {
        MessengerBuilder::new(config)
    }

    /// Messenger over already spawned sink handles
    ///
    /// Must be called inside a tokio runtime, like `SinkHandle::spawn`.
    #[cfg(test)]
    fn with_handles(
        identity: SessionIdentity,
        handles: Vec<SinkHandle>,
        force_synchronous: bool,
    ) -> Self {
        Self::new(identity, handles, force_synchronous, None)
    }

    fn new(
        identity: SessionIdentity,
        handles: Vec<SinkHandle>,
        force_synchronous: bool,
        repository: Option<Arc<Repository>>,
    ) -> Self {
        let sink_metrics = handles
            .iter()
            .map(|h| (h.name().to_string(), Arc::clone(h.metrics())))
            .collect();
        Self {
            identity,
            force_synchronous,
            state: Mutex::new(PublishState {
                last_sequence: 0,
                handles,
                closed: false,
            }),
            last_sequence: AtomicU64::new(0),
            sink_metrics,
            repository,
            runtime: Handle::current(),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Repository the file sink writes into, if there is one
    pub fn repository(&self) -> Option<&Arc<Repository>> {
        self.repository.as_ref()
    }

    /// Highest sequence handed out so far
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Get metrics for all sinks
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.sink_metrics
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
            .collect()
    }

    /// Publish a packet; returns its sequence number
    ///
    /// `Queued` returns once every sink has the packet, and never reports
    /// sink failures. `WaitForCommit` waits for the durable sinks and
    /// succeeds when one of them persisted the packet; without a durable
    /// sink it behaves like `WaitForTask`, which waits for every sink and
    /// fails on the first sink error.
    pub async fn publish(
        &self,
        packet: impl Into<Arc<Packet>>,
        mode: PublishMode,
    ) -> Result<u64, PublishError> {
        let packet = packet.into();
        if packet.is_header() {
            return Err(PublishError::Reserved(packet.type_name().to_string()));
        }
        let mut state = self.state.lock().await;
        let (sequence, pending) = self.dispatch_locked(&mut state, packet, mode).await?;
        drop(state);
        wait_for(pending, mode).await?;
        Ok(sequence)
    }

    /// [`publish`](Self::publish) for threads outside the runtime
    ///
    /// Must not be called from async code.
    pub fn publish_blocking(
        &self,
        packet: impl Into<Arc<Packet>>,
        mode: PublishMode,
    ) -> Result<u64, PublishError> {
        self.runtime.block_on(self.publish(packet, mode))
    }

    async fn dispatch_locked(
        &self,
        state: &mut PublishState,
        packet: Arc<Packet>,
        mode: PublishMode,
    ) -> Result<(u64, Vec<Pending>), PublishError> {
        if state.closed {
            return Err(PublishError::Closed);
        }
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        let mut packet = Arc::unwrap_or_clone(packet);
        packet.sequence = sequence;
        let packet = Arc::new(packet);

        let has_durable = state.handles.iter().any(SinkHandle::is_durable);
        let mut pending = Vec::new();
        for handle in &state.handles {
            let wants_ack = match mode {
                PublishMode::Queued => false,
                PublishMode::WaitForCommit => handle.is_durable() || !has_durable,
                PublishMode::WaitForTask => true,
            };
            let ack = if wants_ack {
                let (ack, done) = oneshot::channel();
                pending.push(Pending {
                    sink: handle.name().to_string(),
                    durable: handle.is_durable(),
                    done,
                });
                Some(ack)
            } else {
                None
            };
            // A dead worker drops the ack; the waiter reports it
            handle
                .enqueue(Arc::clone(&packet), ack, self.force_synchronous)
                .await;
        }

        self.last_sequence.store(sequence, Ordering::Release);
        metrics::counter!("beacon_packets_published_total").increment(1);
        Ok((sequence, pending))
    }

    /// Close every sink's current output unit and start a new one
    ///
    /// Waits until all packets published before the call are written.
    #[instrument(name = "messenger_rollover", skip(self))]
    pub async fn rollover(&self) -> Result<(), MessengerError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(PublishError::Closed.into());
        }
        for handle in &state.handles {
            if handle.metrics().is_disabled() {
                continue;
            }
            handle.rollover().await?;
        }
        debug!(session_id = %self.identity.session_id, "Rollover complete");
        Ok(())
    }

    /// End the session: write `SessionClose` and stop every sink
    ///
    /// Calling it again is a no-op.
    #[instrument(name = "messenger_close", skip(self), fields(session_id = %self.identity.session_id))]
    pub async fn close(&self) -> Result<(), MessengerError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let close = Packet::new(SessionClose::normal()).shared();
        let dispatched = self
            .dispatch_locked(&mut state, close, PublishMode::WaitForCommit)
            .await;
        state.closed = true;
        let handles = std::mem::take(&mut state.handles);
        drop(state);

        let result = match dispatched {
            Ok((_, pending)) => wait_for(pending, PublishMode::WaitForCommit).await,
            Err(e) => Err(e),
        };
        for handle in handles {
            handle.shutdown().await;
        }
        info!(last_sequence = self.last_sequence(), "Messenger closed");
        result.map_err(Into::into)
    }
}

/// Wait for acknowledgements per the publish mode
async fn wait_for(pending: Vec<Pending>, mode: PublishMode) -> Result<(), PublishError> {
    if pending.is_empty() {
        return Ok(());
    }
    let commit_only = mode == PublishMode::WaitForCommit && pending.iter().all(|p| p.durable);
    let mut first_error = None;
    let mut committed = false;
    for Pending { sink, done, .. } in pending {
        let result = done
            .await
            .unwrap_or_else(|_| Err(ContractError::sink_write(&sink, "sink worker stopped")));
        match result {
            Ok(()) => committed = true,
            Err(e) => {
                warn!(sink = %sink, error = %e, "Sink did not process packet");
                first_error.get_or_insert(PublishError::sink(sink, e));
            }
        }
    }
    match first_error {
        Some(_) if commit_only && committed => Ok(()),
        Some(e) => Err(e),
        None => Ok(()),
    }
}
