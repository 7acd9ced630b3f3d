//! SinkHandle - manages a sink with isolated queue and worker task
//!
//! The worker owns the sink through a shared cell so a publisher can write
//! on its own task when the queue is full and synchronous fallback is on.
//! Packets reach the sink in enqueue order either way: a fallback write
//! first waits for everything already queued to drain.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use contracts::{ContractError, Packet, PacketSink};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::metrics::SinkMetrics;

/// Completion signal for one command
pub(crate) type Ack = oneshot::Sender<Result<(), ContractError>>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub(crate) enum Command {
    Packet {
        packet: Arc<Packet>,
        ack: Option<Ack>,
    },
    Rollover(Ack),
    Flush(Ack),
}

/// Packets accepted by the queue and not yet processed
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct SinkState<S> {
    sink: S,
    consecutive_failures: u32,
}

/// Sink plus the failure bookkeeping shared by worker and fallback writes
struct SinkCell<S> {
    name: String,
    metrics: Arc<SinkMetrics>,
    max_consecutive_failures: u32,
    state: Mutex<SinkState<S>>,
}

impl<S: PacketSink> SinkCell<S> {
    fn disabled_error(&self) -> ContractError {
        ContractError::SinkDisabled {
            sink_name: self.name.clone(),
            failures: self.max_consecutive_failures,
        }
    }

    async fn write(&self, packet: &Arc<Packet>) -> Result<(), ContractError> {
        if self.metrics.is_disabled() {
            self.metrics.inc_skipped_count();
            return Err(self.disabled_error());
        }
        let mut state = self.state.lock().await;
        match state.sink.write(packet).await {
            Ok(()) => {
                state.consecutive_failures = 0;
                self.metrics.inc_write_count();
                metrics::counter!("beacon_sink_writes_total", "sink" => self.name.clone(), "status" => "ok")
                    .increment(1);
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_failure_count();
                metrics::counter!("beacon_sink_writes_total", "sink" => self.name.clone(), "status" => "error")
                    .increment(1);
                error!(
                    sink = %self.name,
                    sequence = packet.sequence,
                    error = %e,
                    "Write failed"
                );
                self.record_failure(&mut state).await;
                Err(e)
            }
        }
    }

    async fn rollover(&self) -> Result<(), ContractError> {
        if self.metrics.is_disabled() {
            return Err(self.disabled_error());
        }
        let mut state = self.state.lock().await;
        let result = state.sink.rollover().await;
        if let Err(e) = &result {
            error!(sink = %self.name, error = %e, "Rollover failed");
            self.record_failure(&mut state).await;
        }
        result
    }

    async fn flush(&self) -> Result<(), ContractError> {
        if self.metrics.is_disabled() {
            return Ok(());
        }
        self.state.lock().await.sink.flush().await
    }

    /// Disable the sink once it has failed too often in a row
    async fn record_failure(&self, state: &mut SinkState<S>) {
        state.consecutive_failures += 1;
        if state.consecutive_failures < self.max_consecutive_failures {
            return;
        }
        self.metrics.set_disabled();
        error!(
            sink = %self.name,
            failures = state.consecutive_failures,
            "Sink disabled after repeated failures"
        );
        if let Err(e) = state.sink.close().await {
            warn!(sink = %self.name, error = %e, "Close failed while disabling");
        }
    }

    async fn shutdown(&self) {
        if self.metrics.is_disabled() {
            return;
        }
        let mut state = self.state.lock().await;
        if let Err(e) = state.sink.flush().await {
            error!(sink = %self.name, error = %e, "Flush failed on shutdown");
        }
        if let Err(e) = state.sink.close().await {
            error!(sink = %self.name, error = %e, "Close failed on shutdown");
        }
    }
}

/// Object-safe entry point for fallback writes
trait InlineWriter: Send + Sync {
    fn write_inline<'a>(&'a self, packet: &'a Arc<Packet>) -> BoxFuture<'a, Result<(), ContractError>>;
}

impl<S: PacketSink + 'static> InlineWriter for SinkCell<S> {
    fn write_inline<'a>(&'a self, packet: &'a Arc<Packet>) -> BoxFuture<'a, Result<(), ContractError>> {
        Box::pin(self.write(packet))
    }
}

/// Handle to a running sink worker
pub struct SinkHandle {
    name: String,
    durable: bool,
    /// Channel to send commands to worker
    tx: mpsc::Sender<Command>,
    metrics: Arc<SinkMetrics>,
    in_flight: Arc<InFlight>,
    inline: Arc<dyn InlineWriter>,
    worker_handle: JoinHandle<()>,
}

impl SinkHandle {
    /// Create a new SinkHandle and spawn the worker task
    pub fn spawn<S: PacketSink + 'static>(
        sink: S,
        queue_capacity: usize,
        max_consecutive_failures: u32,
    ) -> Self {
        let name = sink.name().to_string();
        let durable = sink.is_durable();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let metrics = Arc::new(SinkMetrics::new());
        let in_flight = Arc::new(InFlight::default());

        let cell = Arc::new(SinkCell {
            name: name.clone(),
            metrics: Arc::clone(&metrics),
            max_consecutive_failures: max_consecutive_failures.max(1),
            state: Mutex::new(SinkState {
                sink,
                consecutive_failures: 0,
            }),
        });

        let worker_cell = Arc::clone(&cell);
        let worker_in_flight = Arc::clone(&in_flight);
        let worker_name = name.clone();
        let worker_handle = tokio::spawn(async move {
            sink_worker(worker_cell, rx, worker_in_flight, worker_name).await;
        });

        Self {
            name,
            durable,
            tx,
            metrics,
            in_flight,
            inline: cell,
            worker_handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether acknowledgements from this sink satisfy `WaitForCommit`
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    /// Hand a packet to the sink
    ///
    /// When the queue is full this waits for space, or with
    /// `force_synchronous` writes the packet on the caller once the queue
    /// has drained. Returns false only if the worker is gone.
    pub(crate) async fn enqueue(
        &self,
        packet: Arc<Packet>,
        ack: Option<Ack>,
        force_synchronous: bool,
    ) -> bool {
        self.in_flight.begin();
        let command = match self.tx.try_send(Command::Packet { packet, ack }) {
            Ok(()) => {
                self.record_queue_len();
                return true;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.in_flight.end();
                error!(sink = %self.name, "Sink worker closed unexpectedly");
                return false;
            }
            Err(mpsc::error::TrySendError::Full(command)) => command,
        };

        if !force_synchronous {
            debug!(sink = %self.name, "Queue full, waiting for space");
            if self.tx.send(command).await.is_err() {
                self.in_flight.end();
                error!(sink = %self.name, "Sink worker closed unexpectedly");
                return false;
            }
            self.record_queue_len();
            return true;
        }

        self.in_flight.end();
        let Command::Packet { packet, ack } = command else {
            return false;
        };
        self.metrics.inc_sync_fallback_count();
        metrics::counter!("beacon_sync_fallbacks_total", "sink" => self.name.clone()).increment(1);
        debug!(sink = %self.name, sequence = packet.sequence, "Queue full, writing synchronously");
        self.in_flight.wait_idle().await;
        let result = self.inline.write_inline(&packet).await;
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        true
    }

    /// Close the current output unit, after everything queued before it
    pub async fn rollover(&self) -> Result<(), ContractError> {
        self.control(Command::Rollover).await
    }

    /// Flush the sink, after everything queued before it
    pub async fn flush(&self) -> Result<(), ContractError> {
        self.control(Command::Flush).await
    }

    async fn control(&self, command: impl FnOnce(Ack) -> Command) -> Result<(), ContractError> {
        let (ack, done) = oneshot::channel();
        let stopped = || ContractError::sink_write(&self.name, "sink worker stopped");
        self.tx.send(command(ack)).await.map_err(|_| stopped())?;
        done.await.map_err(|_| stopped())?
    }

    fn record_queue_len(&self) {
        let len = self.tx.max_capacity() - self.tx.capacity();
        self.metrics.set_queue_len(len);
        metrics::gauge!("beacon_sink_queue_depth", "sink" => self.name.clone()).set(len as f64);
    }

    /// Shutdown the sink worker gracefully
    #[instrument(name = "sink_handle_shutdown", skip(self), fields(sink = %self.name))]
    pub async fn shutdown(self) {
        // Drop sender to signal worker to stop
        drop(self.tx);
        if let Err(e) = self.worker_handle.await {
            error!(sink = %self.name, error = ?e, "Worker task panicked");
        }
        debug!(sink = %self.name, "SinkHandle shutdown complete");
    }
}

/// Worker task that consumes commands and drives the sink
#[instrument(
    name = "sink_worker_loop",
    skip(cell, rx, in_flight),
    fields(sink = %name)
)]
async fn sink_worker<S: PacketSink + 'static>(
    cell: Arc<SinkCell<S>>,
    mut rx: mpsc::Receiver<Command>,
    in_flight: Arc<InFlight>,
    name: String,
) {
    debug!(sink = %name, "Sink worker started");

    while let Some(command) = rx.recv().await {
        cell.metrics.set_queue_len(rx.len());
        match command {
            Command::Packet { packet, ack } => {
                // Failures are counted and logged by the cell; keep going
                let result = cell.write(&packet).await;
                in_flight.end();
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            Command::Rollover(ack) => {
                let _ = ack.send(cell.rollover().await);
            }
            Command::Flush(ack) => {
                let _ = ack.send(cell.flush().await);
            }
        }
    }

    cell.shutdown().await;
    debug!(sink = %name, "Sink worker stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use contracts::{LogMessage, Severity};
    use std::sync::atomic::AtomicU64;
    use tokio::time::{sleep, Duration};

    /// Mock sink recording the sequences it wrote
    pub(crate) struct MockSink {
        pub name: String,
        pub written: Arc<std::sync::Mutex<Vec<u64>>>,
        pub rollovers: Arc<AtomicU64>,
        pub should_fail: bool,
        pub durable: bool,
        pub delay_ms: u64,
    }

    impl MockSink {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                written: Arc::default(),
                rollovers: Arc::default(),
                should_fail: false,
                durable: false,
                delay_ms: 0,
            }
        }
    }

    impl PacketSink for MockSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_durable(&self) -> bool {
            self.durable
        }

        async fn write(&mut self, packet: &Arc<Packet>) -> Result<(), ContractError> {
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.should_fail {
                return Err(ContractError::sink_write(&self.name, "mock failure"));
            }
            self.written.lock().unwrap().push(packet.sequence);
            Ok(())
        }

        async fn rollover(&mut self) -> Result<(), ContractError> {
            self.rollovers.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), ContractError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ContractError> {
            Ok(())
        }
    }

    pub(crate) fn message(sequence: u64) -> Arc<Packet> {
        Packet {
            sequence,
            ..Packet::new(LogMessage::new(Severity::Information, "Test", "message"))
        }
        .shared()
    }

    #[tokio::test]
    async fn test_sink_handle_basic() {
        let sink = MockSink::new("test");
        let written = Arc::clone(&sink.written);
        let handle = SinkHandle::spawn(sink, 10, 5);

        for i in 1..=5 {
            assert!(handle.enqueue(message(i), None, false).await);
        }

        handle.shutdown().await;
        assert_eq!(*written.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_full_queue_waits_instead_of_dropping() {
        let mut sink = MockSink::new("slow");
        sink.delay_ms = 5;
        let written = Arc::clone(&sink.written);
        let handle = SinkHandle::spawn(sink, 2, 5);

        for i in 1..=10 {
            assert!(handle.enqueue(message(i), None, false).await);
        }
        assert_eq!(handle.metrics().sync_fallback_count(), 0);

        handle.shutdown().await;
        assert_eq!(*written.lock().unwrap(), (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_synchronous_fallback_keeps_order() {
        let mut sink = MockSink::new("slow");
        sink.delay_ms = 5;
        let written = Arc::clone(&sink.written);
        let handle = SinkHandle::spawn(sink, 1, 5);

        for i in 1..=8 {
            assert!(handle.enqueue(message(i), None, true).await);
        }
        assert!(handle.metrics().sync_fallback_count() > 0);

        handle.shutdown().await;
        assert_eq!(*written.lock().unwrap(), (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fallback_write_is_acknowledged() {
        let mut sink = MockSink::new("slow");
        sink.delay_ms = 5;
        let handle = SinkHandle::spawn(sink, 1, 5);

        let mut acks = Vec::new();
        for i in 1..=4 {
            let (ack, done) = oneshot::channel();
            handle.enqueue(message(i), Some(ack), true).await;
            acks.push(done);
        }
        for done in acks {
            assert!(done.await.unwrap().is_ok());
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_sink_disables_after_repeated_failures() {
        let mut sink = MockSink::new("failing");
        sink.should_fail = true;
        let handle = SinkHandle::spawn(sink, 10, 3);

        for i in 1..=5 {
            handle.enqueue(message(i), None, false).await;
        }
        handle.flush().await.unwrap();

        let snapshot = handle.metrics().snapshot();
        assert_eq!(snapshot.failure_count, 3);
        assert_eq!(snapshot.skipped_count, 2);
        assert!(snapshot.disabled);
        assert!(matches!(
            handle.rollover().await,
            Err(ContractError::SinkDisabled { .. })
        ));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_rollover_runs_after_queued_packets() {
        let mut sink = MockSink::new("rolling");
        sink.delay_ms = 2;
        let written = Arc::clone(&sink.written);
        let rollovers = Arc::clone(&sink.rollovers);
        let handle = SinkHandle::spawn(sink, 10, 5);

        for i in 1..=3 {
            handle.enqueue(message(i), None, false).await;
        }
        handle.rollover().await.unwrap();
        assert_eq!(written.lock().unwrap().len(), 3);
        assert_eq!(rollovers.load(Ordering::Relaxed), 1);

        handle.shutdown().await;
    }
}
