//! Packager - selects sessions, aggregates them and delivers the package
//!
//! Every delivery walks `Idle -> Selecting -> Aggregating -> Delivering ->
//! {Completed | Failed}` and deliveries on one instance never overlap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use contracts::{Criteria, ServerConfig, SessionSummary};
use messenger::Messenger;
use repository::{Repository, RepositoryError};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{PackagerError, Result};
use crate::package::Package;
use crate::transport::{Endpoint, HttpTransport, Transport, Upload};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagerState {
    Idle,
    Selecting,
    Aggregating,
    Delivering,
    Completed,
    Failed,
}

/// How a delivery ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Success,
    Error(String),
    Canceled,
}

impl DeliveryResult {
    fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error(_) => "error",
            Self::Canceled => "canceled",
        }
    }
}

impl<T> From<&Result<T>> for DeliveryResult {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(PackagerError::Canceled) => Self::Canceled,
            Err(e) => Self::Error(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PackagerEvent {
    StateChanged(PackagerState),
    Completed {
        package_id: Option<Uuid>,
        result: DeliveryResult,
    },
}

/// What a finished delivery sent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOutcome {
    /// None when nothing matched
    pub package_id: Option<Uuid>,
    pub sessions: Vec<Uuid>,
    /// Encoded package size
    pub bytes: u64,
    pub destination: Option<PathBuf>,
}

impl SendOutcome {
    /// True when the selection was empty and nothing was produced
    pub fn is_empty(&self) -> bool {
        self.package_id.is_none()
    }
}

/// Options for `send_to_server`
#[derive(Debug, Clone, Default)]
pub struct ServerSendOptions {
    /// Flag delivered sessions as sent
    pub mark_as_read: bool,
    /// Delete delivered sessions once the collector confirmed them
    pub purge_after_send: bool,
    /// Replaces the packager's server configuration for this send
    pub server: Option<ServerConfig>,
}

/// Handle of a background server send
pub struct SendHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<SendOutcome>>,
}

impl SendHandle {
    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this send; outlives `wait`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<SendOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(PackagerError::Canceled),
        }
    }
}

/// Session packager
pub struct Packager<T = HttpTransport> {
    repository: Arc<Repository>,
    messenger: Option<Arc<Messenger>>,
    server: ServerConfig,
    transport: T,
    state: parking_lot::Mutex<PackagerState>,
    event_tx: broadcast::Sender<PackagerEvent>,
    delivery: Mutex<()>,
}

impl Packager<HttpTransport> {
    /// Packager delivering over HTTP(S)
    pub fn http(repository: Arc<Repository>, server: ServerConfig) -> Result<Self> {
        let transport = HttpTransport::new(&server)?;
        Ok(Self::new(repository, server, transport))
    }
}

impl<T> Packager<T> {
    pub fn new(repository: Arc<Repository>, server: ServerConfig, transport: T) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            repository,
            messenger: None,
            server,
            transport,
            state: parking_lot::Mutex::new(PackagerState::Idle),
            event_tx,
            delivery: Mutex::new(()),
        }
    }

    /// Messenger of the current process, for `Criteria::ActiveSession`
    pub fn with_messenger(mut self, messenger: Arc<Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn state(&self) -> PackagerState {
        *self.state.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PackagerEvent> {
        self.event_tx.subscribe()
    }

    fn set_state(&self, state: PackagerState) {
        *self.state.lock() = state;
        let _ = self.event_tx.send(PackagerEvent::StateChanged(state));
    }

    /// Sessions matching `criteria`, oldest first
    #[instrument(name = "packager_select", skip(self, criteria), fields(criteria = %criteria))]
    pub async fn select(&self, criteria: Criteria) -> Result<Vec<SessionSummary>> {
        let sessions = match criteria {
            Criteria::None => Vec::new(),
            Criteria::ActiveSession => self.select_active().await?,
            Criteria::NewSessions => self.repository.find(|s| !s.is_running() && !s.sent)?,
            Criteria::AllSessions => self.repository.refresh()?,
            Criteria::SessionId(id) => vec![self.repository.get(id)?],
        };
        debug!(count = sessions.len(), "Sessions selected");
        Ok(sessions)
    }

    /// Roll the live fragment over so everything written so far is readable
    async fn select_active(&self) -> Result<Vec<SessionSummary>> {
        let Some(messenger) = &self.messenger else {
            debug!("No messenger attached, no active session");
            return Ok(Vec::new());
        };
        messenger.rollover().await?;
        match self.repository.get(messenger.identity().session_id) {
            Ok(summary) => Ok(vec![summary]),
            Err(RepositoryError::SessionNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Select and aggregate; None when nothing is readable
    async fn prepare(&self, criteria: Criteria, compress: bool) -> Result<Option<Package>> {
        self.set_state(PackagerState::Selecting);
        let sessions = self.select(criteria).await?;
        if sessions.is_empty() {
            return Ok(None);
        }
        self.set_state(PackagerState::Aggregating);
        let package = Package::build(&sessions, &self.repository, compress)?;
        Ok((!package.is_empty()).then_some(package))
    }

    /// Post-delivery bookkeeping
    ///
    /// Every session is attempted; the first failure is returned.
    fn settle(&self, package: &Package, mark_as_read: bool, purge: bool) -> Result<Vec<Uuid>> {
        let sessions = package.manifest().session_ids();
        let mut first_error = None;
        for &session_id in &sessions {
            if mark_as_read {
                match self.repository.mark_sent(session_id) {
                    Ok(true) => {}
                    Ok(false) => debug!(%session_id, "Running session left unmarked"),
                    Err(e) => {
                        warn!(%session_id, error = %e, "Failed to mark session as sent");
                        first_error.get_or_insert(e);
                        continue;
                    }
                }
            }
            if purge {
                match self.repository.delete_session(session_id) {
                    Ok(bytes) => debug!(%session_id, bytes, "Session purged"),
                    Err(RepositoryError::SessionRunning(_)) => {
                        debug!(%session_id, "Running session kept")
                    }
                    Err(e) => {
                        warn!(%session_id, error = %e, "Failed to purge session");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(sessions),
        }
    }

    fn complete(&self, via: &'static str, result: &Result<SendOutcome>) {
        let state = if result.is_ok() {
            PackagerState::Completed
        } else {
            PackagerState::Failed
        };
        self.set_state(state);

        let delivery = DeliveryResult::from(result);
        metrics::counter!("beacon_packages_sent_total", "target" => via, "result" => delivery.label())
            .increment(1);
        match result {
            Ok(outcome) if outcome.is_empty() => info!(via, "Nothing to send"),
            Ok(outcome) => info!(
                via,
                package_id = ?outcome.package_id,
                sessions = outcome.sessions.len(),
                bytes = outcome.bytes,
                "Package delivered"
            ),
            Err(e) => warn!(via, error = %e, "Package delivery failed"),
        }
        let package_id = result.as_ref().ok().and_then(|o| o.package_id);
        let _ = self.event_tx.send(PackagerEvent::Completed {
            package_id,
            result: delivery,
        });
    }

    /// Write the selected sessions to a package file
    ///
    /// An empty selection succeeds without creating `destination`.
    #[instrument(name = "packager_send_to_file", skip(self, criteria, destination), fields(criteria = %criteria))]
    pub async fn send_to_file(
        &self,
        criteria: Criteria,
        mark_as_read: bool,
        destination: &Path,
    ) -> Result<SendOutcome> {
        let _delivery = self.delivery.lock().await;
        let result = self.file_flow(criteria, mark_as_read, destination).await;
        self.complete("file", &result);
        result
    }

    async fn file_flow(
        &self,
        criteria: Criteria,
        mark_as_read: bool,
        destination: &Path,
    ) -> Result<SendOutcome> {
        let Some(package) = self.prepare(criteria, self.server.compress).await? else {
            return Ok(SendOutcome::default());
        };
        self.set_state(PackagerState::Delivering);
        let bytes = package.write_to(destination)?;
        let sessions = self.settle(&package, mark_as_read, false)?;
        Ok(SendOutcome {
            package_id: Some(package.id()),
            sessions,
            bytes,
            destination: Some(destination.to_path_buf()),
        })
    }
}

impl<T: Transport> Packager<T> {
    /// Deliver the selected sessions to the collector
    ///
    /// The destination is validated before anything else; a configuration
    /// error never reaches the transport.
    #[instrument(name = "packager_send_to_server", skip(self, criteria, options), fields(criteria = %criteria))]
    pub async fn send_to_server(
        &self,
        criteria: Criteria,
        options: &ServerSendOptions,
    ) -> Result<SendOutcome> {
        let endpoint = self.endpoint(options)?;
        self.deliver_to_server(criteria, options, endpoint, CancellationToken::new())
            .await
    }

    fn endpoint(&self, options: &ServerSendOptions) -> Result<Endpoint> {
        Endpoint::from_config(options.server.as_ref().unwrap_or(&self.server))
    }

    async fn deliver_to_server(
        &self,
        criteria: Criteria,
        options: &ServerSendOptions,
        endpoint: Endpoint,
        cancel: CancellationToken,
    ) -> Result<SendOutcome> {
        let _delivery = self.delivery.lock().await;
        let result = self.server_flow(criteria, options, &endpoint, &cancel).await;
        self.complete("server", &result);
        result
    }

    async fn server_flow(
        &self,
        criteria: Criteria,
        options: &ServerSendOptions,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome> {
        if cancel.is_cancelled() {
            return Err(PackagerError::Canceled);
        }
        let server = options.server.as_ref().unwrap_or(&self.server);
        let Some(package) = self.prepare(criteria, server.compress).await? else {
            return Ok(SendOutcome::default());
        };

        self.set_state(PackagerState::Delivering);
        let upload = Upload::new(&package, server.chunk_size_kb.saturating_mul(1024))?;
        self.transport.deliver(endpoint, &upload, cancel).await?;

        let sessions = self.settle(&package, options.mark_as_read, options.purge_after_send)?;
        Ok(SendOutcome {
            package_id: Some(package.id()),
            sessions,
            bytes: upload.payload.len() as u64,
            destination: Some(PathBuf::from(endpoint.base().as_str())),
        })
    }
}

impl<T: Transport + Sync + 'static> Packager<T> {
    /// Start a server send in the background
    ///
    /// Must be called inside a tokio runtime. Configuration errors are
    /// returned here; everything else arrives through `SendHandle::wait`
    /// and a `PackagerEvent::Completed`.
    pub fn send_to_server_async(
        self: &Arc<Self>,
        criteria: Criteria,
        options: ServerSendOptions,
    ) -> Result<SendHandle> {
        let endpoint = self.endpoint(&options)?;
        let cancel = CancellationToken::new();
        let packager = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            packager
                .deliver_to_server(criteria, &options, endpoint, token)
                .await
        });
        Ok(SendHandle { cancel, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::tests::{repository, write_session};
    use contracts::{AgentConfig, LogMessage, Packet, PublishMode, SessionStatus, Severity};
    use messenger::MessengerBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct StubTransport {
        calls: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        fail_status: Option<u16>,
        delay: Duration,
    }

    impl Transport for StubTransport {
        async fn deliver(
            &self,
            _endpoint: &Endpoint,
            _upload: &Upload,
            cancel: &CancellationToken,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(PackagerError::Canceled),
                _ = tokio::time::sleep(self.delay) => match self.fail_status {
                    Some(status) => Err(PackagerError::recoverable("stub failure", Some(status))),
                    None => Ok(()),
                },
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn server() -> ServerConfig {
        ServerConfig {
            host: Some("collector.local".to_string()),
            ..ServerConfig::default()
        }
    }

    /// running, closed-unsent and closed-sent sessions
    fn fixture(repo: &Repository) -> (Uuid, Uuid, Uuid) {
        let running = write_session(repo, 2, false).session_id;
        let unsent = write_session(repo, 3, true).session_id;
        let sent = write_session(repo, 4, true).session_id;
        assert!(repo.mark_sent(sent).unwrap());
        (running, unsent, sent)
    }

    fn packager(repo: Repository, transport: StubTransport) -> Packager<StubTransport> {
        Packager::new(Arc::new(repo), server(), transport)
    }

    #[tokio::test]
    async fn test_selection_criteria() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let (running, unsent, _) = fixture(&repo);
        let packager = packager(repo, StubTransport::default());

        let new: Vec<Uuid> = packager
            .select(Criteria::NewSessions)
            .await
            .unwrap()
            .iter()
            .map(SessionSummary::session_id)
            .collect();
        assert_eq!(new, vec![unsent]);

        assert_eq!(packager.select(Criteria::AllSessions).await.unwrap().len(), 3);
        assert!(packager.select(Criteria::None).await.unwrap().is_empty());
        // No messenger attached
        assert!(packager.select(Criteria::ActiveSession).await.unwrap().is_empty());

        let by_id = packager.select(Criteria::SessionId(running)).await.unwrap();
        assert_eq!(by_id[0].status, SessionStatus::Running);
        assert!(matches!(
            packager.select(Criteria::SessionId(Uuid::new_v4())).await,
            Err(PackagerError::Repository(RepositoryError::SessionNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_send_to_file_marks_sessions_read() {
        let dir = tempdir().unwrap();
        let repo = repository(&dir.path().join("repo"));
        let (_, unsent, _) = fixture(&repo);
        let packager = packager(repo, StubTransport::default());
        let destination = dir.path().join("out/new.bpkg");

        let outcome = packager
            .send_to_file(Criteria::NewSessions, true, &destination)
            .await
            .unwrap();
        assert_eq!(outcome.sessions, vec![unsent]);
        assert_eq!(packager.state(), PackagerState::Completed);

        let package = Package::open(&destination).unwrap();
        assert_eq!(package.manifest().session_ids(), vec![unsent]);
        assert!(packager.select(Criteria::NewSessions).await.unwrap().is_empty());
    }

    /// Index saves fail once `index.json.tmp` is a directory
    fn break_index_saves(repo: &Repository) {
        let dir = repo.session_dir("Acme", "Billing");
        std::fs::create_dir(dir.join(format!("{}.tmp", repository::INDEX_FILE_NAME))).unwrap();
    }

    #[tokio::test]
    async fn test_send_to_file_reports_mark_sent_failure() {
        let dir = tempdir().unwrap();
        let repo = repository(&dir.path().join("repo"));
        let (_, unsent, _) = fixture(&repo);
        repo.refresh().unwrap();
        break_index_saves(&repo);
        let packager = packager(repo, StubTransport::default());
        let mut events = packager.subscribe();
        let destination = dir.path().join("new.bpkg");

        let err = packager
            .send_to_file(Criteria::NewSessions, true, &destination)
            .await
            .unwrap_err();
        assert!(matches!(err, PackagerError::Repository(RepositoryError::Io(_))));
        assert_eq!(packager.state(), PackagerState::Failed);

        let result = loop {
            if let PackagerEvent::Completed { result, .. } = events.recv().await.unwrap() {
                break result;
            }
        };
        assert!(matches!(result, DeliveryResult::Error(_)));
        let new = packager.select(Criteria::NewSessions).await.unwrap();
        assert_eq!(new[0].session_id(), unsent);
    }

    #[tokio::test]
    async fn test_send_to_server_reports_mark_sent_failure() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let (running, unsent, sent) = fixture(&repo);
        repo.refresh().unwrap();
        break_index_saves(&repo);
        let packager = packager(repo, StubTransport::default());
        let options = ServerSendOptions {
            mark_as_read: true,
            purge_after_send: true,
            server: None,
        };

        let err = packager
            .send_to_server(Criteria::NewSessions, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, PackagerError::Repository(_)));
        assert_eq!(packager.state(), PackagerState::Failed);

        // Not marked, so not purged either
        let mut left: Vec<Uuid> = packager
            .repository()
            .refresh()
            .unwrap()
            .iter()
            .map(SessionSummary::session_id)
            .collect();
        left.sort();
        let mut expected = vec![running, unsent, sent];
        expected.sort();
        assert_eq!(left, expected);
    }

    #[tokio::test]
    async fn test_send_to_file_with_no_selection_creates_nothing() {
        let dir = tempdir().unwrap();
        let repo = repository(&dir.path().join("repo"));
        fixture(&repo);
        let packager = packager(repo, StubTransport::default());
        let destination = dir.path().join("none.bpkg");

        let outcome = packager
            .send_to_file(Criteria::None, true, &destination)
            .await
            .unwrap();
        assert!(outcome.is_empty());
        assert!(!destination.exists());
        assert_eq!(packager.select(Criteria::NewSessions).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_server_fails_before_transport() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        fixture(&repo);
        let transport = StubTransport::default();
        let calls = Arc::clone(&transport.calls);
        let packager = Arc::new(Packager::new(Arc::new(repo), ServerConfig::default(), transport));

        let err = packager
            .send_to_server(Criteria::AllSessions, &ServerSendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PackagerError::Configuration(_)));

        let err = packager
            .send_to_server_async(Criteria::AllSessions, ServerSendOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, PackagerError::Configuration(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(packager.state(), PackagerState::Idle);
    }

    #[tokio::test]
    async fn test_send_to_server_purges_delivered_sessions() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let (running, unsent, sent) = fixture(&repo);
        let transport = StubTransport::default();
        let calls = Arc::clone(&transport.calls);
        let packager = packager(repo, transport);
        let mut events = packager.subscribe();

        let options = ServerSendOptions {
            mark_as_read: true,
            purge_after_send: true,
            server: None,
        };
        let outcome = packager
            .send_to_server(Criteria::AllSessions, &options)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.sessions.len(), 3);

        // Closed sessions are gone, the running one stays
        let left: Vec<Uuid> = packager
            .repository()
            .refresh()
            .unwrap()
            .iter()
            .map(SessionSummary::session_id)
            .collect();
        assert_eq!(left, vec![running]);
        assert!(!left.contains(&unsent) && !left.contains(&sent));

        let mut states = Vec::new();
        let completed = loop {
            match events.recv().await.unwrap() {
                PackagerEvent::StateChanged(state) => states.push(state),
                PackagerEvent::Completed { result, .. } => break result,
            }
        };
        assert_eq!(
            states,
            vec![
                PackagerState::Selecting,
                PackagerState::Aggregating,
                PackagerState::Delivering,
                PackagerState::Completed
            ]
        );
        assert_eq!(completed, DeliveryResult::Success);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_sessions_unsent() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let (_, unsent, _) = fixture(&repo);
        let transport = StubTransport {
            fail_status: Some(503),
            ..StubTransport::default()
        };
        let packager = packager(repo, transport);
        let options = ServerSendOptions {
            mark_as_read: true,
            ..ServerSendOptions::default()
        };

        let err = packager
            .send_to_server(Criteria::NewSessions, &options)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(packager.state(), PackagerState::Failed);

        let new = packager.select(Criteria::NewSessions).await.unwrap();
        assert_eq!(new[0].session_id(), unsent);
    }

    #[tokio::test]
    async fn test_async_send_can_be_canceled() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        fixture(&repo);
        let transport = StubTransport {
            delay: Duration::from_secs(30),
            ..StubTransport::default()
        };
        let calls = Arc::clone(&transport.calls);
        let packager = Arc::new(packager(repo, transport));
        let mut events = packager.subscribe();

        let handle = packager
            .send_to_server_async(Criteria::AllSessions, ServerSendOptions::default())
            .unwrap();
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.cancel();
        assert!(matches!(handle.wait().await, Err(PackagerError::Canceled)));

        let result = loop {
            if let PackagerEvent::Completed { result, .. } = events.recv().await.unwrap() {
                break result;
            }
        };
        assert_eq!(result, DeliveryResult::Canceled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_serialize() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        fixture(&repo);
        let transport = StubTransport {
            delay: Duration::from_millis(50),
            ..StubTransport::default()
        };
        let max_in_flight = Arc::clone(&transport.max_in_flight);
        let packager = Arc::new(packager(repo, transport));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                packager
                    .send_to_server_async(Criteria::AllSessions, ServerSendOptions::default())
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_active_session_rolls_over_first() {
        let dir = tempdir().unwrap();
        let mut config = AgentConfig::new("Acme", "Billing");
        config.repository.path = dir.path().join("repo");
        let repo = Arc::new(repository(&config.repository.path));
        let messenger = Arc::new(
            MessengerBuilder::new(config)
                .repository(Arc::clone(&repo))
                .build()
                .await
                .unwrap(),
        );
        for _ in 0..3 {
            let packet = Packet::new(LogMessage::new(Severity::Information, "Test", "live"));
            messenger.publish(packet, PublishMode::WaitForCommit).await.unwrap();
        }

        let packager = Packager::new(Arc::clone(&repo), server(), StubTransport::default())
            .with_messenger(Arc::clone(&messenger));
        let destination = dir.path().join("active.bpkg");
        let outcome = packager
            .send_to_file(Criteria::ActiveSession, true, &destination)
            .await
            .unwrap();
        assert_eq!(outcome.sessions, vec![messenger.identity().session_id]);

        let package = Package::open(&destination).unwrap();
        assert_eq!(package.manifest().sessions[0].status, SessionStatus::Running);
        // A running session is never flagged as sent
        assert!(!repo.get(messenger.identity().session_id).unwrap().sent);

        messenger.close().await.unwrap();
    }
}
