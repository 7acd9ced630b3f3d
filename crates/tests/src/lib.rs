//! # Integration Tests
//!
//! Cross-crate scenarios: messenger to repository to packager, with real
//! sinks and a local collector where needed.

#[cfg(test)]
mod support {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use contracts::{AgentConfig, ContractError, Packet, PacketSink};
    use messenger::Messenger;
    use repository::{FragmentLedger, Repository};

    /// Config with the default file sink rooted at `root`
    pub fn file_config(root: &Path) -> AgentConfig {
        let mut config = AgentConfig::new("Acme", "Billing");
        config.repository.path = root.to_path_buf();
        config
    }

    pub fn open_repository(config: &AgentConfig) -> Arc<Repository> {
        Arc::new(Repository::from_config(&config.repository, Arc::new(FragmentLedger::new())).unwrap())
    }

    /// Messenger writing into `repository`, sharing its fragment ledger
    pub async fn messenger(config: &AgentConfig, repository: &Arc<Repository>) -> Arc<Messenger> {
        Arc::new(
            Messenger::builder(config.clone())
                .repository(Arc::clone(repository))
                .build()
                .await
                .unwrap(),
        )
    }

    /// Sink that records sequences, optionally slowly
    pub struct CollectSink {
        pub seen: Arc<Mutex<Vec<u64>>>,
        pub delay: Duration,
    }

    impl CollectSink {
        pub fn new(delay: Duration) -> Self {
            Self {
                seen: Arc::new(Mutex::new(Vec::new())),
                delay,
            }
        }
    }

    impl PacketSink for CollectSink {
        fn name(&self) -> &str {
            "collect"
        }

        fn is_durable(&self) -> bool {
            false
        }

        async fn write(&mut self, packet: &Arc<Packet>) -> Result<(), ContractError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().unwrap().push(packet.sequence);
            Ok(())
        }

        async fn rollover(&mut self) -> Result<(), ContractError> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), ContractError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ContractError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod messenger_e2e {
    use std::collections::HashMap;
    use std::io::{Cursor, Read};
    use std::sync::Arc;
    use std::time::Duration;

    use codec::{PacketReader, PacketRegistry};
    use contracts::{
        AgentConfig, LogMessage, MetricDefinition, MetricKind, MetricSample, Packet,
        PacketPayload, PublishMode, Severity, SinkConfig, SinkType, ThreadInfo,
    };
    use messenger::Messenger;
    use repository::FRAGMENT_MAGIC;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::support::{file_config, messenger, open_repository, CollectSink};

    fn message(caption: String) -> Packet {
        Packet::new(LogMessage::new(Severity::Information, "Test", caption))
    }

    fn message_sequences(packets: &[Packet]) -> Vec<u64> {
        packets
            .iter()
            .filter(|p| matches!(p.payload, PacketPayload::LogMessage(_)))
            .map(|p| p.sequence)
            .collect()
    }

    /// Publishers on plain threads still produce a gap-free sequence
    #[test]
    fn test_blocking_publishers_share_one_sequence() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 250;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let dir = tempdir().unwrap();
        let config = file_config(dir.path());
        let repository = open_repository(&config);
        let messenger = runtime.block_on(messenger(&config, &repository));

        let threads: Vec<_> = (0..THREADS)
            .map(|t| {
                let messenger = Arc::clone(&messenger);
                std::thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| {
                            messenger
                                .publish_blocking(message(format!("{t}-{i}")), PublishMode::Queued)
                                .unwrap()
                        })
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        let mut returned: Vec<u64> = threads
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        runtime.block_on(messenger.close()).unwrap();

        returned.sort_unstable();
        let expected: Vec<u64> = (1..=THREADS * PER_THREAD).collect();
        assert_eq!(returned, expected);

        let read = repository.read_session(messenger.identity().session_id).unwrap();
        assert_eq!(read.bad_packets, 0);
        assert_eq!(message_sequences(&read.packets), expected);
        assert_eq!(read.packets.last().unwrap().sequence, THREADS * PER_THREAD + 1);
    }

    async fn publish_through_small_queue(force_synchronous: bool) -> Vec<u64> {
        const CAPACITY: usize = 4;
        const EXTRA: u64 = 46;

        let mut config = AgentConfig::new("Acme", "Billing");
        config.sinks.clear();
        config.messenger.max_queue_length = CAPACITY;
        config.messenger.force_synchronous = force_synchronous;

        let sink = CollectSink::new(Duration::from_millis(2));
        let seen = Arc::clone(&sink.seen);
        let messenger = Messenger::builder(config).sink(sink).build().await.unwrap();

        for i in 0..CAPACITY as u64 + EXTRA {
            messenger
                .publish(message(format!("burst {i}")), PublishMode::Queued)
                .await
                .unwrap();
        }
        messenger.close().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        seen
    }

    #[tokio::test]
    async fn test_full_queue_loses_nothing() {
        let seen = publish_through_small_queue(false).await;
        // 50 messages + session close
        assert_eq!(seen, (1..=51).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_full_queue_with_synchronous_fallback_loses_nothing() {
        let seen = publish_through_small_queue(true).await;
        assert_eq!(seen, (1..=51).collect::<Vec<u64>>());
    }

    /// Small fragments force rollovers; dependencies survive each one
    #[tokio::test]
    async fn test_dependencies_resolve_across_fragments() {
        let dir = tempdir().unwrap();
        let mut config = file_config(dir.path());
        config.repository.max_fragment_size_kb = 1;
        let repository = open_repository(&config);
        let messenger = messenger(&config, &repository).await;

        let thread = Packet::new(ThreadInfo {
            thread_index: 7,
            thread_name: Some("worker".to_string()),
            is_background: false,
        })
        .shared();
        let metric = Packet::new(MetricDefinition::new("Test", "latency", MetricKind::Gauge)).shared();
        for i in 0..200 {
            let log = LogMessage::new(Severity::Warning, "Test", format!("message {i}"))
                .with_thread(&thread)
                .unwrap();
            messenger.publish(Packet::new(log), PublishMode::Queued).await.unwrap();
            let sample = MetricSample::new(&metric, f64::from(i)).unwrap();
            messenger.publish(Packet::new(sample), PublishMode::Queued).await.unwrap();
        }
        messenger.close().await.unwrap();

        let summary = repository.get(messenger.identity().session_id).unwrap();
        assert!(summary.fragments.len() > 1, "expected rollovers");
        assert!(summary.fragments.iter().all(|f| f.closed));

        let read = repository.read_session(summary.session_id()).unwrap();
        assert_eq!(read.skipped_fragments, 0);
        let mut logs = 0;
        let mut samples = 0;
        for packet in &read.packets {
            match &packet.payload {
                PacketPayload::LogMessage(log) => {
                    assert_eq!(log.thread_info().unwrap().thread_index, 7);
                    logs += 1;
                }
                PacketPayload::MetricSample(sample) => {
                    assert_eq!(sample.definition().unwrap().name, "latency");
                    samples += 1;
                }
                _ => {}
            }
        }
        assert_eq!((logs, samples), (200, 200));
    }

    /// The live stream carries the same messages as the repository
    #[tokio::test]
    async fn test_network_sink_matches_file_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let collector = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let dir = tempdir().unwrap();
        let mut config = file_config(dir.path());
        config.sinks.push(SinkConfig {
            name: "live".to_string(),
            sink_type: SinkType::Network,
            queue_capacity: None,
            params: HashMap::from([
                ("host".to_string(), "127.0.0.1".to_string()),
                ("port".to_string(), port.to_string()),
            ]),
        });
        let repository = open_repository(&config);
        let messenger = messenger(&config, &repository).await;
        for i in 0..10 {
            messenger
                .publish(message(format!("live {i}")), PublishMode::WaitForTask)
                .await
                .unwrap();
        }
        messenger.close().await.unwrap();

        let mut stream = Cursor::new(collector.await.unwrap());
        let mut preamble = [0u8; 10];
        Read::read_exact(&mut stream, &mut preamble).unwrap();
        assert_eq!(&preamble[..8], FRAGMENT_MAGIC);
        let streamed: Vec<Packet> = PacketReader::new(stream, Arc::new(PacketRegistry::standard()))
            .collect::<Result<_, _>>()
            .unwrap();

        let stored = repository.read_session(messenger.identity().session_id).unwrap();
        assert_eq!(message_sequences(&streamed), message_sequences(&stored.packets));
        assert_eq!(message_sequences(&streamed), (1..=10).collect::<Vec<u64>>());
    }
}

#[cfg(test)]
mod packager_e2e {
    use std::sync::Arc;

    use config_loader::ConfigLoader;
    use contracts::{
        Criteria, LogMessage, Packet, PublishMode, ServerConfig, SessionSummary, Severity,
    };
    use messenger::Messenger;
    use mockito::{Matcher, Server};
    use packager::{Package, Packager, PackagerError, ServerSendOptions};
    use repository::Repository;
    use tempfile::tempdir;

    use crate::support::{file_config, messenger, open_repository};

    fn sorted_ids(sessions: &[SessionSummary]) -> Vec<String> {
        let mut ids: Vec<String> = sessions.iter().map(|s| s.session_id().to_string()).collect();
        ids.sort();
        ids
    }

    async fn record(messenger: &Messenger, count: usize) {
        for i in 0..count {
            let packet = Packet::new(LogMessage::new(Severity::Information, "Test", format!("m{i}")));
            messenger.publish(packet, PublishMode::WaitForCommit).await.unwrap();
        }
    }

    /// One closed-and-sent, one closed-unsent and one running session
    struct Fixture {
        _dir: tempfile::TempDir,
        repository: Arc<Repository>,
        running: Arc<Messenger>,
        sent: SessionSummary,
        unsent: SessionSummary,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path());
        let repository = open_repository(&config);

        let first = messenger(&config, &repository).await;
        record(&first, 3).await;
        first.close().await.unwrap();
        repository.mark_sent(first.identity().session_id).unwrap();

        let second = messenger(&config, &repository).await;
        record(&second, 4).await;
        second.close().await.unwrap();

        let running = messenger(&config, &repository).await;
        record(&running, 2).await;

        let sent = repository.get(first.identity().session_id).unwrap();
        let unsent = repository.get(second.identity().session_id).unwrap();
        Fixture {
            _dir: dir,
            repository,
            running,
            sent,
            unsent,
        }
    }

    #[tokio::test]
    async fn test_selection_over_recorded_sessions() {
        let fixture = fixture().await;
        let packager = Packager::http(Arc::clone(&fixture.repository), ServerConfig::default())
            .unwrap()
            .with_messenger(Arc::clone(&fixture.running));

        let new = packager.select(Criteria::NewSessions).await.unwrap();
        assert_eq!(sorted_ids(&new), sorted_ids(std::slice::from_ref(&fixture.unsent)));

        let all = packager.select(Criteria::AllSessions).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|s| s.session_id() == fixture.sent.session_id() && s.sent));

        let active = packager.select(Criteria::ActiveSession).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id(), fixture.running.identity().session_id);
        assert!(active[0].is_running());

        let none = packager.select(Criteria::None).await.unwrap();
        assert!(none.is_empty());

        fixture.running.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_file_marks_new_sessions_read() {
        let fixture = fixture().await;
        let out = tempdir().unwrap();
        let destination = out.path().join("new.bpkg");
        let packager = Packager::http(Arc::clone(&fixture.repository), ServerConfig::default()).unwrap();

        let outcome = packager
            .send_to_file(Criteria::NewSessions, true, &destination)
            .await
            .unwrap();
        assert_eq!(outcome.sessions, vec![fixture.unsent.session_id()]);

        let package = Package::open(&destination).unwrap();
        assert_eq!(package.manifest().session_ids(), vec![fixture.unsent.session_id()]);
        for (_, fragment, bytes) in package.fragments() {
            let original = fixture
                .unsent
                .fragments
                .iter()
                .find(|f| f.index == fragment.index)
                .unwrap();
            assert_eq!(bytes, std::fs::read(&original.path).unwrap().as_slice());
        }

        assert!(packager.select(Criteria::NewSessions).await.unwrap().is_empty());
        assert!(!fixture.repository.get(fixture.running.identity().session_id).unwrap().sent);
        fixture.running.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_criteria_writes_nothing() {
        let fixture = fixture().await;
        let out = tempdir().unwrap();
        let destination = out.path().join("none.bpkg");
        let packager = Packager::http(Arc::clone(&fixture.repository), ServerConfig::default()).unwrap();

        let outcome = packager
            .send_to_file(Criteria::None, true, &destination)
            .await
            .unwrap();
        assert!(outcome.is_empty());
        assert!(!destination.exists());
        assert!(!fixture.repository.get(fixture.unsent.session_id()).unwrap().sent);
        fixture.running.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_server_fails_before_any_request() {
        let fixture = fixture().await;
        let packager = Packager::http(Arc::clone(&fixture.repository), ServerConfig::default()).unwrap();

        let err = packager
            .send_to_server(Criteria::AllSessions, &ServerSendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PackagerError::Configuration(_)));
        assert!(!fixture.repository.get(fixture.unsent.session_id()).unwrap().sent);
        fixture.running.close().await.unwrap();
    }

    /// Config file through to a collector that accepts the upload
    #[tokio::test]
    async fn test_upload_and_purge_from_config_file() {
        let mut server = Server::new_async().await;
        let address = server.host_with_port();
        let (host, port) = address.split_once(':').unwrap();

        let dir = tempdir().unwrap();
        let config_path = dir.path().join("beacon.toml");
        std::fs::write(
            &config_path,
            format!(
                "[session]\nproduct = \"Acme\"\napplication = \"Billing\"\n\n\
                 [repository]\npath = {:?}\n\n\
                 [server]\nhost = {:?}\nport = {}\nuse_ssl = false\nbase_path = \"beacon\"\n",
                dir.path().join("repo").display().to_string(),
                host,
                port
            ),
        )
        .unwrap();
        let config = ConfigLoader::load_from_path(&config_path).unwrap();
        let repository = open_repository(&config);
        for count in [2, 5] {
            let messenger = messenger(&config, &repository).await;
            record(&messenger, count).await;
            messenger.close().await.unwrap();
        }

        let chunks = server
            .mock(
                "PUT",
                Matcher::Regex(r"^/beacon/packages/[0-9a-f-]+/chunks/\d+$".to_string()),
            )
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;
        let commit = server
            .mock("POST", Matcher::Regex(r"^/beacon/packages/[0-9a-f-]+/commit$".to_string()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let packager = Packager::http(Arc::clone(&repository), config.server.clone()).unwrap();
        let options = ServerSendOptions {
            mark_as_read: true,
            purge_after_send: true,
            server: None,
        };
        let outcome = packager
            .send_to_server(Criteria::AllSessions, &options)
            .await
            .unwrap();

        chunks.assert_async().await;
        commit.assert_async().await;
        assert_eq!(outcome.sessions.len(), 2);
        assert!(repository.refresh().unwrap().is_empty());
    }

    /// A rejected upload leaves the repository untouched
    #[tokio::test]
    async fn test_rejected_upload_keeps_sessions() {
        let mut server = Server::new_async().await;
        let address = server.host_with_port();
        let (host, port) = address.split_once(':').unwrap();

        let dir = tempdir().unwrap();
        let mut config = file_config(dir.path());
        config.server.host = Some(host.to_string());
        config.server.port = Some(port.parse().unwrap());
        config.server.use_ssl = false;
        let repository = open_repository(&config);
        let messenger = messenger(&config, &repository).await;
        record(&messenger, 3).await;
        messenger.close().await.unwrap();

        let rejected = server
            .mock("PUT", Matcher::Any)
            .with_status(403)
            .expect(1)
            .create_async()
            .await;

        let packager = Packager::http(Arc::clone(&repository), config.server.clone()).unwrap();
        let options = ServerSendOptions {
            mark_as_read: true,
            purge_after_send: true,
            server: None,
        };
        let err = packager
            .send_to_server(Criteria::NewSessions, &options)
            .await
            .unwrap_err();

        rejected.assert_async().await;
        assert!(!err.is_recoverable());
        let sessions = repository.refresh().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].sent);
    }
}
