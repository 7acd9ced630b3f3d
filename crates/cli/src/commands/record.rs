//! `record` command implementation.
//!
//! Publishes synthetic log messages and metric samples from several
//! producer tasks through a Messenger built from the configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use contracts::{
    LogMessage, MetricDefinition, MetricKind, MetricSample, Packet, PublishMode, Severity,
    SinkType, ThreadInfo,
};
use messenger::Messenger;
use observability::PublishStats;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::load_config;
use crate::cli::RecordArgs;
use crate::error::CliError;

const SEVERITIES: [Severity; 5] = [
    Severity::Verbose,
    Severity::Information,
    Severity::Information,
    Severity::Warning,
    Severity::Error,
];

/// Execute the `record` command
pub async fn run_record(config_path: &Path, args: &RecordArgs) -> Result<()> {
    let config = load_config(config_path)?;
    if !config.sinks.iter().any(|s| s.sink_type == SinkType::File) {
        warn!(
            "{}",
            CliError::NoFileSink {
                repository: config.repository.path.clone()
            }
        );
    }

    let messenger = Arc::new(
        Messenger::builder(config)
            .build()
            .await
            .context("Failed to start messenger")?,
    );
    let session_id = messenger.identity().session_id;
    info!(%session_id, producers = args.producers, "Recording session");

    let started = Instant::now();
    let producers = args.producers.max(1);
    let mut tasks = JoinSet::new();
    for index in 0..producers {
        let messenger = Arc::clone(&messenger);
        let quota = Quota::split(args, index, producers);
        tasks.spawn(produce(messenger, index, quota, args.mode.into(), args.interval_ms));
    }

    let mut stats = PublishStats::new();
    while let Some(joined) = tasks.join_next().await {
        for (latency_ms, ok) in joined.context("Producer task failed")? {
            stats.record(latency_ms, ok);
        }
    }

    messenger.close().await.context("Failed to close session")?;
    let elapsed = started.elapsed();

    println!("Session {}", session_id);
    println!("{}", stats);
    println!("Elapsed: {:.3}s", elapsed.as_secs_f64());
    for (sink, snapshot) in messenger.metrics() {
        println!(
            "Sink {}: {} written, {} failed, {} sync fallbacks{}",
            sink,
            snapshot.write_count,
            snapshot.failure_count,
            snapshot.sync_fallback_count,
            if snapshot.disabled { " (disabled)" } else { "" }
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Quota {
    messages: u64,
    samples: u64,
}

impl Quota {
    /// Share of the totals for producer `index`; the first producers take the remainder
    fn split(args: &RecordArgs, index: usize, producers: usize) -> Self {
        let share = |total: u64| {
            let n = producers as u64;
            total / n + u64::from((index as u64) < total % n)
        };
        Self {
            messages: share(args.messages),
            samples: share(args.samples),
        }
    }
}

async fn produce(
    messenger: Arc<Messenger>,
    index: usize,
    quota: Quota,
    mode: PublishMode,
    interval_ms: u64,
) -> Vec<(f64, bool)> {
    let mut results = Vec::with_capacity((quota.messages + quota.samples) as usize);
    let thread = Packet::new(ThreadInfo {
        thread_index: index as u32,
        thread_name: Some(format!("producer-{index}")),
        is_background: true,
    })
    .shared();
    let metric = Packet::new(
        MetricDefinition::new("Demo", format!("producer_{index}_latency"), MetricKind::Gauge)
            .with_unit("ms"),
    )
    .shared();

    let total = quota.messages.max(quota.samples);
    for i in 0..total {
        if i < quota.messages {
            let severity = SEVERITIES[(i as usize) % SEVERITIES.len()];
            let message = LogMessage::new(severity, "Demo", format!("Message {i} from producer {index}"))
                .with_tags(["demo"]);
            let message = match message.with_thread(&thread) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Invalid thread reference");
                    results.push((0.0, false));
                    continue;
                }
            };
            results.push(timed_publish(&messenger, Packet::new(message), mode).await);
        }
        if i < quota.samples {
            let value = (i as f64 * 0.7 + index as f64).sin().abs() * 100.0;
            match MetricSample::new(&metric, value) {
                Ok(sample) => results.push(timed_publish(&messenger, Packet::new(sample), mode).await),
                Err(e) => {
                    warn!(error = %e, "Invalid metric sample");
                    results.push((0.0, false));
                }
            }
        }
        if interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }
    results
}

async fn timed_publish(messenger: &Messenger, packet: Packet, mode: PublishMode) -> (f64, bool) {
    let started = Instant::now();
    let result = messenger.publish(packet, mode).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    if let Err(e) = &result {
        warn!(error = %e, "Publish failed");
    }
    (latency_ms, result.is_ok())
}
