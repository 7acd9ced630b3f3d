//! Beacon metric names, descriptions and recording helpers
//!
//! Library crates emit through the `metrics` facade directly; this module
//! names every series in one place and aggregates publish statistics for
//! reporting.

use contracts::{SessionStatus, SessionSummary};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

pub const PACKETS_PUBLISHED: &str = "beacon_packets_published_total";
pub const SINK_WRITES: &str = "beacon_sink_writes_total";
pub const SINK_QUEUE_DEPTH: &str = "beacon_sink_queue_depth";
pub const SYNC_FALLBACKS: &str = "beacon_sync_fallbacks_total";
pub const FRAGMENTS_ROLLED: &str = "beacon_fragments_rolled_total";
pub const PACKAGES_SENT: &str = "beacon_packages_sent_total";
pub const REPOSITORY_SESSIONS: &str = "beacon_repository_sessions";
pub const REPOSITORY_BYTES: &str = "beacon_repository_bytes";
pub const PUBLISH_LATENCY: &str = "beacon_publish_latency_ms";

/// Register descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(PACKETS_PUBLISHED, "Packets accepted by the messenger");
    describe_counter!(SINK_WRITES, "Sink writes by sink and status");
    describe_gauge!(SINK_QUEUE_DEPTH, "Packets waiting in a sink queue");
    describe_counter!(SYNC_FALLBACKS, "Writes done on the publishing thread because a queue was full");
    describe_counter!(FRAGMENTS_ROLLED, "Fragment files closed by rollover");
    describe_counter!(PACKAGES_SENT, "Package deliveries by target and result");
    describe_gauge!(REPOSITORY_SESSIONS, "Sessions in the repository by status");
    describe_gauge!(REPOSITORY_BYTES, Unit::Bytes, "Total size of all fragment files");
    describe_histogram!(PUBLISH_LATENCY, Unit::Milliseconds, "Time spent in publish");
}

/// Repository gauges from an index refresh
pub fn record_repository(sessions: &[SessionSummary]) {
    let running = sessions.iter().filter(|s| s.status == SessionStatus::Running).count();
    let unsent = sessions.iter().filter(|s| !s.is_running() && !s.sent).count();
    let sent = sessions.iter().filter(|s| s.sent).count();
    gauge!(REPOSITORY_SESSIONS, "status" => "running").set(running as f64);
    gauge!(REPOSITORY_SESSIONS, "status" => "unsent").set(unsent as f64);
    gauge!(REPOSITORY_SESSIONS, "status" => "sent").set(sent as f64);

    let bytes: u64 = sessions.iter().map(SessionSummary::total_size).sum();
    gauge!(REPOSITORY_BYTES).set(bytes as f64);
}

pub fn record_publish_latency_ms(latency_ms: f64) {
    histogram!(PUBLISH_LATENCY).record(latency_ms);
}

/// Welford running statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

impl std::fmt::Display for RunningStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            return write!(f, "n/a");
        }
        write!(
            f,
            "min={:.3} max={:.3} mean={:.3} std={:.3} (n={})",
            self.min,
            self.max,
            self.mean,
            self.variance().sqrt(),
            self.count
        )
    }
}

/// Outcome counts and latency of a batch of publishes
#[derive(Debug, Clone, Default)]
pub struct PublishStats {
    pub published: u64,
    pub failed: u64,
    pub latency_ms: RunningStats,
}

impl PublishStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one publish and forward its latency to the recorder
    pub fn record(&mut self, latency_ms: f64, ok: bool) {
        if ok {
            self.published += 1;
        } else {
            self.failed += 1;
        }
        self.latency_ms.push(latency_ms);
        record_publish_latency_ms(latency_ms);
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.published + self.failed;
        if total == 0 {
            0.0
        } else {
            self.failed as f64 / total as f64 * 100.0
        }
    }
}

impl std::fmt::Display for PublishStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Published: {}", self.published)?;
        writeln!(f, "Failed: {} ({:.2}%)", self.failed, self.failure_rate())?;
        write!(f, "Publish latency (ms): {}", self.latency_ms)
    }
}
