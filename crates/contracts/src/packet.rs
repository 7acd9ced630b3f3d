//! Packet - the serializable unit of telemetry
//!
//! Every packet carries an envelope (`sequence`, `timestamp`, `id`) and a
//! typed payload. The messenger assigns `sequence` at publish time; it is the
//! canonical total order within a session.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::{now, ContractError, PacketDefinition, SessionEndStatus, SessionIdentity, Timestamp};

pub const SESSION_HEADER: &str = "SessionHeader";
pub const FRAGMENT_TRAILER: &str = "FragmentTrailer";
pub const SESSION_CLOSE: &str = "SessionClose";
pub const THREAD_INFO: &str = "ThreadInfo";
pub const LOG_MESSAGE: &str = "LogMessage";
pub const METRIC_DEFINITION: &str = "MetricDefinition";
pub const METRIC_SAMPLE: &str = "MetricSample";

/// A telemetry packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Session-scoped order, assigned by the messenger (0 = not yet published)
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub id: Uuid,
    pub payload: PacketPayload,
}

impl Packet {
    /// Create an unpublished packet stamped with the current time
    pub fn new(payload: impl Into<PacketPayload>) -> Self {
        Self {
            sequence: 0,
            timestamp: now(),
            id: Uuid::new_v4(),
            payload: payload.into(),
        }
    }

    pub fn shared(self) -> Arc<Packet> {
        Arc::new(self)
    }

    /// Session / fragment boundary marker
    pub fn is_header(&self) -> bool {
        matches!(
            self.payload,
            PacketPayload::SessionHeader(_)
                | PacketPayload::FragmentTrailer(_)
                | PacketPayload::SessionClose(_)
        )
    }

    pub fn type_name(&self) -> &str {
        match &self.payload {
            PacketPayload::SessionHeader(_) => SESSION_HEADER,
            PacketPayload::FragmentTrailer(_) => FRAGMENT_TRAILER,
            PacketPayload::SessionClose(_) => SESSION_CLOSE,
            PacketPayload::ThreadInfo(_) => THREAD_INFO,
            PacketPayload::LogMessage(_) => LOG_MESSAGE,
            PacketPayload::MetricDefinition(_) => METRIC_DEFINITION,
            PacketPayload::MetricSample(_) => METRIC_SAMPLE,
            PacketPayload::Generic(generic) => &generic.definition.type_name,
        }
    }

    /// Packets that must precede this one in any stream
    pub fn required_packets(&self) -> Vec<Arc<Packet>> {
        match &self.payload {
            PacketPayload::LogMessage(message) => message.thread.iter().cloned().collect(),
            PacketPayload::MetricSample(sample) => vec![Arc::clone(&sample.metric)],
            _ => Vec::new(),
        }
    }

    /// Whether other packets may reference this one as a dependency
    pub fn is_dependency_target(&self) -> bool {
        matches!(
            self.payload,
            PacketPayload::ThreadInfo(_) | PacketPayload::MetricDefinition(_)
        )
    }

    /// Read-back ordering: sequence, then timestamp and id as tie-breaks
    pub fn order_key(&self) -> (u64, Timestamp, Uuid) {
        (self.sequence, self.timestamp, self.id)
    }
}

/// Typed packet payloads
#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    SessionHeader(SessionHeader),
    FragmentTrailer(FragmentTrailer),
    SessionClose(SessionClose),
    ThreadInfo(ThreadInfo),
    LogMessage(LogMessage),
    MetricDefinition(MetricDefinition),
    MetricSample(MetricSample),
    /// Unknown packet kind preserved as raw field bytes
    Generic(GenericPacket),
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for PacketPayload {
                fn from(value: $variant) -> Self {
                    PacketPayload::$variant(value)
                }
            }
        )*
    };
}

impl_from_payload!(
    SessionHeader,
    FragmentTrailer,
    SessionClose,
    ThreadInfo,
    LogMessage,
    MetricDefinition,
    MetricSample,
);

impl From<GenericPacket> for PacketPayload {
    fn from(value: GenericPacket) -> Self {
        PacketPayload::Generic(value)
    }
}

/// First packet of every fragment
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHeader {
    pub identity: SessionIdentity,
    pub fragment_index: u32,
    pub fragment_start: Timestamp,
}

/// Last packet of a cleanly closed fragment
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentTrailer {
    pub fragment_index: u32,
    pub packet_count: u64,
    pub last_sequence: u64,
    pub end_time: Timestamp,
    /// The session ended with this fragment
    pub session_ended: bool,
}

/// Explicit end-of-session marker
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    pub end_time: Timestamp,
    pub status: SessionEndStatus,
    pub reason: Option<String>,
}

impl SessionClose {
    pub fn normal() -> Self {
        Self {
            end_time: now(),
            status: SessionEndStatus::Normal,
            reason: None,
        }
    }
}

/// Describes a producer thread referenced by log messages
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    pub thread_index: u32,
    pub thread_name: Option<String>,
    pub is_background: bool,
}

/// Log message severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Information,
    Verbose,
}

impl Severity {
    pub fn code(self) -> i32 {
        match self {
            Self::Critical => 1,
            Self::Error => 2,
            Self::Warning => 4,
            Self::Information => 8,
            Self::Verbose => 16,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Critical),
            2 => Some(Self::Error),
            4 => Some(Self::Warning),
            8 => Some(Self::Information),
            16 => Some(Self::Verbose),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "information",
            Self::Verbose => "verbose",
        }
    }
}

/// A log message
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub severity: Severity,
    /// Optional `ThreadInfo` dependency
    pub thread: Option<Arc<Packet>>,
    pub log_system: String,
    pub category: String,
    pub user_name: Option<String>,
    pub caption: String,
    pub description: Option<String>,
    pub exception: Option<String>,
    pub source_file: Option<String>,
    pub source_line: u32,
    pub details: Option<String>,
    pub tags: Vec<String>,
}

impl LogMessage {
    pub fn new(severity: Severity, category: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            severity,
            thread: None,
            log_system: "Beacon".to_string(),
            category: category.into(),
            user_name: None,
            caption: caption.into(),
            description: None,
            exception: None,
            source_file: None,
            source_line: 0,
            details: None,
            tags: Vec::new(),
        }
    }

    /// Attach the producing thread; the packet must be a `ThreadInfo`
    pub fn with_thread(mut self, thread: &Arc<Packet>) -> Result<Self, ContractError> {
        if !matches!(thread.payload, PacketPayload::ThreadInfo(_)) {
            return Err(ContractError::InvalidDependency {
                type_name: LOG_MESSAGE,
                expected: THREAD_INFO,
                actual: thread.type_name().to_string(),
            });
        }
        self.thread = Some(Arc::clone(thread));
        Ok(self)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn thread_info(&self) -> Option<&ThreadInfo> {
        self.thread.as_deref().and_then(|packet| match &packet.payload {
            PacketPayload::ThreadInfo(info) => Some(info),
            _ => None,
        })
    }
}

/// Kind of metric described by a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn code(self) -> i32 {
        match self {
            Self::Counter => 0,
            Self::Gauge => 1,
            Self::Histogram => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Counter),
            1 => Some(Self::Gauge),
            2 => Some(Self::Histogram),
            _ => None,
        }
    }
}

/// Defines a metric; samples depend on it
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub name: String,
    pub category: String,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub kind: MetricKind,
    /// Upper bounds of histogram buckets (empty for other kinds)
    pub bucket_bounds: Vec<f64>,
}

impl MetricDefinition {
    pub fn new(category: impl Into<String>, name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            caption: None,
            description: None,
            unit: None,
            kind,
            bucket_bounds: Vec::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_buckets(mut self, bounds: Vec<f64>) -> Self {
        self.bucket_bounds = bounds;
        self
    }
}

/// One sampled value of a defined metric
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// `MetricDefinition` dependency
    pub metric: Arc<Packet>,
    pub value: f64,
    /// Per-bucket counts for histogram metrics
    pub bucket_counts: Vec<i64>,
}

impl MetricSample {
    /// Create a sample; `metric` must be a `MetricDefinition` packet
    pub fn new(metric: &Arc<Packet>, value: f64) -> Result<Self, ContractError> {
        if !matches!(metric.payload, PacketPayload::MetricDefinition(_)) {
            return Err(ContractError::InvalidDependency {
                type_name: METRIC_SAMPLE,
                expected: METRIC_DEFINITION,
                actual: metric.type_name().to_string(),
            });
        }
        Ok(Self {
            metric: Arc::clone(metric),
            value,
            bucket_counts: Vec::new(),
        })
    }

    pub fn with_bucket_counts(mut self, counts: Vec<i64>) -> Self {
        self.bucket_counts = counts;
        self
    }

    pub fn definition(&self) -> Option<&MetricDefinition> {
        match &self.metric.payload {
            PacketPayload::MetricDefinition(definition) => Some(definition),
            _ => None,
        }
    }
}

/// Packet of a kind the reader does not know
///
/// Keeps the decoded definition and the raw field bytes so it can be
/// re-emitted unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericPacket {
    pub definition: Arc<PacketDefinition>,
    pub raw: Bytes,
}
