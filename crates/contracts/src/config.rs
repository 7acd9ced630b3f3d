//! AgentConfig - Config Loader output
//!
//! Describes the complete agent configuration: session identity, messenger
//! tuning, sink routing, repository limits and the collector endpoint.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::SessionIdentity;

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Configuration version
    #[serde(default)]
    pub version: ConfigVersion,

    /// Who is recording
    pub session: SessionConfig,

    /// Messenger tuning
    #[serde(default)]
    pub messenger: MessengerConfig,

    /// Output routing
    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkConfig>,

    /// Local session repository
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Remote collector (optional)
    #[serde(default)]
    pub server: ServerConfig,
}

/// Product / application identity for recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub product: String,
    pub application: String,
    #[serde(default = "default_application_version")]
    pub application_version: String,
    #[serde(default)]
    pub environment: Option<String>,
    /// Overrides host name detection
    #[serde(default)]
    pub host_name: Option<String>,
}

fn default_application_version() -> String {
    "0.0.0".to_string()
}

impl SessionConfig {
    /// Identity for a new session of this process
    pub fn to_identity(&self) -> SessionIdentity {
        let mut identity = SessionIdentity::new(
            &self.product,
            &self.application,
            &self.application_version,
        );
        identity.environment = self.environment.clone();
        if let Some(host) = &self.host_name {
            identity.host_name = host.clone();
        }
        identity
    }
}

/// Messenger tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Default per-sink queue capacity
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,

    /// Write on the caller when a sink queue is full instead of waiting
    #[serde(default)]
    pub force_synchronous: bool,

    /// Consecutive failures after which a sink disables itself
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_max_queue_length() -> usize {
    2000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            max_queue_length: default_max_queue_length(),
            force_synchronous: false,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// Sink output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Sink name
    pub name: String,

    /// Sink type
    pub sink_type: SinkType,

    /// Queue capacity (defaults to `messenger.max_queue_length`)
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Type-specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_sinks() -> Vec<SinkConfig> {
    vec![SinkConfig {
        name: "file".to_string(),
        sink_type: SinkType::File,
        queue_capacity: None,
        params: HashMap::new(),
    }]
}

/// Sink type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    /// Session fragment files in the repository
    File,
    /// Live packet stream to a TCP collector
    Network,
    /// Human-readable export file
    Export,
}

impl SinkType {
    /// Parameters this sink type understands
    pub fn known_params(self) -> &'static [&'static str] {
        match self {
            Self::File => &[],
            Self::Network => &["host", "port", "connect_timeout_ms"],
            Self::Export => &["path", "format"],
        }
    }

    /// Parameters that must be present
    pub fn required_params(self) -> &'static [&'static str] {
        match self {
            Self::File => &[],
            Self::Network => &["host", "port"],
            Self::Export => &["path"],
        }
    }
}

/// Local session repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository root; sessions live under `{path}/{product}/{application}`
    #[serde(default = "default_repository_path")]
    pub path: PathBuf,

    /// Sessions older than this are pruned (None = keep)
    #[serde(default = "default_max_age_days")]
    pub max_age_days: Option<u32>,

    /// Prune oldest sessions beyond this total size (None = unbounded)
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: Option<u64>,

    /// Unclosed sessions written within this window count as running
    #[serde(default = "default_running_threshold_secs")]
    pub running_threshold_secs: u64,

    /// Roll the active fragment over past this size
    #[serde(default = "default_max_fragment_size_kb")]
    pub max_fragment_size_kb: u64,

    /// Roll the active fragment over after this long
    #[serde(default = "default_max_fragment_duration_secs")]
    pub max_fragment_duration_secs: u64,
}

fn default_repository_path() -> PathBuf {
    std::env::temp_dir().join("beacon")
}

fn default_max_age_days() -> Option<u32> {
    Some(30)
}

fn default_max_size_mb() -> Option<u64> {
    Some(500)
}

fn default_running_threshold_secs() -> u64 {
    300
}

fn default_max_fragment_size_kb() -> u64 {
    20 * 1024
}

fn default_max_fragment_duration_secs() -> u64 {
    24 * 60 * 60
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repository_path(),
            max_age_days: default_max_age_days(),
            max_size_mb: default_max_size_mb(),
            running_threshold_secs: default_running_threshold_secs(),
            max_fragment_size_kb: default_max_fragment_size_kb(),
            max_fragment_duration_secs: default_max_fragment_duration_secs(),
        }
    }
}

/// Remote collector configuration
///
/// Either `customer_key` (hosted hub) or `host` (private collector) names
/// the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub customer_key: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,

    #[serde(default)]
    pub base_path: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries per chunk for recoverable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: usize,

    /// zstd-compress package bodies
    #[serde(default = "default_compress")]
    pub compress: bool,
}

fn default_use_ssl() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_size_kb() -> usize {
    1024
}

fn default_compress() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            customer_key: None,
            host: None,
            port: None,
            use_ssl: default_use_ssl(),
            base_path: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            chunk_size_kb: default_chunk_size_kb(),
            compress: default_compress(),
        }
    }
}

impl ServerConfig {
    /// True when a destination is named at all
    pub fn is_configured(&self) -> bool {
        self.customer_key.as_deref().is_some_and(|k| !k.is_empty())
            || self.host.as_deref().is_some_and(|h| !h.is_empty())
    }
}

impl AgentConfig {
    /// Minimal configuration with the default file sink
    pub fn new(product: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            version: ConfigVersion::V1,
            session: SessionConfig {
                product: product.into(),
                application: application.into(),
                application_version: default_application_version(),
                environment: None,
                host_name: None,
            },
            messenger: MessengerConfig::default(),
            sinks: default_sinks(),
            repository: RepositoryConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Queue capacity for a sink, falling back to the messenger default
    pub fn queue_capacity(&self, sink: &SinkConfig) -> usize {
        sink.queue_capacity.unwrap_or(self.messenger.max_queue_length)
    }
}
