//! Session identity and repository summaries

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Offset-aware wall clock time used by every packet
pub type Timestamp = DateTime<FixedOffset>;

/// Current local time with its UTC offset
pub fn now() -> Timestamp {
    Local::now().fixed_offset()
}

/// Who recorded a session: product, application and the host process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: Uuid,
    pub product: String,
    pub application: String,
    pub application_version: String,
    pub environment: Option<String>,
    pub host_name: String,
    pub user_name: Option<String>,
    pub os_description: String,
    pub process_id: u32,
    pub started_at: Timestamp,
}

impl SessionIdentity {
    /// Identity for a new session of the current process
    pub fn new(
        product: impl Into<String>,
        application: impl Into<String>,
        application_version: impl Into<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            product: product.into(),
            application: application.into(),
            application_version: application_version.into(),
            environment: None,
            host_name: host_name(),
            user_name: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
            os_description: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            process_id: std::process::id(),
            started_at: now(),
        }
    }
}

/// Resolve the host name from the environment
///
/// Checks `BEACON_HOSTNAME`, then `HOSTNAME` / `COMPUTERNAME`, falling back to
/// `"unknown"`.
pub fn host_name() -> String {
    ["BEACON_HOSTNAME", "HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Lifecycle status of a recorded session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Still being written by a live process
    Running,
    /// Immutable; ended explicitly or its process is gone
    Closed,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndStatus {
    #[default]
    Normal,
    Crashed,
}

impl SessionEndStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::Crashed => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::Crashed),
            _ => None,
        }
    }
}

/// One fragment file of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentInfo {
    pub index: u32,
    pub path: PathBuf,
    pub size: u64,
    /// False while the fragment is open for writing
    pub closed: bool,
}

/// Repository index entry for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub identity: SessionIdentity,
    pub status: SessionStatus,
    pub end_status: Option<SessionEndStatus>,
    pub ended_at: Option<Timestamp>,
    pub sent: bool,
    pub fragments: Vec<FragmentInfo>,
}

impl SessionSummary {
    pub fn session_id(&self) -> Uuid {
        self.identity.session_id
    }

    /// Total bytes across all fragments
    pub fn total_size(&self) -> u64 {
        self.fragments.iter().map(|f| f.size).sum()
    }

    /// Fragments that may be opened for reading
    pub fn closed_fragments(&self) -> impl Iterator<Item = &FragmentInfo> {
        self.fragments.iter().filter(|f| f.closed)
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}
