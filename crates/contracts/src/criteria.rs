//! Publish modes and session selection criteria

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long `publish` waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Enqueue on every sink and return
    #[default]
    Queued,
    /// Wait until a durable sink has persisted the packet
    WaitForCommit,
    /// Wait until every sink has processed the packet
    WaitForTask,
}

/// Which sessions the packager selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criteria {
    /// Empty selection
    None,
    /// The current process's own session
    ActiveSession,
    /// Closed sessions not yet marked sent
    NewSessions,
    AllSessions,
    SessionId(Uuid),
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::ActiveSession => f.write_str("active"),
            Self::NewSessions => f.write_str("new"),
            Self::AllSessions => f.write_str("all"),
            Self::SessionId(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for Criteria {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "active" | "active_session" => Ok(Self::ActiveSession),
            "new" | "new_sessions" => Ok(Self::NewSessions),
            "all" | "all_sessions" => Ok(Self::AllSessions),
            other => Uuid::parse_str(other)
                .map(Self::SessionId)
                .map_err(|_| format!("unknown criteria '{s}'")),
        }
    }
}
