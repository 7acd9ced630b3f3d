//! Repository maintenance sweep

use chrono::TimeDelta;
use contracts::{RepositoryConfig, SessionSummary, Timestamp};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::index::Repository;

/// Limits enforced by [`Repository::prune`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PrunePolicy {
    /// Remove closed sessions that ended longer ago than this
    pub max_age: Option<TimeDelta>,
    /// Remove oldest closed sessions while the repository is larger than this
    pub max_size: Option<u64>,
}

impl PrunePolicy {
    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self {
            max_age: config.max_age_days.map(|days| TimeDelta::days(i64::from(days))),
            max_size: config.max_size_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
        }
    }
}

/// What a sweep removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub removed: Vec<Uuid>,
    pub bytes_freed: u64,
    /// Repository size after the sweep
    pub remaining_bytes: u64,
}

impl Repository {
    /// Delete closed sessions past the age limit, then oldest closed sessions
    /// until the repository fits the size limit
    ///
    /// Running sessions and open fragments are never touched, so the size
    /// limit can remain exceeded.
    #[instrument(name = "repository_prune", skip(self))]
    pub fn prune(&self, policy: &PrunePolicy) -> Result<PruneReport> {
        self.prune_at(policy, contracts::now())
    }

    pub(crate) fn prune_at(&self, policy: &PrunePolicy, now: Timestamp) -> Result<PruneReport> {
        let _guard = self.guard();
        let sessions = self.refresh_locked()?;
        let mut total: u64 = sessions.iter().map(SessionSummary::total_size).sum();

        let mut candidates: Vec<&SessionSummary> =
            sessions.iter().filter(|s| !s.is_running()).collect();
        candidates.sort_by_key(|s| last_activity(s));

        let mut report = PruneReport::default();
        for session in candidates {
            let expired = policy
                .max_age
                .is_some_and(|max_age| now.signed_duration_since(last_activity(session)) > max_age);
            let oversize = policy.max_size.is_some_and(|max_size| total > max_size);
            if !expired && !oversize {
                continue;
            }
            match self.delete_locked(session) {
                Ok(freed) => {
                    total = total.saturating_sub(freed);
                    report.bytes_freed += freed;
                    report.removed.push(session.session_id());
                }
                // Became active since the scan
                Err(RepositoryError::SessionRunning(_) | RepositoryError::FragmentOpen(_)) => {
                    warn!(session_id = %session.session_id(), "Skipping session in use");
                }
                Err(e) => return Err(e),
            }
        }
        report.remaining_bytes = total;
        info!(
            removed = report.removed.len(),
            bytes_freed = report.bytes_freed,
            remaining_bytes = total,
            "Prune complete"
        );
        Ok(report)
    }
}

fn last_activity(session: &SessionSummary) -> Timestamp {
    session.ended_at.unwrap_or(session.identity.started_at)
}
