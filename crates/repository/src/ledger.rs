//! Fragment ownership ledger
//!
//! Tracks which fragment files are open for writing in this process. A
//! per-session generation counter moves on every open and close so a reader
//! can tell whether a session changed while it was being scanned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use contracts::SessionIdentity;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RepositoryError, Result};

/// A fragment currently owned by a writer
#[derive(Debug, Clone)]
pub struct OpenFragment {
    pub identity: SessionIdentity,
    pub index: u32,
}

#[derive(Debug, Default)]
struct LedgerState {
    open: HashMap<PathBuf, OpenFragment>,
    generations: HashMap<Uuid, u64>,
}

/// Shared record of open fragments
#[derive(Debug, Default)]
pub struct FragmentLedger {
    state: Mutex<LedgerState>,
}

impl FragmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` for writing; returns the session's new generation
    pub fn open(&self, path: &Path, identity: &SessionIdentity, index: u32) -> Result<u64> {
        let mut state = self.state.lock();
        if state.open.contains_key(path) {
            return Err(RepositoryError::FragmentOpen(path.to_path_buf()));
        }
        state.open.insert(
            path.to_path_buf(),
            OpenFragment {
                identity: identity.clone(),
                index,
            },
        );
        let generation = state.generations.entry(identity.session_id).or_default();
        *generation += 1;
        debug!(path = %path.display(), generation = *generation, "Fragment opened");
        Ok(*generation)
    }

    /// Release `path`; returns the session's new generation, if it was open
    pub fn close(&self, path: &Path) -> Option<u64> {
        let mut state = self.state.lock();
        let fragment = state.open.remove(path)?;
        let generation = state
            .generations
            .entry(fragment.identity.session_id)
            .or_default();
        *generation += 1;
        debug!(path = %path.display(), generation = *generation, "Fragment closed");
        Some(*generation)
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.state.lock().open.contains_key(path)
    }

    /// Whether any fragment of the session is open
    pub fn is_session_open(&self, session_id: Uuid) -> bool {
        self.state
            .lock()
            .open
            .values()
            .any(|f| f.identity.session_id == session_id)
    }

    /// 0 for sessions never opened in this process
    pub fn generation(&self, session_id: Uuid) -> u64 {
        self.state
            .lock()
            .generations
            .get(&session_id)
            .copied()
            .unwrap_or(0)
    }

    /// Open fragments, optionally restricted to a directory
    pub fn open_fragments(&self, dir: Option<&Path>) -> Vec<(PathBuf, OpenFragment)> {
        self.state
            .lock()
            .open
            .iter()
            .filter(|(path, _)| dir.is_none_or(|dir| path.parent() == Some(dir)))
            .map(|(path, fragment)| (path.clone(), fragment.clone()))
            .collect()
    }
}
