//! Repository Index
//!
//! Sessions live under `{root}/{product}/{application}/` as fragment files.
//! The index is rebuilt by scanning those files and grouping them by the
//! session id in each fragment's header. An `index.json` sidecar per
//! directory keeps the `sent` markers and cached summaries of closed
//! sessions so unchanged fragments are not re-read.
//!
//! All operations serialize on one lock per repository.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use codec::PacketRegistry;
use contracts::{
    FragmentInfo, RepositoryConfig, SessionEndStatus, SessionIdentity, SessionStatus,
    SessionSummary, Timestamp,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::fragment::{parse_fragment_file_name, scan_fragment};
use crate::ledger::{FragmentLedger, OpenFragment};

pub const INDEX_FILE_NAME: &str = "index.json";
const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    sessions: BTreeMap<Uuid, IndexEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    #[serde(default)]
    sent: bool,
    /// Closed sessions only
    #[serde(default)]
    summary: Option<SessionSummary>,
}

/// A fragment file found on disk
#[derive(Debug, Clone)]
struct FoundFragment {
    index: u32,
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// On-disk session repository
pub struct Repository {
    root: PathBuf,
    running_threshold: Duration,
    registry: Arc<PacketRegistry>,
    ledger: Arc<FragmentLedger>,
    lock: Mutex<()>,
}

impl Repository {
    pub fn open(
        root: impl Into<PathBuf>,
        running_threshold: Duration,
        registry: Arc<PacketRegistry>,
        ledger: Arc<FragmentLedger>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Repository opened");
        Ok(Self {
            root,
            running_threshold,
            registry,
            ledger,
            lock: Mutex::new(()),
        })
    }

    pub fn from_config(config: &RepositoryConfig, ledger: Arc<FragmentLedger>) -> Result<Self> {
        Self::open(
            &config.path,
            Duration::from_secs(config.running_threshold_secs),
            Arc::new(PacketRegistry::standard()),
            ledger,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger(&self) -> &Arc<FragmentLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    /// Directory holding a product/application's fragments
    pub fn session_dir(&self, product: &str, application: &str) -> PathBuf {
        self.root.join(product).join(application)
    }

    /// Rescan the repository and return every session, oldest first
    #[instrument(name = "repository_refresh", skip(self), fields(root = %self.root.display()))]
    pub fn refresh(&self) -> Result<Vec<SessionSummary>> {
        let _guard = self.lock.lock();
        self.refresh_locked()
    }

    /// Sessions matching `predicate`, oldest first
    pub fn find(&self, predicate: impl Fn(&SessionSummary) -> bool) -> Result<Vec<SessionSummary>> {
        Ok(self.refresh()?.into_iter().filter(|s| predicate(s)).collect())
    }

    pub fn get(&self, session_id: Uuid) -> Result<SessionSummary> {
        self.find(|s| s.session_id() == session_id)?
            .into_iter()
            .next()
            .ok_or(RepositoryError::SessionNotFound(session_id))
    }

    /// Flag a closed session as delivered
    ///
    /// Returns false (and changes nothing) for a running session.
    #[instrument(name = "repository_mark_sent", skip(self))]
    pub fn mark_sent(&self, session_id: Uuid) -> Result<bool> {
        let _guard = self.lock.lock();
        let summary = self.find_locked(session_id)?;
        if summary.is_running() {
            debug!(%session_id, "Not marking running session as sent");
            return Ok(false);
        }
        let dir = self.dir_of(&summary.identity);
        let mut index = self.load_index(&dir);
        let entry = index.sessions.entry(session_id).or_default();
        entry.sent = true;
        if let Some(cached) = entry.summary.as_mut() {
            cached.sent = true;
        }
        self.save_index(&dir, &index)?;
        info!(%session_id, "Session marked as sent");
        Ok(true)
    }

    /// Delete every fragment of a closed session; returns bytes freed
    #[instrument(name = "repository_delete_session", skip(self))]
    pub fn delete_session(&self, session_id: Uuid) -> Result<u64> {
        let _guard = self.lock.lock();
        let summary = self.find_locked(session_id)?;
        self.delete_locked(&summary)
    }

    /// Raw bytes of a closed fragment
    pub fn read_fragment_bytes(&self, fragment: &FragmentInfo) -> Result<Vec<u8>> {
        if !fragment.closed || self.ledger.is_open(&fragment.path) {
            return Err(RepositoryError::FragmentOpen(fragment.path.clone()));
        }
        Ok(fs::read(&fragment.path)?)
    }

    pub(crate) fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub(crate) fn find_locked(&self, session_id: Uuid) -> Result<SessionSummary> {
        self.refresh_locked()?
            .into_iter()
            .find(|s| s.session_id() == session_id)
            .ok_or(RepositoryError::SessionNotFound(session_id))
    }

    pub(crate) fn delete_locked(&self, summary: &SessionSummary) -> Result<u64> {
        let session_id = summary.session_id();
        if summary.is_running() || self.ledger.is_session_open(session_id) {
            return Err(RepositoryError::SessionRunning(session_id));
        }
        let mut freed = 0;
        for fragment in &summary.fragments {
            if self.ledger.is_open(&fragment.path) {
                return Err(RepositoryError::FragmentOpen(fragment.path.clone()));
            }
            match fs::remove_file(&fragment.path) {
                Ok(()) => freed += fragment.size,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let dir = self.dir_of(&summary.identity);
        let mut index = self.load_index(&dir);
        if index.sessions.remove(&session_id).is_some() {
            self.save_index(&dir, &index)?;
        }
        info!(%session_id, bytes = freed, "Session deleted");
        Ok(freed)
    }

    pub(crate) fn refresh_locked(&self) -> Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for dir in self.session_dirs()? {
            sessions.extend(self.refresh_dir(&dir)?);
        }
        sessions.sort_by_key(|s| (s.identity.started_at, s.session_id()));
        Ok(sessions)
    }

    fn dir_of(&self, identity: &SessionIdentity) -> PathBuf {
        self.session_dir(&identity.product, &identity.application)
    }

    /// `{root}/{product}/{application}` directories
    fn session_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for product in read_subdirs(&self.root)? {
            dirs.extend(read_subdirs(&product)?);
        }
        Ok(dirs)
    }

    fn refresh_dir(&self, dir: &Path) -> Result<Vec<SessionSummary>> {
        let mut groups: HashMap<Uuid, Vec<FoundFragment>> = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some((session_id, index)) = parse_fragment_file_name(&path) else {
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            groups.entry(session_id).or_default().push(FoundFragment {
                index,
                path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            });
        }

        let open: HashMap<PathBuf, OpenFragment> =
            self.ledger.open_fragments(Some(dir)).into_iter().collect();
        let old_index = self.load_index(dir);
        let mut new_index = IndexFile {
            version: INDEX_FORMAT_VERSION,
            sessions: BTreeMap::new(),
        };
        let mut summaries = Vec::with_capacity(groups.len());

        for (session_id, mut files) in groups {
            files.sort_by_key(|f| f.index);
            let entry = old_index.sessions.get(&session_id).cloned().unwrap_or_default();
            let any_open = files.iter().any(|f| open.contains_key(&f.path));

            let cached = entry
                .summary
                .as_ref()
                .filter(|cached| !any_open && cache_matches(cached, &files))
                .map(|cached| with_current_paths(cached, &files));
            let summary = match cached {
                Some(summary) => Some(summary),
                None => self.summarize(session_id, &files, &open)?,
            };
            let Some(mut summary) = summary else {
                continue;
            };
            summary.sent = entry.sent;

            new_index.sessions.insert(
                session_id,
                IndexEntry {
                    sent: entry.sent,
                    summary: (!summary.is_running()).then(|| summary.clone()),
                },
            );
            summaries.push(summary);
        }

        if new_index.sessions != old_index.sessions {
            self.save_index(dir, &new_index)?;
        }
        Ok(summaries)
    }

    /// Build a summary from the fragments themselves
    ///
    /// The scan is repeated once if a writer opened or closed one of the
    /// session's fragments meanwhile.
    fn summarize(
        &self,
        session_id: Uuid,
        files: &[FoundFragment],
        open: &HashMap<PathBuf, OpenFragment>,
    ) -> Result<Option<SessionSummary>> {
        let before = self.ledger.generation(session_id);
        let summary = self.scan_session(files, open)?;
        if self.ledger.generation(session_id) == before {
            return Ok(summary);
        }
        debug!(%session_id, "Session changed during scan, rescanning");
        let open: HashMap<PathBuf, OpenFragment> = self
            .ledger
            .open_fragments(files.first().and_then(|f| f.path.parent()))
            .into_iter()
            .collect();
        let mut summary = self.scan_session(files, &open)?;
        // Still moving: whatever we saw, a writer owns it
        if self.ledger.generation(session_id) != before {
            if let Some(summary) = summary.as_mut() {
                summary.status = SessionStatus::Running;
            }
        }
        Ok(summary)
    }

    fn scan_session(
        &self,
        files: &[FoundFragment],
        open: &HashMap<PathBuf, OpenFragment>,
    ) -> Result<Option<SessionSummary>> {
        let now = SystemTime::now();
        let mut identity: Option<SessionIdentity> = None;
        let mut fragments = Vec::with_capacity(files.len());
        let mut ended: Option<(SessionEndStatus, Timestamp)> = None;
        let mut writing = false;
        let mut last_write = SystemTime::UNIX_EPOCH;

        for file in files {
            last_write = last_write.max(file.modified);
            if let Some(owner) = open.get(&file.path) {
                writing = true;
                identity.get_or_insert_with(|| owner.identity.clone());
                fragments.push(FragmentInfo {
                    index: file.index,
                    path: file.path.clone(),
                    size: file.size,
                    closed: false,
                });
                continue;
            }

            let scan = match scan_fragment(&file.path, Arc::clone(&self.registry)) {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Ignoring unreadable fragment");
                    continue;
                }
            };
            let recent = is_recent(now, file.modified, self.running_threshold);
            // Another process may still be appending to an untrailed fragment
            let closed = scan.trailer.is_some() || !recent;
            writing |= !closed;
            if let Some(close) = &scan.close {
                ended = Some((close.status, close.end_time));
            } else if let Some(trailer) = scan.trailer.as_ref().filter(|t| t.session_ended) {
                ended.get_or_insert((SessionEndStatus::Normal, trailer.end_time));
            }
            identity.get_or_insert(scan.header.identity);
            fragments.push(FragmentInfo {
                index: file.index,
                path: file.path.clone(),
                size: file.size,
                closed,
            });
        }

        let Some(identity) = identity else {
            return Ok(None);
        };
        let running = writing || (ended.is_none() && is_recent(now, last_write, self.running_threshold));
        let (status, end_status, ended_at) = match (running, ended) {
            (true, _) => (SessionStatus::Running, None, None),
            (false, Some((status, at))) => (SessionStatus::Closed, Some(status), Some(at)),
            // No close marker and nothing written lately: the process is gone
            (false, None) => (
                SessionStatus::Closed,
                Some(SessionEndStatus::Crashed),
                Some(to_timestamp(last_write)),
            ),
        };
        Ok(Some(SessionSummary {
            identity,
            status,
            end_status,
            ended_at,
            sent: false,
            fragments,
        }))
    }

    fn load_index(&self, dir: &Path) -> IndexFile {
        let path = dir.join(INDEX_FILE_NAME);
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<IndexFile>(&bytes) {
                Ok(index) if index.version == INDEX_FORMAT_VERSION => index,
                Ok(index) => {
                    warn!(path = %path.display(), version = index.version, "Unknown index version, rebuilding");
                    IndexFile::default()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt index, rebuilding");
                    IndexFile::default()
                }
            },
            Err(_) => IndexFile::default(),
        }
    }

    /// Write via a temp file so a crash never leaves a torn index
    fn save_index(&self, dir: &Path, index: &IndexFile) -> Result<()> {
        let path = dir.join(INDEX_FILE_NAME);
        let tmp = dir.join(format!("{INDEX_FILE_NAME}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(index)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), sessions = index.sessions.len(), "Index saved");
        Ok(())
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn is_recent(now: SystemTime, at: SystemTime, threshold: Duration) -> bool {
    now.duration_since(at).map_or(true, |age| age < threshold)
}

fn to_timestamp(at: SystemTime) -> Timestamp {
    DateTime::<Local>::from(at).fixed_offset()
}

/// Cached summary still describes exactly these closed files
fn cache_matches(cached: &SessionSummary, files: &[FoundFragment]) -> bool {
    cached.fragments.len() == files.len()
        && cached
            .fragments
            .iter()
            .zip(files)
            .all(|(c, f)| c.closed && c.index == f.index && c.size == f.size)
}

fn with_current_paths(cached: &SessionSummary, files: &[FoundFragment]) -> SessionSummary {
    let mut summary = cached.clone();
    for (fragment, file) in summary.fragments.iter_mut().zip(files) {
        fragment.path = file.path.clone();
    }
    summary
}
