//! Package file format
//!
//! ```text
//! magic "BCNPKG\0\0" | u16 version | u8 flags | u32 manifest_len | manifest | body
//! ```
//!
//! The manifest is bincode; the body is the concatenation of fragment bytes
//! in manifest order, zstd-compressed when flag bit 0 is set. All integers
//! are little-endian.

use std::fs;
use std::io::Write;
use std::path::Path;

use contracts::{now, SessionEndStatus, SessionIdentity, SessionStatus, SessionSummary, Timestamp};
use repository::Repository;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{PackagerError, Result};

pub const PACKAGE_MAGIC: &[u8; 8] = b"BCNPKG\0\0";
pub const PACKAGE_FORMAT_VERSION: u16 = 1;
pub const PACKAGE_EXTENSION: &str = "bpkg";

const FLAG_ZSTD: u8 = 0b0000_0001;
const HEADER_LEN: usize = 8 + 2 + 1 + 4;
const ZSTD_LEVEL: i32 = 3;

/// One fragment's slice of the body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFragment {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSession {
    pub identity: SessionIdentity,
    /// Status when the package was built
    pub status: SessionStatus,
    pub end_status: Option<SessionEndStatus>,
    pub fragments: Vec<ManifestFragment>,
}

impl ManifestSession {
    pub fn session_id(&self) -> Uuid {
        self.identity.session_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub package_id: Uuid,
    pub created_at: Timestamp,
    pub sessions: Vec<ManifestSession>,
    /// Uncompressed body length
    pub body_len: u64,
}

impl PackageManifest {
    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(ManifestSession::session_id).collect()
    }

    pub fn fragment_count(&self) -> usize {
        self.sessions.iter().map(|s| s.fragments.len()).sum()
    }
}

/// Aggregated fragments ready for one delivery
#[derive(Debug, Clone)]
pub struct Package {
    manifest: PackageManifest,
    body: Vec<u8>,
    compress: bool,
}

impl Package {
    /// Aggregate the closed fragments of `sessions`
    ///
    /// Open fragments are left out; a session with none readable is
    /// dropped from the manifest.
    #[instrument(name = "package_build", skip(sessions, repository), fields(sessions = sessions.len()))]
    pub fn build(sessions: &[SessionSummary], repository: &Repository, compress: bool) -> Result<Self> {
        let mut body = Vec::new();
        let mut manifest_sessions = Vec::with_capacity(sessions.len());

        for summary in sessions {
            let mut fragments = Vec::new();
            for fragment in summary.closed_fragments() {
                let bytes = repository.read_fragment_bytes(fragment)?;
                fragments.push(ManifestFragment {
                    index: fragment.index,
                    offset: body.len() as u64,
                    len: bytes.len() as u64,
                });
                body.extend_from_slice(&bytes);
            }
            if fragments.is_empty() {
                debug!(session_id = %summary.session_id(), "No closed fragments, session skipped");
                continue;
            }
            manifest_sessions.push(ManifestSession {
                identity: summary.identity.clone(),
                status: summary.status,
                end_status: summary.end_status,
                fragments,
            });
        }

        Ok(Self {
            manifest: PackageManifest {
                package_id: Uuid::new_v4(),
                created_at: now(),
                sessions: manifest_sessions,
                body_len: body.len() as u64,
            },
            body,
            compress,
        })
    }

    pub fn manifest(&self) -> &PackageManifest {
        &self.manifest
    }

    pub fn id(&self) -> Uuid {
        self.manifest.package_id
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.sessions.is_empty()
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    /// Uncompressed fragment bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Every fragment with its bytes, in manifest order
    pub fn fragments(&self) -> impl Iterator<Item = (&ManifestSession, &ManifestFragment, &[u8])> {
        self.manifest.sessions.iter().flat_map(move |session| {
            session.fragments.iter().map(move |fragment| {
                let start = fragment.offset as usize;
                let end = start + fragment.len as usize;
                (session, fragment, &self.body[start..end])
            })
        })
    }

    /// File / wire representation
    pub fn encode(&self) -> Result<Vec<u8>> {
        let manifest = bincode::serialize(&self.manifest)?;
        let manifest_len = u32::try_from(manifest.len())
            .map_err(|_| PackagerError::InvalidPackage("manifest too large".to_string()))?;
        let (flags, body) = if self.compress {
            (FLAG_ZSTD, zstd::encode_all(self.body.as_slice(), ZSTD_LEVEL)?)
        } else {
            (0, self.body.clone())
        };

        let mut out = Vec::with_capacity(HEADER_LEN + manifest.len() + body.len());
        out.extend_from_slice(PACKAGE_MAGIC);
        out.extend_from_slice(&PACKAGE_FORMAT_VERSION.to_le_bytes());
        out.push(flags);
        out.extend_from_slice(&manifest_len.to_le_bytes());
        out.extend_from_slice(&manifest);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid("file too short"));
        }
        if &bytes[..8] != PACKAGE_MAGIC {
            return Err(invalid("bad magic"));
        }
        let version = u16::from_le_bytes([bytes[8], bytes[9]]);
        if version != PACKAGE_FORMAT_VERSION {
            return Err(invalid(format!("unsupported format version {version}")));
        }
        let flags = bytes[10];
        if flags & !FLAG_ZSTD != 0 {
            return Err(invalid(format!("unknown flags {flags:#04x}")));
        }
        let manifest_len = u32::from_le_bytes([bytes[11], bytes[12], bytes[13], bytes[14]]) as usize;
        let manifest_end = HEADER_LEN
            .checked_add(manifest_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| invalid("manifest length exceeds file"))?;

        let manifest: PackageManifest = bincode::deserialize(&bytes[HEADER_LEN..manifest_end])?;
        let compress = flags & FLAG_ZSTD != 0;
        let body = if compress {
            zstd::decode_all(&bytes[manifest_end..])?
        } else {
            bytes[manifest_end..].to_vec()
        };

        if body.len() as u64 != manifest.body_len {
            return Err(invalid(format!(
                "body is {} bytes, manifest says {}",
                body.len(),
                manifest.body_len
            )));
        }
        let in_bounds = manifest
            .sessions
            .iter()
            .flat_map(|s| &s.fragments)
            .all(|f| f.offset.checked_add(f.len).is_some_and(|end| end <= manifest.body_len));
        if !in_bounds {
            return Err(invalid("fragment outside body"));
        }

        Ok(Self {
            manifest,
            body,
            compress,
        })
    }

    /// Write atomically: temp file then rename
    #[instrument(name = "package_write", skip(self), fields(package_id = %self.id()))]
    pub fn write_to(&self, path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let bytes = self.encode()?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "Package written");
        Ok(bytes.len() as u64)
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::decode(&fs::read(path)?)
    }
}

fn invalid(message: impl Into<String>) -> PackagerError {
    PackagerError::InvalidPackage(message.into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use codec::PacketRegistry;
    use contracts::{LogMessage, Packet, SessionClose, Severity};
    use repository::{FragmentLedger, FragmentWriter};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    pub(crate) fn repository(root: &Path) -> Repository {
        Repository::open(
            root,
            Duration::from_secs(300),
            Arc::new(PacketRegistry::standard()),
            Arc::new(FragmentLedger::new()),
        )
        .unwrap()
    }

    /// Write a session of `messages` log messages in one fragment
    pub(crate) fn write_session(repo: &Repository, messages: u64, close: bool) -> SessionIdentity {
        let identity = SessionIdentity::new("Acme", "Billing", "1.0");
        let dir = repo.session_dir(&identity.product, &identity.application);
        let mut writer = FragmentWriter::create(
            &dir,
            &identity,
            0,
            Default::default(),
            Arc::clone(repo.ledger()),
        )
        .unwrap();
        for sequence in 1..=messages {
            let packet = Packet {
                sequence,
                ..Packet::new(LogMessage::new(Severity::Information, "Test", "hello"))
            };
            writer.write(&packet.shared()).unwrap();
        }
        if close {
            let packet = Packet {
                sequence: messages + 1,
                ..Packet::new(SessionClose::normal())
            };
            writer.write(&packet.shared()).unwrap();
        }
        writer.finish(close).unwrap();
        identity
    }

    #[test]
    fn test_package_file_reopens() {
        let dir = tempdir().unwrap();
        let repo = repository(&dir.path().join("repo"));
        write_session(&repo, 5, true);
        write_session(&repo, 3, true);

        let sessions = repo.refresh().unwrap();
        let package = Package::build(&sessions, &repo, true).unwrap();
        assert_eq!(package.manifest().sessions.len(), 2);
        assert_eq!(package.manifest().fragment_count(), 2);

        let path = dir.path().join("out/package.bpkg");
        package.write_to(&path).unwrap();
        let reopened = Package::open(&path).unwrap();
        assert_eq!(reopened.manifest(), package.manifest());
        assert!(reopened.is_compressed());

        for ((_, fragment, bytes), summary) in reopened.fragments().zip(&sessions) {
            let original = std::fs::read(&summary.fragments[0].path).unwrap();
            assert_eq!(fragment.index, 0);
            assert_eq!(bytes, original.as_slice());
        }
    }

    #[test]
    fn test_package_skips_open_fragments() {
        let dir = tempdir().unwrap();
        let repo = repository(&dir.path().join("repo"));
        let identity = SessionIdentity::new("Acme", "Billing", "1.0");
        let writer = FragmentWriter::create(
            &repo.session_dir("Acme", "Billing"),
            &identity,
            0,
            Default::default(),
            Arc::clone(repo.ledger()),
        )
        .unwrap();

        let sessions = repo.refresh().unwrap();
        let package = Package::build(&sessions, &repo, false).unwrap();
        assert!(package.is_empty());
        drop(writer);
    }

    #[test]
    fn test_package_rejects_garbage() {
        assert!(matches!(
            Package::decode(b"not a package at all"),
            Err(PackagerError::InvalidPackage(_))
        ));

        let dir = tempdir().unwrap();
        let repo = repository(&dir.path().join("repo"));
        write_session(&repo, 2, true);
        let package = Package::build(&repo.refresh().unwrap(), &repo, false).unwrap();
        let mut bytes = package.encode().unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            Package::decode(&bytes),
            Err(PackagerError::InvalidPackage(_))
        ));
    }
}
