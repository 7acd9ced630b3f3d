//! Session fragment files
//!
//! ```text
//! fragment := magic "BCNFRAG\0" | u16 format version (LE) | records...
//! ```
//!
//! The first record is a `SessionHeader`; a cleanly closed fragment ends with
//! a `FragmentTrailer`. Files are named `{session_id}_{index:04}.bsf`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use codec::{CodecError, DependencyTable, PacketReader, PacketRegistry, PacketWriter};
use contracts::{
    now, FragmentInfo, FragmentTrailer, Packet, PacketPayload, SessionClose, SessionHeader,
    SessionIdentity,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::ledger::FragmentLedger;

pub const FRAGMENT_MAGIC: &[u8; 8] = b"BCNFRAG\0";
pub const FRAGMENT_FORMAT_VERSION: u16 = 1;
pub const FRAGMENT_EXTENSION: &str = "bsf";

pub fn fragment_file_name(session_id: Uuid, index: u32) -> String {
    format!("{session_id}_{index:04}.{FRAGMENT_EXTENSION}")
}

/// Inverse of [`fragment_file_name`]
pub fn parse_fragment_file_name(path: &Path) -> Option<(Uuid, u32)> {
    if path.extension()? != FRAGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (id, index) = stem.rsplit_once('_')?;
    Some((Uuid::parse_str(id).ok()?, index.parse().ok()?))
}

/// Appends packets to one fragment file
///
/// The path is registered with the [`FragmentLedger`] for the writer's
/// lifetime.
pub struct FragmentWriter {
    path: PathBuf,
    index: u32,
    writer: PacketWriter<BufWriter<File>>,
    ledger: Arc<FragmentLedger>,
    opened_at: Instant,
    finished: bool,
}

impl FragmentWriter {
    /// Create fragment `index` of a session in `dir` and write its header
    ///
    /// `known` carries dependency targets from the previous fragment so they
    /// can be repeated here when needed.
    pub fn create(
        dir: &Path,
        identity: &SessionIdentity,
        index: u32,
        known: DependencyTable,
        ledger: Arc<FragmentLedger>,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(fragment_file_name(identity.session_id, index));
        ledger.open(&path, identity, index)?;

        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                ledger.close(&path);
                return Err(e.into());
            }
        };
        let mut out = BufWriter::new(file);
        let header = Packet::new(SessionHeader {
            identity: identity.clone(),
            fragment_index: index,
            fragment_start: now(),
        })
        .shared();
        let written = out
            .write_all(FRAGMENT_MAGIC)
            .and_then(|()| out.write_all(&FRAGMENT_FORMAT_VERSION.to_le_bytes()));
        let mut writer = PacketWriter::with_known(out, known);
        let result = written
            .map_err(RepositoryError::from)
            .and_then(|()| writer.write(&header).map_err(RepositoryError::from))
            .and_then(|_| writer.flush().map_err(RepositoryError::from));
        if let Err(e) = result {
            ledger.close(&path);
            return Err(e);
        }

        debug!(path = %path.display(), index, "Fragment created");
        Ok(Self {
            path,
            index,
            writer,
            ledger,
            opened_at: Instant::now(),
            finished: false,
        })
    }

    pub fn write(&mut self, packet: &Arc<Packet>) -> Result<u64> {
        Ok(self.writer.write(packet)?)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bytes in the file including the preamble
    pub fn size(&self) -> u64 {
        (FRAGMENT_MAGIC.len() + 2) as u64 + self.writer.bytes_written()
    }

    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    /// Packets written after the header (dependencies included)
    pub fn body_packets(&self) -> u64 {
        self.writer.packets_written().saturating_sub(1)
    }

    pub fn last_sequence(&self) -> u64 {
        self.writer.last_sequence()
    }

    /// Write the trailer, sync and release the file
    ///
    /// Returns the closed fragment and the dependency targets seen, for the
    /// next fragment.
    pub fn finish(mut self, session_ended: bool) -> Result<(FragmentInfo, DependencyTable)> {
        let trailer = Packet {
            sequence: self.writer.last_sequence(),
            ..Packet::new(FragmentTrailer {
                fragment_index: self.index,
                packet_count: self.body_packets(),
                last_sequence: self.writer.last_sequence(),
                end_time: now(),
                session_ended,
            })
        }
        .shared();
        self.writer.write(&trailer)?;
        self.writer.flush()?;
        self.writer.get_ref().get_ref().sync_all()?;

        let info = FragmentInfo {
            index: self.index,
            path: self.path.clone(),
            size: self.size(),
            closed: true,
        };
        self.finished = true;
        self.ledger.close(&self.path);
        debug!(path = %self.path.display(), size = info.size, session_ended, "Fragment closed");

        Ok((info, self.writer.take_known()))
    }
}

impl Drop for FragmentWriter {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.writer.flush() {
                warn!(path = %self.path.display(), error = %e, "Flush failed on drop");
            }
            self.ledger.close(&self.path);
        }
    }
}

/// Open a fragment for reading, checking its preamble
pub fn open_fragment(
    path: &Path,
    registry: Arc<PacketRegistry>,
) -> Result<PacketReader<BufReader<File>>> {
    let mut file = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 8];
    let mut version = [0u8; 2];
    file.read_exact(&mut magic)
        .and_then(|()| file.read_exact(&mut version))
        .map_err(|_| RepositoryError::invalid_fragment(path, "missing fragment preamble"))?;
    if &magic != FRAGMENT_MAGIC {
        return Err(RepositoryError::invalid_fragment(path, "bad magic"));
    }
    let version = u16::from_le_bytes(version);
    if version != FRAGMENT_FORMAT_VERSION {
        return Err(RepositoryError::invalid_fragment(
            path,
            format!("unsupported format version {version}"),
        ));
    }
    Ok(PacketReader::new(file, registry))
}

/// What a full pass over one fragment found
#[derive(Debug, Clone)]
pub struct FragmentScan {
    pub header: SessionHeader,
    /// Packets read after the header, trailer excluded
    pub packet_count: u64,
    pub last_sequence: u64,
    pub trailer: Option<FragmentTrailer>,
    pub close: Option<SessionClose>,
    /// Records that failed to decode
    pub bad_packets: u64,
    /// Ended in a partial record
    pub torn: bool,
}

impl FragmentScan {
    /// The session ended in this fragment
    pub fn ends_session(&self) -> bool {
        self.close.is_some() || self.trailer.as_ref().is_some_and(|t| t.session_ended)
    }
}

/// Read a fragment end to end
///
/// Per-packet decode failures are counted, a torn tail ends the scan.
pub fn scan_fragment(path: &Path, registry: Arc<PacketRegistry>) -> Result<FragmentScan> {
    let mut packets = open_fragment(path, registry)?;
    let header = match packets.next() {
        Some(Ok(Packet {
            payload: PacketPayload::SessionHeader(header),
            ..
        })) => header,
        Some(Err(e)) => return Err(e.into()),
        _ => return Err(RepositoryError::invalid_fragment(path, "missing session header")),
    };

    let mut scan = FragmentScan {
        header,
        packet_count: 0,
        last_sequence: 0,
        trailer: None,
        close: None,
        bad_packets: 0,
        torn: false,
    };
    for item in packets {
        match item {
            Ok(packet) => {
                scan.last_sequence = scan.last_sequence.max(packet.sequence);
                match packet.payload {
                    PacketPayload::FragmentTrailer(trailer) => scan.trailer = Some(trailer),
                    PacketPayload::SessionClose(close) => {
                        scan.close = Some(close);
                        scan.packet_count += 1;
                    }
                    _ => scan.packet_count += 1,
                }
            }
            Err(CodecError::Truncated { .. }) => {
                debug!(path = %path.display(), "Fragment has a torn tail");
                scan.torn = true;
            }
            Err(e) if !e.is_fatal() => {
                warn!(path = %path.display(), error = %e, "Skipping undecodable packet");
                scan.bad_packets += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{LogMessage, Severity};

    fn message(sequence: u64, caption: &str) -> Arc<Packet> {
        Packet {
            sequence,
            ..Packet::new(LogMessage::new(Severity::Information, "Test", caption))
        }
        .shared()
    }

    #[test]
    fn file_names_round_trip() {
        let id = Uuid::new_v4();
        let name = fragment_file_name(id, 12);
        assert!(name.ends_with("_0012.bsf"));
        assert_eq!(parse_fragment_file_name(Path::new(&name)), Some((id, 12)));
        assert_eq!(parse_fragment_file_name(Path::new("index.json")), None);
        assert_eq!(parse_fragment_file_name(Path::new("nope_0001.bsf")), None);
    }

    #[test]
    fn write_finish_scan() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FragmentLedger::new());
        let identity = SessionIdentity::new("Acme", "Billing", "1.0");

        let mut writer =
            FragmentWriter::create(dir.path(), &identity, 0, DependencyTable::new(), Arc::clone(&ledger))
                .unwrap();
        assert!(ledger.is_open(writer.path()));
        for i in 1..=3 {
            writer.write(&message(i, "hello")).unwrap();
        }
        let path = writer.path().to_path_buf();
        let (info, _) = writer.finish(false).unwrap();
        assert!(!ledger.is_open(&path));
        assert_eq!(info.size, fs::metadata(&path).unwrap().len());

        let scan = scan_fragment(&path, Arc::new(PacketRegistry::standard())).unwrap();
        assert_eq!(scan.header.identity.session_id, identity.session_id);
        assert_eq!(scan.packet_count, 3);
        assert_eq!(scan.last_sequence, 3);
        let trailer = scan.trailer.unwrap();
        assert_eq!(trailer.packet_count, 3);
        assert!(!trailer.session_ended);
        assert!(!scan.torn);
    }

    #[test]
    fn dropped_writer_leaves_a_readable_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FragmentLedger::new());
        let identity = SessionIdentity::new("Acme", "Billing", "1.0");
        let mut writer =
            FragmentWriter::create(dir.path(), &identity, 0, DependencyTable::new(), Arc::clone(&ledger))
                .unwrap();
        writer.write(&message(1, "before crash")).unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);
        assert!(!ledger.is_open(&path));

        let scan = scan_fragment(&path, Arc::new(PacketRegistry::standard())).unwrap();
        assert_eq!(scan.packet_count, 1);
        assert!(scan.trailer.is_none());
        assert!(!scan.ends_session());
    }

    #[test]
    fn torn_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FragmentLedger::new());
        let identity = SessionIdentity::new("Acme", "Billing", "1.0");
        let mut writer =
            FragmentWriter::create(dir.path(), &identity, 0, DependencyTable::new(), ledger).unwrap();
        writer.write(&message(1, "kept")).unwrap();
        writer.write(&message(2, "torn")).unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 4).unwrap();

        let scan = scan_fragment(&path, Arc::new(PacketRegistry::standard())).unwrap();
        assert!(scan.torn);
        assert_eq!(scan.packet_count, 1);
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bsf");
        fs::write(&path, b"not a fragment at all").unwrap();
        assert!(matches!(
            scan_fragment(&path, Arc::new(PacketRegistry::standard())),
            Err(RepositoryError::InvalidFragment { .. })
        ));
    }
}
