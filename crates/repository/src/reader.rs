//! Session read-back
//!
//! Merges the closed fragments of a session into one ordered packet list.
//! Dependency packets repeated at the head of each fragment collapse to a
//! single copy.

use std::collections::HashMap;
use std::sync::Arc;

use codec::CodecError;
use contracts::{Packet, PacketPayload, SessionIdentity};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::fragment::open_fragment;
use crate::index::Repository;

/// Packets of one session in publish order
#[derive(Debug, Clone)]
pub struct SessionPackets {
    pub identity: SessionIdentity,
    pub packets: Vec<Packet>,
    /// Records that could not be decoded
    pub bad_packets: u64,
    /// Fragments still open for writing, or unreadable
    pub skipped_fragments: usize,
}

impl Repository {
    /// Read every closed fragment of a session
    #[instrument(name = "repository_read_session", skip(self))]
    pub fn read_session(&self, session_id: Uuid) -> Result<SessionPackets> {
        let summary = self.get(session_id)?;
        let mut by_id: HashMap<Uuid, Packet> = HashMap::new();
        let mut bad_packets = 0;
        let mut skipped_fragments = 0;

        for fragment in &summary.fragments {
            if !fragment.closed || self.ledger().is_open(&fragment.path) {
                skipped_fragments += 1;
                continue;
            }
            let packets = match open_fragment(&fragment.path, Arc::clone(self.registry())) {
                Ok(packets) => packets,
                Err(RepositoryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    skipped_fragments += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %fragment.path.display(), error = %e, "Skipping unreadable fragment");
                    skipped_fragments += 1;
                    continue;
                }
            };
            for item in packets {
                match item {
                    Ok(packet) => {
                        if matches!(
                            packet.payload,
                            PacketPayload::SessionHeader(_) | PacketPayload::FragmentTrailer(_)
                        ) {
                            continue;
                        }
                        match by_id.get(&packet.id) {
                            Some(existing) if existing.sequence >= packet.sequence => {}
                            _ => {
                                by_id.insert(packet.id, packet);
                            }
                        }
                    }
                    Err(CodecError::Truncated { .. }) => {
                        debug!(path = %fragment.path.display(), "Stopping at torn tail");
                    }
                    Err(e) if !e.is_fatal() => bad_packets += 1,
                    Err(e) => {
                        warn!(path = %fragment.path.display(), error = %e, "Fragment unreadable past this point");
                        bad_packets += 1;
                    }
                }
            }
        }

        let mut packets: Vec<Packet> = by_id.into_values().collect();
        packets.sort_by_key(Packet::order_key);
        debug!(
            %session_id,
            packets = packets.len(),
            bad_packets,
            skipped_fragments,
            "Session read"
        );
        Ok(SessionPackets {
            identity: summary.identity,
            packets,
            bad_packets,
            skipped_fragments,
        })
    }
}
