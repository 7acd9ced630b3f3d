//! Packet record streams
//!
//! ```text
//! record := varint(tag) [definition] varint(body_len) body
//! tag    := index << 1 | new_definition
//! body   := sequence timestamp id fields...
//! ```
//!
//! A definition header is written once per `(type_name, version)` per stream
//! and referenced by index afterwards. Required packets (a sample's metric
//! definition, a message's thread) are written ahead of the first packet that
//! needs them, so every stream can be read on its own.

use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use contracts::{FieldDefinition, FieldType, Packet, PacketDefinition, PacketPayload};
use tracing::trace;
use uuid::Uuid;

use crate::error::{CodecError, Result};
use crate::field::{FieldReader, FieldWriter};
use crate::packets::{DependencyTable, PacketKind, ReadContext};
use crate::registry::PacketRegistry;
use crate::varint::read_uvarint;

/// Largest definition or body accepted by a reader
pub const MAX_RECORD_LEN: u64 = 64 * 1024 * 1024;

/// Serializes packets into a byte stream
pub struct PacketWriter<W: Write> {
    inner: W,
    definitions: Vec<Arc<PacketDefinition>>,
    definition_index: HashMap<(String, u32), u64>,
    written: HashSet<Uuid>,
    known: DependencyTable,
    packets_written: u64,
    bytes_written: u64,
    last_sequence: u64,
}

impl<W: Write> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_known(inner, DependencyTable::new())
    }

    /// Writer seeded with dependency targets seen on earlier streams
    ///
    /// When a packet requires one of these by id, the seeded copy (which
    /// carries its published sequence) is written instead.
    pub fn with_known(inner: W, known: DependencyTable) -> Self {
        Self {
            inner,
            definitions: Vec::new(),
            definition_index: HashMap::new(),
            written: HashSet::new(),
            known,
            packets_written: 0,
            bytes_written: 0,
            last_sequence: 0,
        }
    }

    /// Write `packet`, preceded by any required packet not yet in this stream
    ///
    /// Returns the number of bytes appended. A packet whose id is already in
    /// the stream is skipped.
    pub fn write(&mut self, packet: &Arc<Packet>) -> Result<u64> {
        if self.written.contains(&packet.id) {
            return Ok(0);
        }
        let mut total = 0;
        for required in packet.required_packets() {
            if self.written.contains(&required.id) {
                continue;
            }
            let required = self
                .known
                .get(&required.id)
                .cloned()
                .unwrap_or(required);
            total += self.write(&required)?;
        }
        total += self.write_record(packet)?;
        if packet.is_dependency_target() {
            self.known.insert(packet.id, Arc::clone(packet));
        }
        Ok(total)
    }

    fn write_record(&mut self, packet: &Packet) -> Result<u64> {
        let mut record = FieldWriter::with_capacity(128);
        let (key, new_definition) = self.definition_for(&packet.payload)?;
        match new_definition {
            None => {
                let index = self.definition_index[&key];
                record.write_u64(index << 1);
            }
            Some(ref definition) => {
                let index = self.definitions.len() as u64;
                record.write_u64((index << 1) | 1);
                record.write_bytes(encode_definition(definition).as_slice());
            }
        }

        let mut body = FieldWriter::with_capacity(96);
        body.write_u64(packet.sequence);
        body.write_timestamp(&packet.timestamp);
        body.write_uuid(&packet.id);
        PacketKind::write_fields(&packet.payload, &mut body);
        record.write_bytes(body.as_slice());

        self.inner.write_all(record.as_slice())?;

        if let Some(definition) = new_definition {
            self.definition_index.insert(key, self.definitions.len() as u64);
            self.definitions.push(definition);
        }
        self.written.insert(packet.id);
        self.packets_written += 1;
        self.bytes_written += record.len() as u64;
        self.last_sequence = self.last_sequence.max(packet.sequence);
        trace!(
            type_name = packet.type_name(),
            sequence = packet.sequence,
            bytes = record.len(),
            "Packet written"
        );
        Ok(record.len() as u64)
    }

    /// Definition key and, when not yet in the stream, the header to emit
    fn definition_for(
        &self,
        payload: &PacketPayload,
    ) -> Result<((String, u32), Option<Arc<PacketDefinition>>)> {
        match (PacketKind::of(payload), payload) {
            (Some(kind), _) => {
                let key = (kind.type_name().to_string(), kind.current_version());
                let definition = (!self.definition_index.contains_key(&key))
                    .then(|| Arc::new(kind.definition()));
                Ok((key, definition))
            }
            (None, PacketPayload::Generic(generic)) => {
                let key = (generic.definition.type_name.clone(), generic.definition.version);
                match self.definition_index.get(&key) {
                    None => Ok((key, Some(Arc::clone(&generic.definition)))),
                    Some(&index) if *self.definitions[index as usize] == *generic.definition => {
                        Ok((key, None))
                    }
                    Some(_) => Err(CodecError::invalid(format!(
                        "conflicting definitions for '{}' v{}",
                        key.0, key.1
                    ))),
                }
            }
            (None, _) => Err(CodecError::invalid("payload has no packet kind")),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Highest sequence written so far
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Dependency targets seen so far, leaving the table empty
    pub fn take_known(&mut self) -> DependencyTable {
        std::mem::take(&mut self.known)
    }

    /// Underlying writer and the dependency targets seen so far
    pub fn into_parts(self) -> (W, DependencyTable) {
        (self.inner, self.known)
    }
}

/// Deserializes packets from a byte stream
///
/// Iterating yields one item per record. Per-packet failures
/// ([`CodecError::is_fatal`] is false) are yielded and reading continues;
/// a fatal error is yielded once and ends the iteration.
pub struct PacketReader<R: Read> {
    inner: R,
    registry: Arc<PacketRegistry>,
    definitions: Vec<Arc<PacketDefinition>>,
    dependencies: DependencyTable,
    packets_read: u64,
    finished: bool,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R, registry: Arc<PacketRegistry>) -> Self {
        Self {
            inner,
            registry,
            definitions: Vec::new(),
            dependencies: DependencyTable::new(),
            packets_read: 0,
            finished: false,
        }
    }

    /// Read the next record; `Ok(None)` at a clean end of stream
    pub fn read_packet(&mut self) -> Result<Option<Packet>> {
        let Some(tag) = read_uvarint(&mut self.inner)? else {
            return Ok(None);
        };
        let index = tag >> 1;
        if tag & 1 == 1 {
            if index != self.definitions.len() as u64 {
                return Err(CodecError::invalid(format!(
                    "definition #{index} declared out of order (expected #{})",
                    self.definitions.len()
                )));
            }
            let blob = self.read_block()?;
            let definition = decode_definition(&blob)?;
            trace!(
                index,
                type_name = %definition.type_name,
                version = definition.version,
                "Definition read"
            );
            self.definitions.push(Arc::new(definition));
        }
        let definition = usize::try_from(index)
            .ok()
            .and_then(|i| self.definitions.get(i))
            .cloned()
            .ok_or(CodecError::UnknownDefinition(index))?;
        let body = self.read_block()?;
        self.decode_body(&definition, &body).map(Some)
    }

    fn read_block(&mut self) -> Result<Vec<u8>> {
        let len = read_uvarint(&mut self.inner)?.ok_or(CodecError::Truncated {
            needed: 1,
            remaining: 0,
        })?;
        if len > MAX_RECORD_LEN {
            return Err(CodecError::invalid(format!(
                "record of {len} bytes exceeds limit"
            )));
        }
        let mut block = vec![0u8; len as usize];
        self.inner.read_exact(&mut block).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                CodecError::Truncated {
                    needed: len as usize,
                    remaining: 0,
                }
            } else {
                e.into()
            }
        })?;
        Ok(block)
    }

    fn decode_body(&mut self, definition: &Arc<PacketDefinition>, body: &[u8]) -> Result<Packet> {
        let type_name = definition.type_name.as_str();
        let mut reader = FieldReader::new(body);
        let sequence = reader.read_u64().map_err(|e| e.in_packet(type_name))?;
        let timestamp = reader.read_timestamp().map_err(|e| e.in_packet(type_name))?;
        let id = reader.read_uuid().map_err(|e| e.in_packet(type_name))?;

        let ctx = ReadContext {
            dependencies: &self.dependencies,
            packet_id: id,
            type_name,
        };
        let payload = self
            .registry
            .read_payload(definition, &mut reader, &ctx)
            .map_err(|e| e.in_packet(type_name))?;
        if reader.remaining() != 0 {
            return Err(CodecError::invalid(format!(
                "{} unread bytes after fields",
                reader.remaining()
            ))
            .in_packet(type_name));
        }

        let packet = Packet {
            sequence,
            timestamp,
            id,
            payload,
        };
        if packet.is_dependency_target() {
            self.dependencies.insert(id, Arc::new(packet.clone()));
        }
        self.packets_read += 1;
        Ok(packet)
    }

    /// Definitions seen so far, in stream order
    pub fn definitions(&self) -> &[Arc<PacketDefinition>] {
        &self.definitions
    }

    pub fn packets_read(&self) -> u64 {
        self.packets_read
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Iterator for PacketReader<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_packet() {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                if e.is_fatal() {
                    self.finished = true;
                }
                Some(Err(e))
            }
        }
    }
}

fn encode_definition(definition: &PacketDefinition) -> FieldWriter {
    let mut w = FieldWriter::new();
    w.write_str(&definition.type_name);
    w.write_u32(definition.version);
    w.write_u64(definition.fields.len() as u64);
    for field in &definition.fields {
        w.write_str(&field.name);
        w.write_u8(field.field_type.code());
    }
    w
}

fn decode_definition(blob: &[u8]) -> Result<PacketDefinition> {
    let mut r = FieldReader::new(blob);
    let type_name = r.read_required_string("type_name")?;
    let version = r.read_u32()?;
    let count = r.read_u64()?;
    if count > blob.len() as u64 {
        return Err(CodecError::invalid(format!("definition claims {count} fields")));
    }
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = r.read_required_string("field name")?;
        let code = r.read_u8()?;
        let field_type = FieldType::from_code(code).ok_or(CodecError::UnknownFieldType(code))?;
        fields.push(FieldDefinition::new(name, field_type));
    }
    if r.remaining() != 0 {
        return Err(CodecError::invalid("trailing bytes in definition header"));
    }
    Ok(PacketDefinition::new(type_name, version, fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::{inspect, DynamicValue};
    use contracts::{
        now, FragmentTrailer, GenericPacket, LogMessage, MetricDefinition, MetricKind,
        MetricSample, SessionClose, SessionHeader, SessionIdentity, Severity, ThreadInfo,
        LOG_MESSAGE,
    };

    fn sequenced(mut packet: Packet, sequence: u64) -> Arc<Packet> {
        packet.sequence = sequence;
        Arc::new(packet)
    }

    fn read_all(bytes: &[u8], registry: PacketRegistry) -> Vec<Result<Packet>> {
        PacketReader::new(bytes, Arc::new(registry)).collect()
    }

    fn thread() -> Arc<Packet> {
        sequenced(
            Packet::new(ThreadInfo {
                thread_index: 7,
                thread_name: Some("worker".into()),
                is_background: true,
            }),
            1,
        )
    }

    #[test]
    fn every_builtin_packet_round_trips() {
        let thread = thread();
        let metric = sequenced(
            Packet::new(
                MetricDefinition::new("Http", "latency", MetricKind::Histogram)
                    .with_unit("ms")
                    .with_buckets(vec![1.0, 10.0, 100.0]),
            ),
            2,
        );
        let packets = vec![
            sequenced(
                Packet::new(SessionHeader {
                    identity: SessionIdentity::new("Acme", "Billing", "1.2.3"),
                    fragment_index: 0,
                    fragment_start: now(),
                }),
                0,
            ),
            Arc::clone(&thread),
            Arc::clone(&metric),
            sequenced(
                Packet::new(
                    LogMessage::new(Severity::Error, "Db", "connection lost")
                        .with_thread(&thread)
                        .unwrap()
                        .with_description("timeout after 30s")
                        .with_details("<retry count=\"3\"/>")
                        .with_tags(["db", "db", "net"]),
                ),
                3,
            ),
            sequenced(
                Packet::new(
                    MetricSample::new(&metric, 42.5)
                        .unwrap()
                        .with_bucket_counts(vec![0, 0, 3, 3, 3]),
                ),
                4,
            ),
            sequenced(Packet::new(SessionClose::normal()), 5),
            sequenced(
                Packet::new(FragmentTrailer {
                    fragment_index: 0,
                    packet_count: 6,
                    last_sequence: 5,
                    end_time: now(),
                    session_ended: true,
                }),
                6,
            ),
        ];

        let mut writer = PacketWriter::new(Vec::new());
        for packet in &packets {
            writer.write(packet).unwrap();
        }
        assert_eq!(writer.packets_written(), 7);
        assert_eq!(writer.last_sequence(), 6);
        let (bytes, _) = writer.into_parts();

        let back: Vec<Packet> = read_all(&bytes, PacketRegistry::standard())
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(back.len(), packets.len());
        for (read, written) in back.iter().zip(&packets) {
            assert_eq!(read, written.as_ref());
        }
    }

    #[test]
    fn dependencies_are_written_first_and_once() {
        let metric = Packet::new(MetricDefinition::new("Cpu", "usage", MetricKind::Gauge)).shared();
        let mut writer = PacketWriter::new(Vec::new());
        for (i, value) in [0.1, 0.2, 0.3].into_iter().enumerate() {
            let sample = Packet::new(MetricSample::new(&metric, value).unwrap());
            writer.write(&sequenced(sample, i as u64 + 10)).unwrap();
        }
        assert_eq!(writer.packets_written(), 4);
        let (bytes, known) = writer.into_parts();
        assert!(known.contains_key(&metric.id));

        let back: Vec<Packet> = read_all(&bytes, PacketRegistry::standard())
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(back[0].id, metric.id);
        for sample in &back[1..] {
            match &sample.payload {
                PacketPayload::MetricSample(s) => assert_eq!(s.metric.id, metric.id),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn seeded_writer_substitutes_published_dependency() {
        let producer_copy = thread();
        let mut published = (*producer_copy).clone();
        published.sequence = 99;
        let mut known = DependencyTable::new();
        known.insert(published.id, Arc::new(published));

        let message = Packet::new(
            LogMessage::new(Severity::Information, "App", "hi")
                .with_thread(&producer_copy)
                .unwrap(),
        );
        let mut writer = PacketWriter::with_known(Vec::new(), known);
        writer.write(&sequenced(message, 100)).unwrap();
        let (bytes, _) = writer.into_parts();

        let back = read_all(&bytes, PacketRegistry::standard());
        assert_eq!(back[0].as_ref().unwrap().sequence, 99);
    }

    #[test]
    fn definition_header_written_once() {
        let one = |caption: &str| {
            let mut writer = PacketWriter::new(Vec::new());
            writer
                .write(&Packet::new(LogMessage::new(Severity::Verbose, "A", caption)).shared())
                .unwrap()
        };
        let first = one("x");

        let mut writer = PacketWriter::new(Vec::new());
        writer
            .write(&Packet::new(LogMessage::new(Severity::Verbose, "A", "x")).shared())
            .unwrap();
        let second = writer
            .write(&Packet::new(LogMessage::new(Severity::Verbose, "A", "x")).shared())
            .unwrap();
        assert!(second < first / 2, "{second} vs {first}");
    }

    #[test]
    fn missing_dependency_only_fails_that_packet() {
        let thread = thread();
        let message = sequenced(
            Packet::new(
                LogMessage::new(Severity::Warning, "App", "orphan")
                    .with_thread(&thread)
                    .unwrap(),
            ),
            2,
        );
        let mut writer = PacketWriter::new(Vec::new());
        // Pretend the thread is already in the stream so it is not emitted
        writer.written.insert(thread.id);
        writer.write(&message).unwrap();
        writer.write(&sequenced(Packet::new(SessionClose::normal()), 3)).unwrap();
        let (bytes, _) = writer.into_parts();

        let back = read_all(&bytes, PacketRegistry::standard());
        assert_eq!(back.len(), 2);
        assert!(matches!(
            back[0],
            Err(CodecError::MissingDependency { dependency, .. }) if dependency == thread.id
        ));
        assert!(back[1].is_ok());
    }

    #[test]
    fn newer_schema_version_fails_only_that_packet() {
        let mut fields = PacketKind::LogMessage.fields(2).unwrap();
        fields.push(FieldDefinition::new("priority", FieldType::Int32));
        let definition = Arc::new(PacketDefinition::new(LOG_MESSAGE, 3, fields));
        let future = Packet::new(GenericPacket {
            definition,
            raw: bytes::Bytes::from_static(&[0]),
        })
        .shared();

        let mut writer = PacketWriter::new(Vec::new());
        writer.write(&future).unwrap();
        writer.write(&thread()).unwrap();
        let (bytes, _) = writer.into_parts();

        let back = read_all(&bytes, PacketRegistry::standard());
        assert!(matches!(
            back[0],
            Err(CodecError::SchemaVersionUnsupported { version: 3, .. })
        ));
        assert!(matches!(
            back[1].as_ref().unwrap().payload,
            PacketPayload::ThreadInfo(_)
        ));
    }

    #[test]
    fn version_one_log_message_reads_without_details_or_tags() {
        let mut raw = FieldWriter::new();
        raw.write_i32(Severity::Warning.code());
        raw.write_uuid(&Uuid::nil());
        raw.write_str("Legacy");
        raw.write_str("Db");
        raw.write_string(Some("svc"));
        raw.write_str("slow query");
        raw.write_string(None);
        raw.write_string(None);
        raw.write_string(Some("db.rs"));
        raw.write_u32(42);
        let definition = Arc::new(PacketDefinition::new(
            LOG_MESSAGE,
            1,
            PacketKind::LogMessage.fields(1).unwrap(),
        ));
        let legacy = sequenced(
            Packet::new(GenericPacket {
                definition,
                raw: raw.freeze(),
            }),
            4,
        );

        let mut writer = PacketWriter::new(Vec::new());
        writer.write(&legacy).unwrap();
        let (bytes, _) = writer.into_parts();

        let mut reader = PacketReader::new(bytes.as_slice(), Arc::new(PacketRegistry::standard()));
        let packet = reader.next().unwrap().unwrap();
        assert!(reader.next().is_none());
        assert_eq!(reader.definitions()[0].version, 1);
        assert_eq!(packet.sequence, 4);
        let PacketPayload::LogMessage(message) = &packet.payload else {
            panic!("expected log message, got {:?}", packet.payload);
        };
        assert_eq!(message.severity, Severity::Warning);
        assert_eq!(message.caption, "slow query");
        assert_eq!(message.user_name.as_deref(), Some("svc"));
        assert_eq!(message.source_line, 42);
        assert!(message.thread.is_none());
        assert_eq!(message.details, None);
        assert!(message.tags.is_empty());
    }

    #[test]
    fn unknown_types_pass_through_as_generic() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.write(&thread()).unwrap();
        let (bytes, _) = writer.into_parts();

        let generic = read_all(&bytes, PacketRegistry::empty()).remove(0).unwrap();
        let PacketPayload::Generic(raw) = &generic.payload else {
            panic!("expected generic payload");
        };
        let fields = inspect(raw).unwrap();
        assert_eq!(fields[0], ("thread_index".to_string(), DynamicValue::UInt32(7)));

        // Re-emitting the generic packet yields the same bytes
        let mut rewriter = PacketWriter::new(Vec::new());
        rewriter.write(&Arc::new(generic)).unwrap();
        let (rewritten, _) = rewriter.into_parts();
        assert_eq!(rewritten, bytes);
    }

    #[test]
    fn truncated_tail_is_fatal_and_ends_iteration() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.write(&thread()).unwrap();
        writer.write(&sequenced(Packet::new(SessionClose::normal()), 2)).unwrap();
        let (mut bytes, _) = writer.into_parts();
        bytes.truncate(bytes.len() - 3);

        let back = read_all(&bytes, PacketRegistry::standard());
        assert_eq!(back.len(), 2);
        assert!(back[0].is_ok());
        assert!(matches!(back[1], Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn corrupt_body_is_per_packet() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.write(&thread()).unwrap();
        let (mut bytes, _) = writer.into_parts();
        // last byte is the is_background flag
        let last = bytes.len() - 1;
        bytes[last] = 9;

        let back = read_all(&bytes, PacketRegistry::standard());
        assert!(matches!(back[0], Err(CodecError::CorruptPacket { .. })));
    }
}
