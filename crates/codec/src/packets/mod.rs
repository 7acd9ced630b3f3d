//! Built-in packet kinds
//!
//! Each kind owns its field lists per schema version and the routines that
//! write the current version and read any supported one. Dispatch is a plain
//! `match` on [`PacketKind`].

mod log_message;
mod metric;
mod session;
mod thread;

use std::collections::HashMap;
use std::sync::Arc;

use contracts::{
    FieldDefinition, FieldType, Packet, PacketDefinition, PacketPayload, FRAGMENT_TRAILER,
    LOG_MESSAGE, METRIC_DEFINITION, METRIC_SAMPLE, SESSION_CLOSE, SESSION_HEADER, THREAD_INFO,
};
use uuid::Uuid;

use crate::error::{CodecError, Result};
use crate::field::{FieldReader, FieldWriter};

/// Packets already read from the current stream, by id
pub type DependencyTable = HashMap<Uuid, Arc<Packet>>;

/// Typed packet kinds known to this build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    SessionHeader,
    FragmentTrailer,
    SessionClose,
    ThreadInfo,
    LogMessage,
    MetricDefinition,
    MetricSample,
}

impl PacketKind {
    pub const ALL: [PacketKind; 7] = [
        Self::SessionHeader,
        Self::FragmentTrailer,
        Self::SessionClose,
        Self::ThreadInfo,
        Self::LogMessage,
        Self::MetricDefinition,
        Self::MetricSample,
    ];

    pub fn type_name(self) -> &'static str {
        match self {
            Self::SessionHeader => SESSION_HEADER,
            Self::FragmentTrailer => FRAGMENT_TRAILER,
            Self::SessionClose => SESSION_CLOSE,
            Self::ThreadInfo => THREAD_INFO,
            Self::LogMessage => LOG_MESSAGE,
            Self::MetricDefinition => METRIC_DEFINITION,
            Self::MetricSample => METRIC_SAMPLE,
        }
    }

    /// Version written by this build
    pub fn current_version(self) -> u32 {
        match self {
            Self::LogMessage => log_message::CURRENT_VERSION,
            _ => 1,
        }
    }

    /// Field list of a schema version, `None` for versions never published
    pub fn fields(self, version: u32) -> Option<Vec<FieldDefinition>> {
        match self {
            Self::SessionHeader => session::header_fields(version),
            Self::FragmentTrailer => session::trailer_fields(version),
            Self::SessionClose => session::close_fields(version),
            Self::ThreadInfo => thread::fields(version),
            Self::LogMessage => log_message::fields(version),
            Self::MetricDefinition => metric::definition_fields(version),
            Self::MetricSample => metric::sample_fields(version),
        }
    }

    /// Definition header for the current version
    pub fn definition(self) -> PacketDefinition {
        let version = self.current_version();
        PacketDefinition::new(
            self.type_name(),
            version,
            self.fields(version).unwrap_or_default(),
        )
    }

    /// Kind of a typed payload; `None` for generic packets
    pub fn of(payload: &PacketPayload) -> Option<Self> {
        Some(match payload {
            PacketPayload::SessionHeader(_) => Self::SessionHeader,
            PacketPayload::FragmentTrailer(_) => Self::FragmentTrailer,
            PacketPayload::SessionClose(_) => Self::SessionClose,
            PacketPayload::ThreadInfo(_) => Self::ThreadInfo,
            PacketPayload::LogMessage(_) => Self::LogMessage,
            PacketPayload::MetricDefinition(_) => Self::MetricDefinition,
            PacketPayload::MetricSample(_) => Self::MetricSample,
            PacketPayload::Generic(_) => return None,
        })
    }

    /// Check a definition read from a stream against the published schema
    pub fn check_definition(self, definition: &PacketDefinition) -> Result<()> {
        let current = self.current_version();
        if definition.version > current {
            return Err(CodecError::SchemaVersionUnsupported {
                type_name: definition.type_name.clone(),
                version: definition.version,
                max_supported: current,
            });
        }
        let expected = self.fields(definition.version).ok_or_else(|| CodecError::SchemaMismatch {
            type_name: definition.type_name.clone(),
            version: definition.version,
            message: "version was never published".to_string(),
        })?;
        if expected != definition.fields {
            return Err(CodecError::SchemaMismatch {
                type_name: definition.type_name.clone(),
                version: definition.version,
                message: format!(
                    "expected fields [{}], found [{}]",
                    describe(&expected),
                    describe(&definition.fields)
                ),
            });
        }
        Ok(())
    }

    /// Write the current-version fields of `payload`
    pub(crate) fn write_fields(payload: &PacketPayload, writer: &mut FieldWriter) {
        match payload {
            PacketPayload::SessionHeader(p) => session::write_header(p, writer),
            PacketPayload::FragmentTrailer(p) => session::write_trailer(p, writer),
            PacketPayload::SessionClose(p) => session::write_close(p, writer),
            PacketPayload::ThreadInfo(p) => thread::write(p, writer),
            PacketPayload::LogMessage(p) => log_message::write(p, writer),
            PacketPayload::MetricDefinition(p) => metric::write_definition(p, writer),
            PacketPayload::MetricSample(p) => metric::write_sample(p, writer),
            PacketPayload::Generic(p) => writer.write_raw(&p.raw),
        }
    }

    /// Read fields written under `version` (already checked)
    pub(crate) fn read_payload(
        self,
        version: u32,
        reader: &mut FieldReader<'_>,
        ctx: &ReadContext<'_>,
    ) -> Result<PacketPayload> {
        Ok(match self {
            Self::SessionHeader => session::read_header(version, reader)?.into(),
            Self::FragmentTrailer => session::read_trailer(version, reader)?.into(),
            Self::SessionClose => session::read_close(version, reader)?.into(),
            Self::ThreadInfo => thread::read(version, reader)?.into(),
            Self::LogMessage => log_message::read(version, reader, ctx)?.into(),
            Self::MetricDefinition => metric::read_definition(version, reader)?.into(),
            Self::MetricSample => metric::read_sample(version, reader, ctx)?.into(),
        })
    }
}

/// Dependency lookup for the packet being read
pub(crate) struct ReadContext<'a> {
    pub dependencies: &'a DependencyTable,
    pub packet_id: Uuid,
    pub type_name: &'a str,
}

impl ReadContext<'_> {
    pub fn resolve(&self, dependency: Uuid) -> Result<Arc<Packet>> {
        self.dependencies
            .get(&dependency)
            .cloned()
            .ok_or_else(|| CodecError::MissingDependency {
                type_name: self.type_name.to_string(),
                packet_id: self.packet_id,
                dependency,
            })
    }
}

fn field(name: &str, field_type: FieldType) -> FieldDefinition {
    FieldDefinition::new(name, field_type)
}

fn describe(fields: &[FieldDefinition]) -> String {
    fields
        .iter()
        .map(|f| format!("{}:{}", f.name, f.field_type))
        .collect::<Vec<_>>()
        .join(", ")
}
