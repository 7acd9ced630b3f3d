//! Session boundary packets: header, fragment trailer, close

use contracts::{
    FieldDefinition, FieldType, FragmentTrailer, SessionClose, SessionEndStatus, SessionHeader,
    SessionIdentity,
};

use super::field;
use crate::error::{CodecError, Result};
use crate::field::{FieldReader, FieldWriter};

pub(super) fn header_fields(version: u32) -> Option<Vec<FieldDefinition>> {
    (version == 1).then(|| {
        vec![
            field("session_id", FieldType::Guid),
            field("product", FieldType::String),
            field("application", FieldType::String),
            field("application_version", FieldType::String),
            field("environment", FieldType::String),
            field("host_name", FieldType::String),
            field("user_name", FieldType::String),
            field("os_description", FieldType::String),
            field("process_id", FieldType::UInt32),
            field("started_at", FieldType::Timestamp),
            field("fragment_index", FieldType::UInt32),
            field("fragment_start", FieldType::Timestamp),
        ]
    })
}

pub(super) fn write_header(header: &SessionHeader, w: &mut FieldWriter) {
    let identity = &header.identity;
    w.write_uuid(&identity.session_id);
    w.write_str(&identity.product);
    w.write_str(&identity.application);
    w.write_str(&identity.application_version);
    w.write_string(identity.environment.as_deref());
    w.write_str(&identity.host_name);
    w.write_string(identity.user_name.as_deref());
    w.write_str(&identity.os_description);
    w.write_u32(identity.process_id);
    w.write_timestamp(&identity.started_at);
    w.write_u32(header.fragment_index);
    w.write_timestamp(&header.fragment_start);
}

pub(super) fn read_header(_version: u32, r: &mut FieldReader<'_>) -> Result<SessionHeader> {
    let identity = SessionIdentity {
        session_id: r.read_uuid()?,
        product: r.read_required_string("product")?,
        application: r.read_required_string("application")?,
        application_version: r.read_required_string("application_version")?,
        environment: r.read_string()?,
        host_name: r.read_required_string("host_name")?,
        user_name: r.read_string()?,
        os_description: r.read_required_string("os_description")?,
        process_id: r.read_u32()?,
        started_at: r.read_timestamp()?,
    };
    Ok(SessionHeader {
        identity,
        fragment_index: r.read_u32()?,
        fragment_start: r.read_timestamp()?,
    })
}

pub(super) fn trailer_fields(version: u32) -> Option<Vec<FieldDefinition>> {
    (version == 1).then(|| {
        vec![
            field("fragment_index", FieldType::UInt32),
            field("packet_count", FieldType::UInt64),
            field("last_sequence", FieldType::UInt64),
            field("end_time", FieldType::Timestamp),
            field("session_ended", FieldType::Bool),
        ]
    })
}

pub(super) fn write_trailer(trailer: &FragmentTrailer, w: &mut FieldWriter) {
    w.write_u32(trailer.fragment_index);
    w.write_u64(trailer.packet_count);
    w.write_u64(trailer.last_sequence);
    w.write_timestamp(&trailer.end_time);
    w.write_bool(trailer.session_ended);
}

pub(super) fn read_trailer(_version: u32, r: &mut FieldReader<'_>) -> Result<FragmentTrailer> {
    Ok(FragmentTrailer {
        fragment_index: r.read_u32()?,
        packet_count: r.read_u64()?,
        last_sequence: r.read_u64()?,
        end_time: r.read_timestamp()?,
        session_ended: r.read_bool()?,
    })
}

pub(super) fn close_fields(version: u32) -> Option<Vec<FieldDefinition>> {
    (version == 1).then(|| {
        vec![
            field("end_time", FieldType::Timestamp),
            field("status", FieldType::Int32),
            field("reason", FieldType::String),
        ]
    })
}

pub(super) fn write_close(close: &SessionClose, w: &mut FieldWriter) {
    w.write_timestamp(&close.end_time);
    w.write_i32(close.status.code());
    w.write_string(close.reason.as_deref());
}

pub(super) fn read_close(_version: u32, r: &mut FieldReader<'_>) -> Result<SessionClose> {
    let end_time = r.read_timestamp()?;
    let code = r.read_i32()?;
    let status = SessionEndStatus::from_code(code)
        .ok_or_else(|| CodecError::invalid(format!("unknown session end status {code}")))?;
    Ok(SessionClose {
        end_time,
        status,
        reason: r.read_string()?,
    })
}
