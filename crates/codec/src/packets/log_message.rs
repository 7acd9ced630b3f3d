//! `LogMessage` schema
//!
//! v1: the original message fields. v2 appends `details` and `tags`; v1
//! records read back with no details and no tags.

use contracts::{FieldDefinition, FieldType, LogMessage, PacketPayload, Severity};
use uuid::Uuid;

use super::{field, ReadContext};
use crate::error::{CodecError, Result};
use crate::field::{FieldReader, FieldWriter};

pub(super) const CURRENT_VERSION: u32 = 2;

pub(super) fn fields(version: u32) -> Option<Vec<FieldDefinition>> {
    let mut fields = vec![
        field("severity", FieldType::Int32),
        field("thread_id", FieldType::Guid),
        field("log_system", FieldType::String),
        field("category", FieldType::String),
        field("user_name", FieldType::String),
        field("caption", FieldType::String),
        field("description", FieldType::String),
        field("exception", FieldType::String),
        field("source_file", FieldType::String),
        field("source_line", FieldType::UInt32),
    ];
    match version {
        1 => {}
        2 => {
            fields.push(field("details", FieldType::String));
            fields.push(field("tags", FieldType::StringArray));
        }
        _ => return None,
    }
    Some(fields)
}

pub(super) fn write(message: &LogMessage, w: &mut FieldWriter) {
    w.write_i32(message.severity.code());
    w.write_uuid(&message.thread.as_ref().map_or(Uuid::nil(), |t| t.id));
    w.write_str(&message.log_system);
    w.write_str(&message.category);
    w.write_string(message.user_name.as_deref());
    w.write_str(&message.caption);
    w.write_string(message.description.as_deref());
    w.write_string(message.exception.as_deref());
    w.write_string(message.source_file.as_deref());
    w.write_u32(message.source_line);
    w.write_string(message.details.as_deref());
    w.write_array(&message.tags);
}

pub(super) fn read(
    version: u32,
    r: &mut FieldReader<'_>,
    ctx: &ReadContext<'_>,
) -> Result<LogMessage> {
    let code = r.read_i32()?;
    let severity = Severity::from_code(code)
        .ok_or_else(|| CodecError::invalid(format!("unknown severity {code}")))?;
    let thread_id = r.read_uuid()?;
    let thread = if thread_id.is_nil() {
        None
    } else {
        let thread = ctx.resolve(thread_id)?;
        if !matches!(thread.payload, PacketPayload::ThreadInfo(_)) {
            return Err(CodecError::invalid(format!(
                "thread reference {thread_id} is a '{}' packet",
                thread.type_name()
            )));
        }
        Some(thread)
    };

    let mut message = LogMessage {
        severity,
        thread,
        log_system: r.read_required_string("log_system")?,
        category: r.read_required_string("category")?,
        user_name: r.read_string()?,
        caption: r.read_required_string("caption")?,
        description: r.read_string()?,
        exception: r.read_string()?,
        source_file: r.read_string()?,
        source_line: r.read_u32()?,
        details: None,
        tags: Vec::new(),
    };
    if version >= 2 {
        message.details = r.read_string()?;
        message.tags = r.read_array()?;
    }
    Ok(message)
}
