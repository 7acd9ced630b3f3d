use contracts::{FieldDefinition, FieldType, ThreadInfo};

use super::field;
use crate::error::Result;
use crate::field::{FieldReader, FieldWriter};

pub(super) fn fields(version: u32) -> Option<Vec<FieldDefinition>> {
    (version == 1).then(|| {
        vec![
            field("thread_index", FieldType::UInt32),
            field("thread_name", FieldType::String),
            field("is_background", FieldType::Bool),
        ]
    })
}

pub(super) fn write(info: &ThreadInfo, w: &mut FieldWriter) {
    w.write_u32(info.thread_index);
    w.write_string(info.thread_name.as_deref());
    w.write_bool(info.is_background);
}

pub(super) fn read(_version: u32, r: &mut FieldReader<'_>) -> Result<ThreadInfo> {
    Ok(ThreadInfo {
        thread_index: r.read_u32()?,
        thread_name: r.read_string()?,
        is_background: r.read_bool()?,
    })
}
