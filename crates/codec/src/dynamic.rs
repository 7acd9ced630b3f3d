//! Schema-driven decoding of packets without a typed representation

use std::fmt;

use bytes::Bytes;
use chrono::TimeDelta;
use contracts::{FieldType, GenericPacket, PacketDefinition, Timestamp};
use uuid::Uuid;

use crate::error::{CodecError, Result};
use crate::field::{FieldReader, FieldWriter};

/// One decoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Double(f64),
    Guid(Uuid),
    Timestamp(Timestamp),
    Duration(TimeDelta),
    String(Option<String>),
    Bytes(Bytes),
    BoolArray(Vec<bool>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    UInt64Array(Vec<u64>),
    DoubleArray(Vec<f64>),
    GuidArray(Vec<Uuid>),
    TimestampArray(Vec<Timestamp>),
    StringArray(Vec<Option<String>>),
}

impl DynamicValue {
    pub fn read(field_type: FieldType, reader: &mut FieldReader<'_>) -> Result<Self> {
        Ok(match field_type {
            FieldType::Bool => Self::Bool(reader.read_bool()?),
            FieldType::Int32 => Self::Int32(reader.read_i32()?),
            FieldType::Int64 => Self::Int64(reader.read_i64()?),
            FieldType::UInt32 => Self::UInt32(reader.read_u32()?),
            FieldType::UInt64 => Self::UInt64(reader.read_u64()?),
            FieldType::Double => Self::Double(reader.read_f64()?),
            FieldType::Guid => Self::Guid(reader.read_uuid()?),
            FieldType::Timestamp => Self::Timestamp(reader.read_timestamp()?),
            FieldType::Duration => Self::Duration(reader.read_duration()?),
            FieldType::String => Self::String(reader.read_string()?),
            FieldType::Bytes => Self::Bytes(reader.read_bytes()?),
            FieldType::BoolArray => Self::BoolArray(reader.read_array()?),
            FieldType::Int32Array => Self::Int32Array(reader.read_array()?),
            FieldType::Int64Array => Self::Int64Array(reader.read_array()?),
            FieldType::UInt64Array => Self::UInt64Array(reader.read_array()?),
            FieldType::DoubleArray => Self::DoubleArray(reader.read_array()?),
            FieldType::GuidArray => Self::GuidArray(reader.read_array()?),
            FieldType::TimestampArray => Self::TimestampArray(reader.read_array()?),
            FieldType::StringArray => Self::StringArray(reader.read_array()?),
        })
    }

    pub fn write(&self, writer: &mut FieldWriter) {
        match self {
            Self::Bool(v) => writer.write_bool(*v),
            Self::Int32(v) => writer.write_i32(*v),
            Self::Int64(v) => writer.write_i64(*v),
            Self::UInt32(v) => writer.write_u32(*v),
            Self::UInt64(v) => writer.write_u64(*v),
            Self::Double(v) => writer.write_f64(*v),
            Self::Guid(v) => writer.write_uuid(v),
            Self::Timestamp(v) => writer.write_timestamp(v),
            Self::Duration(v) => writer.write_duration(*v),
            Self::String(v) => writer.write_string(v.as_deref()),
            Self::Bytes(v) => writer.write_bytes(v),
            Self::BoolArray(v) => writer.write_array(v),
            Self::Int32Array(v) => writer.write_array(v),
            Self::Int64Array(v) => writer.write_array(v),
            Self::UInt64Array(v) => writer.write_array(v),
            Self::DoubleArray(v) => writer.write_array(v),
            Self::GuidArray(v) => writer.write_array(v),
            Self::TimestampArray(v) => writer.write_array(v),
            Self::StringArray(v) => writer.write_array(v),
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Bool(_) => FieldType::Bool,
            Self::Int32(_) => FieldType::Int32,
            Self::Int64(_) => FieldType::Int64,
            Self::UInt32(_) => FieldType::UInt32,
            Self::UInt64(_) => FieldType::UInt64,
            Self::Double(_) => FieldType::Double,
            Self::Guid(_) => FieldType::Guid,
            Self::Timestamp(_) => FieldType::Timestamp,
            Self::Duration(_) => FieldType::Duration,
            Self::String(_) => FieldType::String,
            Self::Bytes(_) => FieldType::Bytes,
            Self::BoolArray(_) => FieldType::BoolArray,
            Self::Int32Array(_) => FieldType::Int32Array,
            Self::Int64Array(_) => FieldType::Int64Array,
            Self::UInt64Array(_) => FieldType::UInt64Array,
            Self::DoubleArray(_) => FieldType::DoubleArray,
            Self::GuidArray(_) => FieldType::GuidArray,
            Self::TimestampArray(_) => FieldType::TimestampArray,
            Self::StringArray(_) => FieldType::StringArray,
        }
    }
}

impl fmt::Display for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Guid(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Duration(v) => write!(f, "{v}"),
            Self::String(Some(v)) => write!(f, "{v:?}"),
            Self::String(None) => f.write_str("null"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Decode field data against its definition
pub fn decode_fields(definition: &PacketDefinition, raw: &[u8]) -> Result<Vec<(String, DynamicValue)>> {
    let mut reader = FieldReader::new(raw);
    let mut fields = Vec::with_capacity(definition.fields.len());
    for field in &definition.fields {
        let value = DynamicValue::read(field.field_type, &mut reader)?;
        fields.push((field.name.clone(), value));
    }
    if reader.remaining() != 0 {
        return Err(CodecError::invalid(format!(
            "{} trailing bytes after '{}' fields",
            reader.remaining(),
            definition.type_name
        )));
    }
    Ok(fields)
}

/// Decode a generic packet's raw fields for inspection
pub fn inspect(packet: &GenericPacket) -> Result<Vec<(String, DynamicValue)>> {
    decode_fields(&packet.definition, &packet.raw)
}
