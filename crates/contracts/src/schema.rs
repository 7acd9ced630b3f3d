//! Packet schema descriptions
//!
//! A `(type_name, version)` pair names exactly one ordered field list. Once a
//! pair has been published its field list never changes; new behavior gets a
//! new version number.

use std::fmt;

/// Wire type of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Double,
    Guid,
    Timestamp,
    Duration,
    String,
    Bytes,
    BoolArray,
    Int32Array,
    Int64Array,
    UInt64Array,
    DoubleArray,
    GuidArray,
    TimestampArray,
    StringArray,
}

impl FieldType {
    const ARRAY_FLAG: u8 = 0x80;

    /// Wire code used in definition headers
    pub fn code(self) -> u8 {
        match self {
            Self::Bool => 1,
            Self::Int32 => 2,
            Self::Int64 => 3,
            Self::UInt32 => 4,
            Self::UInt64 => 5,
            Self::Double => 6,
            Self::Guid => 7,
            Self::Timestamp => 8,
            Self::Duration => 9,
            Self::String => 10,
            Self::Bytes => 11,
            Self::BoolArray => Self::ARRAY_FLAG | 1,
            Self::Int32Array => Self::ARRAY_FLAG | 2,
            Self::Int64Array => Self::ARRAY_FLAG | 3,
            Self::UInt64Array => Self::ARRAY_FLAG | 5,
            Self::DoubleArray => Self::ARRAY_FLAG | 6,
            Self::GuidArray => Self::ARRAY_FLAG | 7,
            Self::TimestampArray => Self::ARRAY_FLAG | 8,
            Self::StringArray => Self::ARRAY_FLAG | 10,
        }
    }

    /// Inverse of [`FieldType::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        let field_type = match code {
            1 => Self::Bool,
            2 => Self::Int32,
            3 => Self::Int64,
            4 => Self::UInt32,
            5 => Self::UInt64,
            6 => Self::Double,
            7 => Self::Guid,
            8 => Self::Timestamp,
            9 => Self::Duration,
            10 => Self::String,
            11 => Self::Bytes,
            0x81 => Self::BoolArray,
            0x82 => Self::Int32Array,
            0x83 => Self::Int64Array,
            0x85 => Self::UInt64Array,
            0x86 => Self::DoubleArray,
            0x87 => Self::GuidArray,
            0x88 => Self::TimestampArray,
            0x8A => Self::StringArray,
            _ => return None,
        };
        Some(field_type)
    }

    pub fn is_array(self) -> bool {
        self.code() & Self::ARRAY_FLAG != 0
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One named, typed field of a packet schema
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Definition header preceding the field data of a packet kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketDefinition {
    pub type_name: String,
    pub version: u32,
    pub fields: Vec<FieldDefinition>,
}

impl PacketDefinition {
    pub fn new(type_name: impl Into<String>, version: u32, fields: Vec<FieldDefinition>) -> Self {
        Self {
            type_name: type_name.into(),
            version,
            fields,
        }
    }

    /// Key identifying this definition in a stream
    pub fn key(&self) -> (&str, u32) {
        (&self.type_name, self.version)
    }
}
