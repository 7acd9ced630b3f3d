//! Codec - Beacon's binary packet serialization
//!
//! # Module structure
//!
//! - `varint`: LEB128 / zigzag integer primitives
//! - `field`: [`FieldWriter`] / [`FieldReader`] and run-length encoded arrays
//! - `packets`: built-in [`PacketKind`]s and their versioned field lists
//! - `registry`: [`PacketRegistry`], type name → kind lookup
//! - `stream`: [`PacketWriter`] / [`PacketReader`] record streams
//! - `dynamic`: schema-driven inspection of generic packets

pub mod dynamic;
pub mod error;
pub mod field;
pub mod packets;
pub mod registry;
pub mod stream;
pub mod varint;

pub use dynamic::{decode_fields, inspect, DynamicValue};
pub use error::{CodecError, Result};
pub use field::{FieldReader, FieldValue, FieldWriter};
pub use packets::{DependencyTable, PacketKind};
pub use registry::PacketRegistry;
pub use stream::{PacketReader, PacketWriter};
