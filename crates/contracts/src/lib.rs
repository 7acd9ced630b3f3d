//! # Contracts
//!
//! Frozen interface contracts (ICD), defining inter-module data structures and traits.
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Ordering Model
//! - `Packet::sequence` is assigned by the messenger at publish time and is the
//!   canonical total order within a session
//! - `timestamp` and `id` only break ties when reading back

mod config;
mod criteria;
mod error;
mod packet;
mod schema;
mod session;
mod sink;

pub use config::*;
pub use criteria::{Criteria, PublishMode};
pub use error::*;
pub use packet::*;
pub use schema::{FieldDefinition, FieldType, PacketDefinition};
pub use session::*;
pub use sink::PacketSink;
