//! Packet Registry
//!
//! Maps type names found in definition headers to the typed packet kind that
//! reads them. Built once at startup and handed to every reader; type names
//! it does not know decode as generic packets.

use std::collections::HashMap;
use std::sync::Arc;

use contracts::{GenericPacket, PacketDefinition, PacketPayload};
use tracing::debug;

use crate::error::Result;
use crate::field::FieldReader;
use crate::packets::{PacketKind, ReadContext};

/// Type name → packet kind lookup
#[derive(Debug, Clone, Default)]
pub struct PacketRegistry {
    kinds: HashMap<String, PacketKind>,
}

impl PacketRegistry {
    /// Registry that knows nothing; every packet reads back generic
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind under its canonical name
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for kind in PacketKind::ALL {
            registry.register(kind.type_name(), kind);
        }
        registry
    }

    /// Register `kind` as the reader for `type_name`
    ///
    /// A kind may be registered under extra names (legacy aliases). Returns
    /// the kind previously registered for that name.
    pub fn register(&mut self, type_name: impl Into<String>, kind: PacketKind) -> Option<PacketKind> {
        let type_name = type_name.into();
        debug!(type_name = %type_name, kind = ?kind, "Registering packet kind");
        self.kinds.insert(type_name, kind)
    }

    pub fn resolve(&self, type_name: &str) -> Option<PacketKind> {
        self.kinds.get(type_name).copied()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Reject definitions this build can never read
    ///
    /// Unknown type names pass; they decode generic.
    pub fn check(&self, definition: &PacketDefinition) -> Result<()> {
        match self.resolve(&definition.type_name) {
            Some(kind) => kind.check_definition(definition),
            None => Ok(()),
        }
    }

    /// Decode one packet body's field data
    pub(crate) fn read_payload(
        &self,
        definition: &Arc<PacketDefinition>,
        reader: &mut FieldReader<'_>,
        ctx: &ReadContext<'_>,
    ) -> Result<PacketPayload> {
        match self.resolve(&definition.type_name) {
            Some(kind) => {
                kind.check_definition(definition)?;
                kind.read_payload(definition.version, reader, ctx)
            }
            None => Ok(PacketPayload::Generic(GenericPacket {
                definition: Arc::clone(definition),
                raw: bytes::Bytes::copy_from_slice(reader.take_rest()),
            })),
        }
    }
}
