//! Component G: decoder registry.
//!
//! Maps a human-readable name to the protocol it decodes, so a host can name
//! decoders in configuration (e.g. a snapshot's `.ini`) without hard-coding
//! the protocol enum everywhere. Keyed by name with `hashbrown`, matching the
//! map crate the rest of the pack reaches for.

use alloc::string::String;
use hashbrown::HashMap;

use crate::error::{ErrorKind, ErrorRecord, Severity};

/// Which packet/element decoder family a registry entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    /// ARMv7-M Instrumentation Trace Macrocell.
    Itm,
    /// System Trace Macrocell (STPv2).
    Stm,
    /// Program Trace Macrocell / PFTv1.1.
    Ptm,
    /// Embedded Trace Macrocell v3.
    Etmv3,
    /// Implementation-defined extension slot, for hosts that register their
    /// own protocol outside this crate's built-in set.
    Custom(u16),
}

/// Maps decoder names to the protocol they decode.
///
/// This is deliberately just a name table: it does not itself construct
/// packet processors or element decoders (that remains [`crate::tree`]'s
/// job, since only the tree knows which generic `ElementSink` it's wired
/// to), it only answers "what protocol is `name`" and rejects duplicate or
/// unknown names the way the architecture's registration API does.
#[derive(Debug, Default)]
pub struct DecoderRegistry {
    by_name: HashMap<String, ProtocolId>,
}

impl DecoderRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    /// Build a registry pre-populated with the four built-in protocol
    /// names (`"itm"`, `"stm"`, `"ptm"`, `"etmv3"`).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.by_name.insert("itm".into(), ProtocolId::Itm);
        registry.by_name.insert("stm".into(), ProtocolId::Stm);
        registry.by_name.insert("ptm".into(), ProtocolId::Ptm);
        registry.by_name.insert("etmv3".into(), ProtocolId::Etmv3);
        registry
    }

    /// Register `name` as decoding `protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DcdregNameRepeat`] if `name` is already
    /// registered, even to the same protocol.
    pub fn register(&mut self, name: impl Into<String>, protocol: ProtocolId) -> Result<(), ErrorRecord> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(ErrorRecord::new(
                Severity::Error,
                ErrorKind::DcdregNameRepeat,
                0,
                name,
            ));
        }
        self.by_name.insert(name, protocol);
        Ok(())
    }

    /// Remove a registered name, if present.
    pub fn deregister(&mut self, name: &str) {
        self.by_name.remove(name);
    }

    /// Look up the protocol registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DcdregNameUnknown`] if nothing is registered
    /// under that name.
    pub fn lookup(&self, name: &str) -> Result<ProtocolId, ErrorRecord> {
        self.by_name.get(name).copied().ok_or_else(|| {
            ErrorRecord::new(Severity::Error, ErrorKind::DcdregNameUnknown, 0, name)
        })
    }

    /// Whether any name is registered for `protocol`.
    #[must_use]
    pub fn has_protocol(&self, protocol: ProtocolId) -> bool {
        self.by_name.values().any(|p| *p == protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_by_name() {
        let registry = DecoderRegistry::with_builtins();
        assert_eq!(registry.lookup("itm").unwrap(), ProtocolId::Itm);
        assert_eq!(registry.lookup("etmv3").unwrap(), ProtocolId::Etmv3);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = DecoderRegistry::new();
        registry.register("core0", ProtocolId::Ptm).unwrap();
        let err = registry.register("core0", ProtocolId::Etmv3).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DcdregNameRepeat);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let registry = DecoderRegistry::new();
        let err = registry.lookup("nope").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DcdregNameUnknown);
    }

    #[test]
    fn deregister_then_reregister_succeeds() {
        let mut registry = DecoderRegistry::new();
        registry.register("core0", ProtocolId::Itm).unwrap();
        registry.deregister("core0");
        registry.register("core0", ProtocolId::Stm).unwrap();
        assert_eq!(registry.lookup("core0").unwrap(), ProtocolId::Stm);
    }
}
