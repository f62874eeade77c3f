//! Component H (core-facing part): wiring parsed snapshot rows into a
//! [`DecodeTree`].
//!
//! Parsing a snapshot's `.ini` file is explicitly out of scope; this module only accepts already-parsed rows — `(start,
//! length, offset, space_str)` memory-range tuples, and decoder rows of
//! `(cs_id, protocol_name)` — and wires them into a tree, matching the
//! architecture's framing that *parsing* belongs to the host while
//! *configuring the decode tree from parsed data* belongs to this crate.

use alloc::string::String;

use crate::element::ElementSink;
use crate::error::{ErrorKind, ErrorRecord, Severity};
use crate::index::CSTraceID;
use crate::memory::{Accessor, MemorySpace};
use crate::registry::DecoderRegistry;
use crate::tree::DecodeTree;

/// Re-exports [`MemorySpace::parse`] under the name the snapshot row format
/// uses.
pub struct MemorySpaceStr;

impl MemorySpaceStr {
    /// Parse a snapshot memory-space string into a [`MemorySpace`] mask.
    #[must_use]
    pub fn parse(s: &str) -> MemorySpace {
        MemorySpace::parse(s)
    }
}

/// One already-parsed memory-range row from a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRangeRow<'a> {
    /// Start address.
    pub start: u64,
    /// Range length in bytes.
    pub length: u64,
    /// Byte offset into the backing buffer the range maps to.
    pub offset: u64,
    /// Unparsed memory-space string, as read from the snapshot row.
    pub space: &'a str,
}

/// Builds up a [`DecodeTree`] from parsed snapshot rows.
///
/// Holds the buffer every [`MemoryRangeRow`] slices into, so accessors added
/// through [`Self::add_memory_range`] can borrow from it directly.
pub struct SnapshotBuilder<'a> {
    buffer: &'a [u8],
    registry: DecoderRegistry,
}

impl<'a> SnapshotBuilder<'a> {
    /// Start a builder backed by `buffer` (typically a memory-mapped trace
    /// dump file) and the built-in decoder name set.
    #[must_use]
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            registry: DecoderRegistry::with_builtins(),
        }
    }

    /// Register an additional decoder name beyond the built-in four.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DcdregNameRepeat`] if `name` is already taken.
    pub fn register_decoder_name(
        &mut self,
        name: impl Into<String>,
        protocol: crate::registry::ProtocolId,
    ) -> Result<(), ErrorRecord> {
        self.registry.register(name, protocol)
    }

    /// Add one parsed memory-range row as an accessor on `tree`.
    ///
    /// `row.offset` is the row's byte offset into the builder's backing
    /// buffer; `row.start`/`row.length` describe the target address range
    /// it maps to.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidParamVal`] if the row's offset/length run
    /// past the end of the backing buffer, or whatever
    /// [`crate::memory::MemoryAccessMap::add_accessor`] rejects (overlap).
    pub fn add_memory_range<S: ElementSink>(
        &self,
        tree: &mut DecodeTree<'a, S>,
        row: MemoryRangeRow<'_>,
    ) -> Result<(), ErrorRecord> {
        let offset = usize::try_from(row.offset).map_err(|_| {
            ErrorRecord::new(Severity::Error, ErrorKind::InvalidParamVal, 0, "offset overflow")
        })?;
        let length = usize::try_from(row.length).map_err(|_| {
            ErrorRecord::new(Severity::Error, ErrorKind::InvalidParamVal, 0, "length overflow")
        })?;
        let end = offset.checked_add(length).ok_or_else(|| {
            ErrorRecord::new(Severity::Error, ErrorKind::InvalidParamVal, 0, "range overflow")
        })?;
        let slice = self.buffer.get(offset..end).ok_or_else(|| {
            ErrorRecord::new(
                Severity::Error,
                ErrorKind::InvalidParamVal,
                0,
                "row runs past end of backing buffer",
            )
        })?;

        let end_addr = row
            .start
            .checked_add(row.length)
            .and_then(|v| v.checked_sub(1))
            .ok_or_else(|| {
                ErrorRecord::new(Severity::Error, ErrorKind::InvalidParamVal, 0, "address range overflow")
            })?;
        let space = MemorySpaceStr::parse(row.space);
        let accessor = Accessor::buffer(row.start, end_addr, space, slice).ok_or_else(|| {
            ErrorRecord::new(
                Severity::Error,
                ErrorKind::InvalidParamVal,
                0,
                "range bounds must be even (half-word aligned)",
            )
        })?;
        tree.add_accessor(accessor)
    }

    /// Resolve `name` to its protocol and register a decoder for `cs_id` on
    /// `tree`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DcdregNameUnknown`] if `name` isn't registered,
    /// or whatever [`DecodeTree::create_decoder`] rejects.
    pub fn create_decoder_by_name<S: ElementSink>(
        &self,
        tree: &mut DecodeTree<'a, S>,
        cs_id: CSTraceID,
        name: &str,
        pkt_flags: crate::datapath::PktProcFlags,
    ) -> Result<(), ErrorRecord> {
        let protocol = self.registry.lookup(name)?;
        tree.create_decoder(cs_id, protocol, pkt_flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::PktProcFlags;
    use crate::element::TraceElement;
    use crate::index::TraceIndex;
    use crate::tree::{CreateFlags, SourceType};

    struct Collector(alloc::vec::Vec<TraceElement>);

    impl ElementSink for Collector {
        type Error = core::convert::Infallible;
        fn trace_elem_in(
            &mut self,
            _index_sop: TraceIndex,
            _cs_id: CSTraceID,
            elem: &TraceElement,
        ) -> Result<crate::datapath::DatapathResponse, Self::Error> {
            self.0.push(*elem);
            Ok(crate::datapath::DatapathResponse::Cont)
        }
    }

    #[test]
    fn memory_space_str_matches_memory_space_parse() {
        assert_eq!(MemorySpaceStr::parse("secure"), MemorySpace::SECURE);
    }

    #[test]
    fn builds_tree_from_parsed_rows() {
        let mut backing = alloc::vec![0u8; 0x100];
        backing[0x10..0x14].copy_from_slice(&0xEA00_0000u32.to_le_bytes());
        let builder = SnapshotBuilder::new(&backing);

        let mut tree = DecodeTree::new(SourceType::Single, CreateFlags::FullDecoder, Collector(alloc::vec::Vec::new()));
        let cs_id = CSTraceID::new(3).unwrap();
        builder
            .create_decoder_by_name(&mut tree, cs_id, "ptm", PktProcFlags::PKTPROC_COMMON)
            .unwrap();
        builder
            .add_memory_range(
                &mut tree,
                MemoryRangeRow {
                    start: 0x4000,
                    length: 0x10,
                    offset: 0x10,
                    space: "ns",
                },
            )
            .unwrap();
    }

    #[test]
    fn unknown_decoder_name_is_rejected() {
        let backing = alloc::vec![0u8; 0x10];
        let builder = SnapshotBuilder::new(&backing);
        let mut tree = DecodeTree::new(SourceType::Single, CreateFlags::FullDecoder, Collector(alloc::vec::Vec::new()));
        let cs_id = CSTraceID::new(3).unwrap();
        let err = builder
            .create_decoder_by_name(&mut tree, cs_id, "bogus", PktProcFlags::PKTPROC_COMMON)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DcdregNameUnknown);
    }
}
