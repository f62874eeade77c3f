//! Component E: packet → generic trace element decoders.
//!
//! Two families share the `{NoSync, WaitSync, DecodePackets}` state machine:
//! [`swtrace`] (ITM/STM, software instrumentation) and [`instrtrace`]
//! (PTM/ETMv3, instruction trace). Both attach as the
//! terminal consumer of a packet processor's `pktOutI` chain and forward a
//! uniform [`TraceElement`] stream to whatever implements [`ElementSink`].

pub mod instrtrace;
pub mod swtrace;

use crate::datapath::DatapathResponse;
use crate::index::TraceIndex;
use crate::packet::ptm::Isa;

/// Security state component of a [`PeContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Security {
    /// Non-secure world.
    NonSecure,
    /// Secure world.
    Secure,
    /// Realm world (RME).
    Realm,
    /// Root world (RME).
    Root,
}

/// Processing-element state required to interpret instruction addresses
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeContext {
    /// Instruction set currently in effect.
    pub isa: Isa,
    /// Security state.
    pub security: Security,
    /// Exception level, 0-3.
    pub exception_level: u8,
    /// Context ID, if one has been reported.
    pub context_id: Option<u32>,
    /// Virtual machine ID, if one has been reported.
    pub vmid: Option<u8>,
}

impl Default for PeContext {
    fn default() -> Self {
        Self {
            isa: Isa::Arm,
            security: Security::NonSecure,
            exception_level: 0,
            context_id: None,
            vmid: None,
        }
    }
}

/// Why an element decoder (re-)entered `NoSync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NoSyncReason {
    /// The decoder has not yet seen its first sync packet.
    Init,
    /// A bad packet was recovered from and the decoder had to resync.
    BadPacket,
    /// An explicit `RESET` op code was received.
    ResetDecoder,
    /// Clean end of trace.
    Eot,
}

/// The last instruction of a completed [`TraceElement::InstrRange`], which
/// determines what comes next in the element stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LastInstrKind {
    /// An ordinary instruction; the range ended because of a waypoint from
    /// atom data, not a control-flow change.
    Other,
    /// A direct or indirect branch.
    Branch,
    /// A branch-and-link (call).
    BranchLink,
    /// An instruction that enters an exception.
    Exception,
    /// An instruction that returns from an exception.
    ExceptionReturn,
}

/// Flags describing a [`TraceElement::SwTrace`] packet's metadata bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SwTraceFlags {
    /// The packet's marker/M bit was set (STM) or it came from a DWT
    /// event-counter/exception-trace source (ITM).
    pub marker: bool,
    /// A timestamp suffix (STM) or TS packet correlation (ITM) is attached.
    pub timestamp: bool,
    /// STM frequency-report packet.
    pub freq: bool,
    /// STM trigger packet.
    pub trigger: bool,
    /// STM global-error packet.
    pub global_err: bool,
    /// STM master-error packet.
    pub master_err: bool,
    /// Whether `channel_id`/`master_id` carry a protocol-assigned value
    /// rather than being defaulted to 0 (e.g. ITM DWT packets have no
    /// channel concept).
    pub id_valid: bool,
}

/// A single decoded trace element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceElement {
    /// The decoder has no valid sync point; no other element may be
    /// trusted until the next non-`NoSync` element.
    NoSync(NoSyncReason),
    /// A sync packet was observed; the decoder is now aligned.
    TraceOn,
    /// Clean, ordered end of the trace for this source.
    EoTrace,
    /// The PE context changed (ISA, security state, EL, context ID, VMID).
    PeContext(PeContext),
    /// A contiguous run of instructions was executed.
    InstrRange {
        /// First instruction's address (inclusive).
        start_addr: u64,
        /// Address one past the last instruction executed (exclusive).
        end_addr: u64,
        /// Instruction set in effect for the whole range.
        isa: Isa,
        /// Classification of the instruction that ended the range.
        last_instr: LastInstrKind,
    },
    /// The memory layer had no accessor covering an address the instruction
    /// decoder needed.
    AddrNacc(u64),
    /// The target address could not be determined from the packet stream
    /// (e.g. an indirect branch with no waypoint data yet).
    AddrUnknown(u64),
    /// Exception entry.
    Exception {
        /// Architecturally defined exception number.
        number: u16,
    },
    /// Exception return.
    ExceptionRet,
    /// A timestamp value correlated to the preceding elements.
    Timestamp(u64),
    /// A cycle count value.
    CycleCount(u32),
    /// Software instrumentation payload (ITM/STM).
    SwTrace {
        /// ITM stimulus-port or STM master ID.
        master_id: u16,
        /// STM channel ID (always 0 for ITM).
        channel_id: u16,
        /// Payload width in bits.
        payload_bits: u8,
        /// Zero-extended payload value.
        payload: u64,
        /// Metadata bits attached to the source packet.
        flags: SwTraceFlags,
    },
    /// A protocol event marker with no further payload (STM trigger/flag
    /// when no more specific element applies).
    Event,
    /// A custom, implementation-defined synchronisation marker.
    Sync,
}

/// Receives the terminal element stream, keyed by source ID.
pub trait ElementSink {
    /// Error type this sink may fail with.
    type Error: core::error::Error;

    /// A new element was produced for `cs_id` at byte offset `index_sop`.
    ///
    /// Returning [`DatapathResponse::Wait`] backpressures the whole
    /// pipeline; the caller must retry via `FLUSH`.
    fn trace_elem_in(
        &mut self,
        index_sop: TraceIndex,
        cs_id: crate::index::CSTraceID,
        elem: &TraceElement,
    ) -> Result<DatapathResponse, Self::Error>;
}
