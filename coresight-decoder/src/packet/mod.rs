//! Component D: per-protocol packet processors.
//!
//! All four processors (ITM, STM, PTM, ETMv3) share one contract: a
//! pausable `trace_data_in(op, bytes) -> (used, resp)` step function that
//! consumes at most one packet's worth of input per call to its sinks, and
//! two sink chains — typed packets and a raw monitor that sees bytes even
//! when the typed chain is muted.

pub mod itm;
pub mod ptm;
pub mod stm;

use crate::datapath::{DatapathResponse, PktProcFlags};
use crate::index::TraceIndex;

/// Bad-packet taxonomy shared by every processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BadPacketKind {
    /// The protocol's sequencing rules were violated.
    BadSequence,
    /// A header encoded a value the protocol reserves.
    Reserved,
    /// The buffer ended in the middle of a packet.
    IncompleteEot,
}

/// Receives typed packets from a processor's `pktOutI` chain.
pub trait PacketSink<P> {
    /// Error type this sink may fail with.
    type Error: core::error::Error;

    /// A new packet was decoded (or, if `bad` is set, recovered from a
    /// protocol violation and is being surfaced rather than dropped).
    fn on_packet(
        &mut self,
        index_sop: TraceIndex,
        packet: &P,
        bad: Option<BadPacketKind>,
    ) -> Result<DatapathResponse, Self::Error>;
}

/// Receives typed packets alongside their raw bytes, regardless of whether
/// the typed [`PacketSink`] chain is muted.
pub trait RawPacketMonitor<P> {
    /// Observe a decoded packet's raw encoding.
    fn on_raw_packet(&mut self, index_sop: TraceIndex, packet: &P, raw_bytes: &[u8]);
}

/// Resolves how a processor reacts to a [`BadPacketKind`], per the op-mode
/// flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BadPacketAction {
    /// Emit the bad packet as ordinary output and keep decoding at the
    /// current position.
    EmitAndContinue,
    /// Emit the bad packet, then return to sync search.
    EmitAndResync,
    /// Surface a fatal datapath response instead of emitting anything.
    Fatal,
}

pub(crate) fn resolve_bad_packet_action(flags: PktProcFlags) -> BadPacketAction {
    if flags.contains(PktProcFlags::ERR_BAD_PKTS) {
        BadPacketAction::Fatal
    } else if flags.contains(PktProcFlags::UNSYNC_ON_BAD_PKTS) {
        BadPacketAction::EmitAndResync
    } else {
        BadPacketAction::EmitAndContinue
    }
}

/// A step function's outcome: bytes consumed and the worst datapath
/// response observed.
pub type StepResult = (usize, DatapathResponse);
