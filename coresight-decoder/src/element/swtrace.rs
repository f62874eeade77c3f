//! ITM/STM element decoder.
//!
//! Decoding and delivery are deliberately separate: [`ItmElementDecoder::on_packet`]
//! and [`StmElementDecoder::on_packet`] run a packet through the state
//! machine exactly once, mutating decoder state and appending every element
//! it produces to an output buffer. Nothing here calls an
//! [`ElementSink`](crate::element::ElementSink) directly, so a sink
//! returning `WAIT` partway through delivery can never
//! cause a packet to be re-decoded (which would re-run the state mutation
//! and either double it or skip the element that was mid-flight) — the
//! caller (the decode tree) is the only place that drains the buffer against
//! a sink and retries, and it retries by re-delivering the same already-computed
//! elements, never by calling `on_packet` again.

use alloc::vec::Vec;

use crate::element::{NoSyncReason, SwTraceFlags, TraceElement};
use crate::packet::itm::ItmPacket;
use crate::packet::stm::{StmPacket, TsEncoding};
use crate::packet::BadPacketKind;

/// The shared `{NoSync, WaitSync, DecodePackets}` machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    NoSync,
    WaitSync,
    DecodePackets,
}

/// ITM packet → element decoder.
///
/// Accumulates local and global timestamps across packets the way the
/// architecture specifies (local TS is a running delta sum; global TS is
/// split across two packets and only emitted once both halves, or a lone
/// low half, have arrived).
pub struct ItmElementDecoder {
    sync: SyncState,
    local_ts: u64,
    ts_prescale: u32,
    gts_low: Option<u32>,
}

impl ItmElementDecoder {
    /// Build a decoder starting in `NoSync`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sync: SyncState::NoSync,
            local_ts: 0,
            ts_prescale: 1,
            gts_low: None,
        }
    }

    /// Set the local-timestamp prescaler (from `RegTCR` bits 9:8, gated by
    /// bit 4).
    pub fn set_ts_prescale(&mut self, prescale: u32) {
        self.ts_prescale = prescale.max(1);
    }

    /// Discard accumulated state and return to `NoSync` (RESET op code).
    pub fn reset(&mut self) {
        self.sync = SyncState::NoSync;
        self.local_ts = 0;
        self.gts_low = None;
    }

    /// Clean end of trace: the element for `EoTrace`.
    #[must_use]
    pub fn eot_element(&self) -> TraceElement {
        TraceElement::EoTrace
    }

    /// Feed one packet (as collected from an [`ItmProcessor`](crate::packet::itm::ItmProcessor))
    /// through the element decoder, appending every element it produces to
    /// `out`. Runs exactly once per packet — callers must not call this
    /// again for a packet whose elements are still being drained to a sink.
    pub fn on_packet(&mut self, packet: &ItmPacket, bad: Option<BadPacketKind>, out: &mut Vec<TraceElement>) {
        if self.sync == SyncState::NoSync {
            out.push(TraceElement::NoSync(NoSyncReason::Init));
            self.sync = SyncState::WaitSync;
        }

        if bad.is_some() {
            self.sync = SyncState::WaitSync;
            out.push(TraceElement::NoSync(NoSyncReason::BadPacket));
            return;
        }

        match packet {
            ItmPacket::Async => {
                self.sync = SyncState::DecodePackets;
                out.push(TraceElement::TraceOn);
            }
            ItmPacket::Overflow if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::Event);
            }
            ItmPacket::Swit { src_id, size, value } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: u16::from(*src_id),
                    channel_id: 0,
                    payload_bits: size * 8,
                    payload: u64::from(*value),
                    flags: SwTraceFlags {
                        id_valid: true,
                        ..SwTraceFlags::default()
                    },
                });
            }
            ItmPacket::Dwt {
                discriminator,
                size,
                value,
            } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: u16::from(*discriminator),
                    channel_id: 0,
                    payload_bits: size * 8,
                    payload: u64::from(*value),
                    flags: SwTraceFlags {
                        marker: true,
                        id_valid: true,
                        ..SwTraceFlags::default()
                    },
                });
            }
            ItmPacket::TsLocal { value, .. } if self.sync == SyncState::DecodePackets => {
                self.local_ts += u64::from(*value) * u64::from(self.ts_prescale);
                out.push(TraceElement::Timestamp(self.local_ts));
            }
            ItmPacket::TsGlobal1 { value, .. } if self.sync == SyncState::DecodePackets => {
                self.gts_low = Some(*value);
                out.push(TraceElement::Timestamp(u64::from(*value)));
            }
            ItmPacket::TsGlobal2 { value } if self.sync == SyncState::DecodePackets => {
                let low = self.gts_low.take().unwrap_or(0);
                out.push(TraceElement::Timestamp((u64::from(*value) << 26) | u64::from(low)));
            }
            ItmPacket::Extension { value, .. } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: 0,
                    channel_id: 0,
                    payload_bits: 32,
                    payload: u64::from(*value),
                    flags: SwTraceFlags::default(),
                });
            }
            _ => {}
        }
    }
}

impl Default for ItmElementDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// STM packet → element decoder.
pub struct StmElementDecoder {
    sync: SyncState,
    encoding: TsEncoding,
    current_channel: u16,
}

impl StmElementDecoder {
    /// Build a decoder starting in `NoSync`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sync: SyncState::NoSync,
            encoding: TsEncoding::NatBinary,
            current_channel: 0,
        }
    }

    /// Discard accumulated state and return to `NoSync` (RESET op code).
    pub fn reset(&mut self) {
        self.sync = SyncState::NoSync;
        self.current_channel = 0;
    }

    /// Clean end of trace: the element for `EoTrace`.
    #[must_use]
    pub fn eot_element(&self) -> TraceElement {
        TraceElement::EoTrace
    }

    /// Feed one packet through the element decoder, appending every element
    /// it produces to `out`. Runs exactly once per packet.
    pub fn on_packet(&mut self, packet: &StmPacket, bad: Option<BadPacketKind>, out: &mut Vec<TraceElement>) {
        if self.sync == SyncState::NoSync {
            out.push(TraceElement::NoSync(NoSyncReason::Init));
            self.sync = SyncState::WaitSync;
        }

        if bad.is_some() {
            self.sync = SyncState::WaitSync;
            out.push(TraceElement::NoSync(NoSyncReason::BadPacket));
            return;
        }

        match packet {
            StmPacket::Async => {
                self.sync = SyncState::DecodePackets;
                out.push(TraceElement::TraceOn);
            }
            StmPacket::Version { encoding } if self.sync == SyncState::DecodePackets => {
                self.encoding = *encoding;
            }
            StmPacket::C8 { channel } if self.sync == SyncState::DecodePackets => {
                self.current_channel = u16::from(*channel);
            }
            StmPacket::C16 { channel } if self.sync == SyncState::DecodePackets => {
                self.current_channel = *channel;
            }
            StmPacket::Data {
                width,
                value,
                marker,
                timestamp,
            } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: 0,
                    channel_id: self.current_channel,
                    payload_bits: *width,
                    payload: *value,
                    flags: SwTraceFlags {
                        marker: *marker,
                        timestamp: timestamp.is_some(),
                        id_valid: true,
                        ..SwTraceFlags::default()
                    },
                });
            }
            StmPacket::M8 { data } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: 0,
                    channel_id: self.current_channel,
                    payload_bits: 8,
                    payload: u64::from(*data),
                    flags: SwTraceFlags {
                        marker: true,
                        id_valid: true,
                        ..SwTraceFlags::default()
                    },
                });
            }
            StmPacket::Freq { value } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: 0,
                    channel_id: self.current_channel,
                    payload_bits: 32,
                    payload: u64::from(*value),
                    flags: SwTraceFlags {
                        freq: true,
                        ..SwTraceFlags::default()
                    },
                });
            }
            StmPacket::Trigger if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: 0,
                    channel_id: self.current_channel,
                    payload_bits: 0,
                    payload: 0,
                    flags: SwTraceFlags {
                        trigger: true,
                        ..SwTraceFlags::default()
                    },
                });
            }
            StmPacket::Gerr if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: 0,
                    channel_id: self.current_channel,
                    payload_bits: 0,
                    payload: 0,
                    flags: SwTraceFlags {
                        global_err: true,
                        ..SwTraceFlags::default()
                    },
                });
            }
            StmPacket::Merr if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::SwTrace {
                    master_id: 0,
                    channel_id: self.current_channel,
                    payload_bits: 0,
                    payload: 0,
                    flags: SwTraceFlags {
                        master_err: true,
                        ..SwTraceFlags::default()
                    },
                });
            }
            StmPacket::Flag if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::Sync);
            }
            _ => {}
        }
    }
}

impl Default for StmElementDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_sync_precedes_first_element() {
        let mut decoder = ItmElementDecoder::new();
        let mut out = Vec::new();
        decoder.on_packet(&ItmPacket::Async, None, &mut out);
        assert_eq!(out[0], TraceElement::NoSync(NoSyncReason::Init));
        assert_eq!(out[1], TraceElement::TraceOn);
    }

    #[test]
    fn swit_becomes_swtrace_element() {
        let mut decoder = ItmElementDecoder::new();
        let mut out = Vec::new();
        decoder.on_packet(&ItmPacket::Async, None, &mut out);
        decoder.on_packet(
            &ItmPacket::Swit {
                src_id: 3,
                size: 1,
                value: 0xAA,
            },
            None,
            &mut out,
        );
        match out.last().unwrap() {
            TraceElement::SwTrace {
                master_id: 3,
                payload: 0xAA,
                payload_bits: 8,
                ..
            } => {}
            other => panic!("unexpected element: {other:?}"),
        }
    }

    #[test]
    fn ts_local_does_not_double_on_reemission() {
        // Regression: on_packet must run exactly once per packet. A caller
        // that retries delivery (WAIT/FLUSH) must replay already-computed
        // elements, never call on_packet again for the same packet.
        let mut decoder = ItmElementDecoder::new();
        let mut out = Vec::new();
        decoder.on_packet(&ItmPacket::Async, None, &mut out);
        decoder.on_packet(&ItmPacket::TsLocal { tc: 0, value: 10 }, None, &mut out);
        assert_eq!(out.last().unwrap(), &TraceElement::Timestamp(10));
        decoder.on_packet(&ItmPacket::TsLocal { tc: 0, value: 5 }, None, &mut out);
        assert_eq!(out.last().unwrap(), &TraceElement::Timestamp(15));
    }

    #[test]
    fn bad_packet_reenters_no_sync() {
        let mut decoder = StmElementDecoder::new();
        let mut out = Vec::new();
        decoder.on_packet(&StmPacket::Async, None, &mut out);
        decoder.on_packet(
            &StmPacket::Reserved {
                nibbles: alloc::vec![0xF, 0xF],
            },
            Some(BadPacketKind::Reserved),
            &mut out,
        );
        assert_eq!(out.last().unwrap(), &TraceElement::NoSync(NoSyncReason::BadPacket));
    }
}
