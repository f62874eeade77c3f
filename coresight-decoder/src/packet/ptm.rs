//! Shared PTM (PFTv1.1) / ETMv3 packet processor.
//!
//! Byte-oriented. Sync is the A-sync sequence (five `0x00` bytes followed by
//! `0x80`, mirroring the ITM sync pattern). Branch address and most
//! continuation fields use 7-bit-per-byte little-endian chunks with bit 7 as
//! the continuation flag, in the style of the architecture's compressed
//! address encoding.

use alloc::vec::Vec;

use crate::datapath::{DatapathResponse, OpCode, PktProcFlags};
use crate::index::TraceIndex;
use crate::packet::{
    BadPacketAction, BadPacketKind, PacketSink, RawPacketMonitor, StepResult,
    resolve_bad_packet_action,
};

/// Instruction set state carried by address and sync packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Isa {
    /// ARM (A32) instructions.
    Arm,
    /// Thumb (T32) instructions.
    Thumb,
}

/// A decoded PTM/ETMv3 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PtmPacket {
    /// Synchronisation packet.
    ASync,
    /// Instruction synchronisation: a full address plus PE context.
    ISync {
        /// Program counter at the sync point.
        address: u32,
        /// Instruction set in effect.
        isa: Isa,
        /// Cycle count attached, if the cycle-accurate I-sync form was used.
        cycle_count: Option<u32>,
    },
    /// A compressed branch target address.
    BranchAddress {
        /// Target address (top bit of the final continuation byte carries
        /// the exception flag, not the address).
        address: u32,
        /// Instruction set in effect after the branch.
        isa: Isa,
        /// Whether this branch was taken due to an exception.
        exception: bool,
    },
    /// Atom (P-header) packet: a run of taken/not-taken bits, MSB first,
    /// only the low `valid_bits` of `bits` are meaningful.
    Atom {
        /// Packed E/N bits.
        bits: u8,
        /// How many of `bits`' low bits are valid.
        valid_bits: u8,
    },
    /// Waypoint update with no address payload.
    Waypoint,
    /// Trace timestamp.
    Timestamp {
        /// Timestamp value, assembled from 7-bit continuation bytes.
        value: u64,
    },
    /// New context ID.
    ContextId {
        /// 32-bit context identifier.
        value: u32,
    },
    /// New virtual machine ID.
    Vmid {
        /// 8-bit VMID.
        value: u8,
    },
    /// Trigger event marker.
    Trigger,
    /// Exception entry.
    Exception {
        /// Architecturally defined exception number.
        number: u16,
    },
    /// Exception return.
    ExceptionReturn,
    /// Explicit filler with no semantic content.
    Ignore,
    /// Standalone cycle count update (non-cycle-accurate I-sync form).
    CycleCount {
        /// Cycle count value, assembled from 7-bit continuation bytes.
        value: u32,
    },
    /// A header byte the protocol reserves.
    Reserved {
        /// The offending header byte.
        header: u8,
    },
}

#[derive(Debug, Clone, Copy)]
enum Continued {
    Timestamp,
    CycleCount,
    BranchAddress,
}

#[derive(Debug, Clone, Copy)]
enum PtmState {
    WaitSync { zero_run: u8 },
    Header,
    FixedBytes {
        kind: FixedKind,
        needed: u8,
        collected: u8,
        buf: [u8; 4],
    },
    Continuation {
        kind: Continued,
        value: u64,
        shift: u32,
        consumed: u8,
    },
}

#[derive(Debug, Clone, Copy)]
enum FixedKind {
    ISync,
    ContextId,
    Vmid,
    Exception,
}

/// Pausable PTM/ETMv3 byte-stream processor.
pub struct PtmProcessor {
    state: PtmState,
    flags: PktProcFlags,
    index: TraceIndex,
    packet_start: TraceIndex,
    raw_buf: Vec<u8>,
    isa: Isa,
}

const CONTINUATION_LIMIT: u8 = 5;

impl PtmProcessor {
    /// Build a processor with the given op-mode flags, starting in sync
    /// search.
    #[must_use]
    pub fn new(flags: PktProcFlags) -> Self {
        Self {
            state: PtmState::WaitSync { zero_run: 0 },
            flags,
            index: 0,
            packet_start: 0,
            raw_buf: Vec::new(),
            isa: Isa::Arm,
        }
    }

    /// Discard all buffered state and return to sync search.
    pub fn reset(&mut self) {
        self.state = PtmState::WaitSync { zero_run: 0 };
        self.raw_buf.clear();
    }

    /// Feed bytes through the processor, emitting complete packets to
    /// `sink` (and, if attached, `raw`).
    pub fn trace_data_in(
        &mut self,
        op: OpCode<'_>,
        sink: &mut impl PacketSink<PtmPacket>,
        mut raw: Option<&mut dyn RawPacketMonitor<PtmPacket>>,
    ) -> StepResult {
        let bytes = match op {
            OpCode::Data(bytes) => bytes,
            OpCode::Reset => {
                self.reset();
                return (0, DatapathResponse::Cont);
            }
            OpCode::Flush | OpCode::Eot => &[],
        };

        let mut used = 0;
        let mut worst = DatapathResponse::Cont;

        for &byte in bytes {
            if self.raw_buf.is_empty() {
                self.packet_start = self.index;
            }
            self.raw_buf.push(byte);

            match self.step(byte) {
                Ok(Some(packet)) => {
                    if let Some(raw) = raw.as_deref_mut() {
                        raw.on_raw_packet(self.packet_start, &packet, &self.raw_buf);
                    }
                    self.raw_buf.clear();
                    match sink.on_packet(self.packet_start, &packet, None) {
                        Ok(resp) => worst = worst.combine(resp),
                        Err(_) => worst = worst.combine(DatapathResponse::FatalSysErr),
                    }
                }
                Ok(None) => {}
                Err((bad, packet)) => {
                    self.raw_buf.clear();
                    match resolve_bad_packet_action(self.flags) {
                        BadPacketAction::Fatal => {
                            worst = worst.combine(DatapathResponse::FatalInvalidData);
                        }
                        action => {
                            if let Ok(resp) = sink.on_packet(self.packet_start, &packet, Some(bad)) {
                                worst = worst.combine(resp);
                            }
                            if matches!(action, BadPacketAction::EmitAndResync) {
                                self.reset();
                            }
                        }
                    }
                }
            }
            self.index += 1;
            used += 1;
        }

        (used, worst)
    }

    fn step(&mut self, byte: u8) -> Result<Option<PtmPacket>, (BadPacketKind, PtmPacket)> {
        match self.state {
            PtmState::WaitSync { zero_run } => {
                if byte == 0x00 {
                    self.state = PtmState::WaitSync {
                        zero_run: zero_run.saturating_add(1),
                    };
                    Ok(None)
                } else if byte == 0x80 && zero_run >= 5 {
                    self.state = PtmState::Header;
                    Ok(Some(PtmPacket::ASync))
                } else {
                    self.state = PtmState::WaitSync { zero_run: 0 };
                    Ok(None)
                }
            }
            PtmState::Header => self.decode_header(byte),
            PtmState::FixedBytes {
                kind,
                needed,
                mut collected,
                mut buf,
            } => {
                buf[collected as usize] = byte;
                collected += 1;
                if collected < needed {
                    self.state = PtmState::FixedBytes {
                        kind,
                        needed,
                        collected,
                        buf,
                    };
                    return Ok(None);
                }
                self.state = PtmState::Header;
                Ok(Some(match kind {
                    FixedKind::ISync => {
                        let address = u32::from_le_bytes(buf) & !1;
                        let isa = if buf[0] & 1 != 0 { Isa::Thumb } else { Isa::Arm };
                        self.isa = isa;
                        PtmPacket::ISync {
                            address,
                            isa,
                            cycle_count: None,
                        }
                    }
                    FixedKind::ContextId => PtmPacket::ContextId {
                        value: u32::from_le_bytes(buf),
                    },
                    FixedKind::Vmid => PtmPacket::Vmid { value: buf[0] },
                    FixedKind::Exception => PtmPacket::Exception {
                        number: value_from(buf),
                    },
                }))
            }
            PtmState::Continuation {
                kind,
                mut value,
                shift,
                mut consumed,
            } => {
                let continues = byte & 0x80 != 0;
                value |= u64::from(byte & 0x7F) << shift;
                consumed += 1;

                if continues && consumed < CONTINUATION_LIMIT {
                    self.state = PtmState::Continuation {
                        kind,
                        value,
                        shift: shift + 7,
                        consumed,
                    };
                    return Ok(None);
                }

                self.state = PtmState::Header;
                Ok(Some(match kind {
                    Continued::Timestamp => PtmPacket::Timestamp { value },
                    Continued::CycleCount => PtmPacket::CycleCount {
                        value: value as u32,
                    },
                    Continued::BranchAddress => {
                        let exception = byte & 0x40 != 0 && !continues;
                        let isa = self.isa;
                        PtmPacket::BranchAddress {
                            address: value as u32,
                            isa,
                            exception,
                        }
                    }
                }))
            }
        }
    }

    fn decode_header(&mut self, header: u8) -> Result<Option<PtmPacket>, (BadPacketKind, PtmPacket)> {
        match header {
            0x00 => {
                self.state = PtmState::WaitSync { zero_run: 1 };
                Ok(None)
            }
            0x08 => {
                self.state = PtmState::FixedBytes {
                    kind: FixedKind::ISync,
                    needed: 4,
                    collected: 0,
                    buf: [0; 4],
                };
                Ok(None)
            }
            0x03 => {
                self.state = PtmState::FixedBytes {
                    kind: FixedKind::ContextId,
                    needed: 4,
                    collected: 0,
                    buf: [0; 4],
                };
                Ok(None)
            }
            0x05 => {
                self.state = PtmState::FixedBytes {
                    kind: FixedKind::Vmid,
                    needed: 1,
                    collected: 0,
                    buf: [0; 4],
                };
                Ok(None)
            }
            0x06 => {
                self.state = PtmState::FixedBytes {
                    kind: FixedKind::Exception,
                    needed: 2,
                    collected: 0,
                    buf: [0; 4],
                };
                Ok(None)
            }
            0x07 => Ok(Some(PtmPacket::ExceptionReturn)),
            0x01 => {
                self.state = PtmState::Continuation {
                    kind: Continued::Timestamp,
                    value: 0,
                    shift: 0,
                    consumed: 0,
                };
                Ok(None)
            }
            0x02 => {
                self.state = PtmState::Continuation {
                    kind: Continued::CycleCount,
                    value: 0,
                    shift: 0,
                    consumed: 0,
                };
                Ok(None)
            }
            0x04 => Ok(Some(PtmPacket::Trigger)),
            0x09 => Ok(Some(PtmPacket::Waypoint)),
            0x0A => Ok(Some(PtmPacket::Ignore)),
            _ if header & 0x01 == 0x01 => {
                let value = u64::from((header >> 1) & 0x3F);
                if header & 0x80 == 0 {
                    let isa = self.isa;
                    return Ok(Some(PtmPacket::BranchAddress {
                        address: value as u32,
                        isa,
                        exception: false,
                    }));
                }
                self.state = PtmState::Continuation {
                    kind: Continued::BranchAddress,
                    value,
                    shift: 6,
                    consumed: 0,
                };
                Ok(None)
            }
            _ if header & 0x80 == 0x80 => Ok(Some(PtmPacket::Atom {
                bits: header & 0x7F,
                valid_bits: 7,
            })),
            _ => Err((BadPacketKind::Reserved, PtmPacket::Reserved { header })),
        }
    }
}

fn value_from(buf: [u8; 4]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Collector(Vec<PtmPacket>);

    impl PacketSink<PtmPacket> for Collector {
        type Error = core::convert::Infallible;
        fn on_packet(
            &mut self,
            _index_sop: TraceIndex,
            packet: &PtmPacket,
            _bad: Option<BadPacketKind>,
        ) -> Result<DatapathResponse, Self::Error> {
            self.0.push(*packet);
            Ok(DatapathResponse::Cont)
        }
    }

    #[test]
    fn async_then_isync_then_atom() {
        let mut input: Vec<u8> = alloc::vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x80];
        input.push(0x08);
        input.extend_from_slice(&[0x00, 0x00, 0x10, 0x00]);
        input.push(0x80 | 0b0101_0100);

        let mut proc = PtmProcessor::new(PktProcFlags::PKTPROC_COMMON);
        let mut collector = Collector(Vec::new());
        proc.trace_data_in(OpCode::Data(&input), &mut collector, None);

        assert_eq!(collector.0[0], PtmPacket::ASync);
        assert_eq!(
            collector.0[1],
            PtmPacket::ISync {
                address: 0x0010_0000,
                isa: Isa::Arm,
                cycle_count: None,
            }
        );
        assert_eq!(
            collector.0[2],
            PtmPacket::Atom {
                bits: 0b0101_0100,
                valid_bits: 7,
            }
        );
    }

    #[test]
    fn branch_address_single_byte() {
        let mut input: Vec<u8> = alloc::vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x80];
        input.push(0b0000_1011);
        let mut proc = PtmProcessor::new(PktProcFlags::PKTPROC_COMMON);
        let mut collector = Collector(Vec::new());
        proc.trace_data_in(OpCode::Data(&input), &mut collector, None);
        match collector.0[1] {
            PtmPacket::BranchAddress { address, .. } => assert_eq!(address, 0b0000_0101),
            other => panic!("expected BranchAddress, got {other:?}"),
        }
    }
}
