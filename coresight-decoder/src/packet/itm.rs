//! ITM packet processor.

use alloc::vec::Vec;

use crate::datapath::{DatapathResponse, OpCode, PktProcFlags};
use crate::index::TraceIndex;
use crate::packet::{
    BadPacketAction, BadPacketKind, PacketSink, RawPacketMonitor, StepResult,
    resolve_bad_packet_action,
};

/// A decoded ITM packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ItmPacket {
    /// Synchronisation packet: five `0x00` bytes followed by `0x80`.
    Async,
    /// Overflow packet (`0x70`).
    Overflow,
    /// Software instrumentation (stimulus port) packet.
    Swit {
        /// Stimulus port / source ID, 5 bits.
        src_id: u8,
        /// Payload size in bytes: 1, 2, or 4.
        size: u8,
        /// Payload value, zero-extended.
        value: u32,
    },
    /// Hardware (DWT) source packet.
    Dwt {
        /// 5-bit discriminator identifying the DWT sub-source.
        discriminator: u8,
        /// Payload size in bytes: 1, 2, or 4.
        size: u8,
        /// Payload value, zero-extended.
        value: u32,
    },
    /// Local timestamp packet.
    TsLocal {
        /// Timing-control bits (0 for the single-byte short form).
        tc: u8,
        /// Raw timestamp delta value, 7 bits per continuation byte.
        value: u32,
    },
    /// Global timestamp, low half.
    TsGlobal1 {
        /// Raw low-half timestamp bits.
        value: u32,
        /// Whether the local oscillator clock changed since the last GTS.
        clkch: bool,
    },
    /// Global timestamp, high half.
    TsGlobal2 {
        /// Raw high-half timestamp bits.
        value: u32,
    },
    /// Extension packet (source identification beyond the stimulus ports).
    Extension {
        /// Selects the SW/HW source space the extension bits apply to.
        sh: bool,
        /// Extension payload bits, 7 bits per continuation byte.
        value: u32,
    },
    /// A header value the protocol reserves.
    Reserved {
        /// The offending header byte.
        header: u8,
    },
}

fn extract_size(low_bits: u8) -> Option<u8> {
    match low_bits & 0b11 {
        0b01 => Some(1),
        0b10 => Some(2),
        0b11 => Some(4),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum PayloadKind {
    Swit { src_id: u8 },
    Dwt { discriminator: u8 },
}

#[derive(Debug, Clone, Copy)]
enum ContinuationKind {
    TsLocal { tc: u8 },
    TsGlobal1,
    TsGlobal2,
    Extension { sh: bool },
}

impl ContinuationKind {
    /// Max continuation bytes: 5 for TS/GTS1/Extension, 7 for GTS2.
    const fn limit(self) -> u8 {
        match self {
            Self::TsGlobal2 => 7,
            _ => 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ItmState {
    WaitSync {
        zero_run: u8,
    },
    Header,
    Payload {
        kind: PayloadKind,
        size: u8,
        collected: u8,
        buf: [u8; 4],
    },
    Continuation {
        kind: ContinuationKind,
        value: u32,
        shift: u32,
        consumed: u8,
    },
}

/// Pausable ITM byte-stream processor.
pub struct ItmProcessor {
    state: ItmState,
    flags: PktProcFlags,
    index: TraceIndex,
    packet_start: TraceIndex,
    raw_buf: Vec<u8>,
}

impl ItmProcessor {
    /// Build a processor with the given op-mode flags, starting in sync
    /// search.
    #[must_use]
    pub fn new(flags: PktProcFlags) -> Self {
        Self {
            state: ItmState::WaitSync { zero_run: 0 },
            flags,
            index: 0,
            packet_start: 0,
            raw_buf: Vec::new(),
        }
    }

    /// Discard all buffered state and return to sync search.
    pub fn reset(&mut self) {
        self.state = ItmState::WaitSync { zero_run: 0 };
        self.raw_buf.clear();
    }

    /// Feed bytes through the processor, emitting complete packets to
    /// `sink` (and, if attached, `raw`).
    pub fn trace_data_in(
        &mut self,
        op: OpCode<'_>,
        sink: &mut impl PacketSink<ItmPacket>,
        mut raw: Option<&mut dyn RawPacketMonitor<ItmPacket>>,
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

    fn step(&mut self, byte: u8) -> Result<Option<ItmPacket>, (BadPacketKind, ItmPacket)> {
        match self.state {
            ItmState::WaitSync { zero_run } => {
                if byte == 0x00 {
                    self.state = ItmState::WaitSync {
                        zero_run: zero_run.saturating_add(1),
                    };
                    Ok(None)
                } else if byte == 0x80 && zero_run >= 5 {
                    self.state = ItmState::Header;
                    Ok(Some(ItmPacket::Async))
                } else {
                    self.state = ItmState::WaitSync { zero_run: 0 };
                    Ok(None)
                }
            }
            ItmState::Header => self.decode_header(byte),
            ItmState::Payload {
                kind,
                size,
                mut collected,
                mut buf,
            } => {
                buf[collected as usize] = byte;
                collected += 1;
                if collected < size {
                    self.state = ItmState::Payload {
                        kind,
                        size,
                        collected,
                        buf,
                    };
                    Ok(None)
                } else {
                    self.state = ItmState::Header;
                    let value = u32::from_le_bytes(buf) & size_mask(size);
                    Ok(Some(match kind {
                        PayloadKind::Swit { src_id } => ItmPacket::Swit {
                            src_id,
                            size,
                            value,
                        },
                        PayloadKind::Dwt { discriminator } => ItmPacket::Dwt {
                            discriminator,
                            size,
                            value,
                        },
                    }))
                }
            }
            ItmState::Continuation {
                kind,
                mut value,
                shift,
                mut consumed,
            } => {
                let continues = byte & 0x80 != 0;
                value |= u32::from(byte & 0x7F) << shift;
                consumed += 1;

                if continues && consumed < kind.limit() {
                    self.state = ItmState::Continuation {
                        kind,
                        value,
                        shift: shift + 7,
                        consumed,
                    };
                    return Ok(None);
                }

                self.state = ItmState::Header;
                Ok(Some(match kind {
                    ContinuationKind::TsLocal { tc } => ItmPacket::TsLocal { tc, value },
                    ContinuationKind::TsGlobal1 => ItmPacket::TsGlobal1 {
                        value,
                        clkch: value & 1 != 0,
                    },
                    ContinuationKind::TsGlobal2 => ItmPacket::TsGlobal2 { value },
                    ContinuationKind::Extension { sh } => ItmPacket::Extension { sh, value },
                }))
            }
        }
    }

    fn decode_header(&mut self, header: u8) -> Result<Option<ItmPacket>, (BadPacketKind, ItmPacket)> {
        if header == 0x00 {
            self.state = ItmState::WaitSync { zero_run: 1 };
            return Ok(None);
        }
        if header == 0x70 {
            return Ok(Some(ItmPacket::Overflow));
        }

        let low = header & 0b11;
        let nibble = header & 0x0F;

        if nibble == 0x00 {
            return if header & 0x80 == 0 {
                let delta = (header >> 4) & 0x7;
                Ok(Some(ItmPacket::TsLocal {
                    tc: 0,
                    value: u32::from(delta),
                }))
            } else if header & 0xC0 == 0xC0 {
                let tc = (header >> 4) & 0x3;
                self.state = ItmState::Continuation {
                    kind: ContinuationKind::TsLocal { tc },
                    value: 0,
                    shift: 0,
                    consumed: 0,
                };
                Ok(None)
            } else {
                Err((BadPacketKind::Reserved, ItmPacket::Reserved { header }))
            };
        }

        if nibble == 0x08 {
            let sh = header & 0x10 != 0;
            self.state = ItmState::Continuation {
                kind: ContinuationKind::Extension { sh },
                value: 0,
                shift: 0,
                consumed: 0,
            };
            return Ok(None);
        }

        if nibble == 0x04 {
            if header & 0xC0 == 0x80 {
                let kind = if header & 0x20 == 0 {
                    ContinuationKind::TsGlobal1
                } else {
                    ContinuationKind::TsGlobal2
                };
                self.state = ItmState::Continuation {
                    kind,
                    value: 0,
                    shift: 0,
                    consumed: 0,
                };
                return Ok(None);
            }
            return Err((BadPacketKind::Reserved, ItmPacket::Reserved { header }));
        }

        let Some(size) = extract_size(low) else {
            return Err((BadPacketKind::Reserved, ItmPacket::Reserved { header }));
        };

        let discriminator = header >> 3;
        let kind = if header & 0b100 != 0 {
            PayloadKind::Dwt { discriminator }
        } else {
            PayloadKind::Swit { src_id: discriminator }
        };
        self.state = ItmState::Payload {
            kind,
            size,
            collected: 0,
            buf: [0; 4],
        };
        Ok(None)
    }
}

const fn size_mask(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Collector(Vec<ItmPacket>);

    impl PacketSink<ItmPacket> for Collector {
        type Error = core::convert::Infallible;
        fn on_packet(
            &mut self,
            _index_sop: TraceIndex,
            packet: &ItmPacket,
            _bad: Option<BadPacketKind>,
        ) -> Result<DatapathResponse, Self::Error> {
            self.0.push(*packet);
            Ok(DatapathResponse::Cont)
        }
    }

    #[test]
    fn async_swit_overflow() {
        // Async, SWIT(srcID=3, size=1, value=0xAA), Overflow.
        let input = [0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x19, 0xAA, 0x70];
        let mut proc = ItmProcessor::new(PktProcFlags::PKTPROC_COMMON);
        let mut collector = Collector(Vec::new());
        let (used, resp) = proc.trace_data_in(OpCode::Data(&input), &mut collector, None);
        assert_eq!(used, input.len());
        assert_eq!(resp, DatapathResponse::Cont);
        assert_eq!(
            collector.0,
            alloc::vec![
                ItmPacket::Async,
                ItmPacket::Swit {
                    src_id: 3,
                    size: 1,
                    value: 0xAA,
                },
                ItmPacket::Overflow,
            ]
        );
    }

    #[test]
    fn determinism_under_arbitrary_partition() {
        let input = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x19, 0xAA, 0x70, 0x09, 0x01, 0x02,
        ];
        let mut whole = ItmProcessor::new(PktProcFlags::PKTPROC_COMMON);
        let mut whole_out = Collector(Vec::new());
        whole.trace_data_in(OpCode::Data(&input), &mut whole_out, None);

        let mut split = ItmProcessor::new(PktProcFlags::PKTPROC_COMMON);
        let mut split_out = Collector(Vec::new());
        for byte in input {
            split.trace_data_in(OpCode::Data(&[byte]), &mut split_out, None);
        }

        assert_eq!(whole_out.0, split_out.0);
    }
}
