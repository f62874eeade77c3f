//! STM (STPv2) packet processor.
//!
//! Nibble-oriented. Synchronisation is 21 consecutive `0xF` nibbles followed
//! by `0x0`. Ordinary packets are classified through three escape tables:
//! `op1N` (first nibble), `op2N` (second nibble, reached only when
//! `op1N == 0xF`), `op3N` (third nibble, reached only when `op1N == 0xF` and
//! `op2N == 0x0`). Nibbles within a byte arrive high-nibble-first.

use alloc::vec::Vec;

use crate::datapath::{DatapathResponse, OpCode, PktProcFlags};
use crate::index::TraceIndex;
use crate::packet::{
    BadPacketAction, BadPacketKind, PacketSink, RawPacketMonitor, StepResult,
    resolve_bad_packet_action,
};

/// How a `Version` packet says timestamp nibbles should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TsEncoding {
    /// Nibbles are the natural binary timestamp value.
    NatBinary,
    /// Nibbles are Gray-coded; the decoder converts to binary on extraction.
    Grey,
}

/// A decoded STM packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StmPacket {
    /// Explicit no-op, used as channel-select padding.
    Null,
    /// Legacy single-byte marker packet.
    M8 {
        /// Payload byte.
        data: u8,
    },
    /// Master error marker.
    Merr,
    /// Global error marker.
    Gerr,
    /// Select the active channel by an 8-bit index.
    C8 {
        /// New channel index.
        channel: u8,
    },
    /// Select the active channel by a 16-bit index.
    C16 {
        /// New channel index.
        channel: u16,
    },
    /// Data packet, one of the D4/D8/D16/D32/D64 sizes.
    Data {
        /// Payload width in bits: 4, 8, 16, 32, or 64.
        width: u8,
        /// Zero-extended payload value.
        value: u64,
        /// Whether the M (marker) suffix was present.
        marker: bool,
        /// Timestamp attached to this packet, if the TS suffix was present.
        timestamp: Option<u64>,
    },
    /// Protocol version / timestamp-encoding negotiation.
    Version {
        /// Timestamp nibble interpretation going forward.
        encoding: TsEncoding,
    },
    /// Trigger event marker.
    Trigger,
    /// Frequency report.
    Freq {
        /// Reported frequency value.
        value: u32,
    },
    /// Flag packet (explicit synchronisation point within a channel).
    Flag,
    /// Synchronisation packet (21 `0xF` nibbles + `0x0`).
    Async,
    /// A header nibble sequence the protocol reserves.
    Reserved {
        /// Offending leading nibbles, most significant first.
        nibbles: alloc::vec::Vec<u8>,
    },
}

fn gray_to_binary(value: u64) -> u64 {
    let mut binary = value;
    let mut shift = 1;
    while shift < u64::BITS as usize {
        binary ^= binary >> shift;
        shift <<= 1;
    }
    binary
}

fn data_width(op2n: u8) -> Option<(u8, bool, bool)> {
    // (width, marker, ts) keyed by op2N, this module's own consistent
    // assignment.
    match op2n {
        0x1 => Some((8, false, false)),
        0x2 => Some((8, true, false)),
        0x3 => Some((8, false, true)),
        0x8 => Some((8, true, true)),
        0x4 => Some((16, false, false)),
        0x5 => Some((16, true, false)),
        0x6 => Some((16, false, true)),
        0x9 => Some((16, true, true)),
        0xA => Some((32, false, false)),
        0xB => Some((32, true, false)),
        0xC => Some((32, false, true)),
        0xD => Some((32, true, true)),
        0xE => Some((64, false, false)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum Op1 {
    Null,
    D4 { marker: bool },
    C8,
    C16,
    Escape,
    Reserved,
}

fn classify_op1(op1n: u8) -> Op1 {
    match op1n {
        0x0 => Op1::Null,
        0x1 => Op1::D4 { marker: false },
        0x2 => Op1::D4 { marker: true },
        0x3 => Op1::C8,
        0x4 => Op1::C16,
        0xF => Op1::Escape,
        _ => Op1::Reserved,
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingKind {
    M8,
    C8,
    C16High,
    Data { width: u8, marker: bool, ts: bool },
}

#[derive(Debug, Clone, Copy)]
enum StmState {
    Sync { run: u32 },
    Header,
    /// Saw `op1N == 0xF`, waiting for `op2N`.
    SawEscape,
    /// Saw `op1N == 0xF, op2N == 0x0`, waiting for `op3N`.
    SawDoubleEscape,
    Payload {
        kind: PendingKind,
        nibbles_needed: u8,
        collected: u8,
        value: u64,
    },
    TsLength {
        kind: PendingKind,
        value: u64,
    },
    TsValue {
        kind: PendingKind,
        value: u64,
        ts_nibbles_needed: u8,
        ts_collected: u8,
        ts_value: u64,
    },
}

/// Pausable STM nibble-stream processor.
pub struct StmProcessor {
    state: StmState,
    flags: PktProcFlags,
    encoding: TsEncoding,
    index: TraceIndex,
    packet_start: TraceIndex,
    raw_buf: Vec<u8>,
}

impl StmProcessor {
    /// Build a processor with the given op-mode flags, starting in sync
    /// search.
    #[must_use]
    pub fn new(flags: PktProcFlags) -> Self {
        Self {
            state: StmState::Sync { run: 0 },
            flags,
            encoding: TsEncoding::NatBinary,
            index: 0,
            packet_start: 0,
            raw_buf: Vec::new(),
        }
    }

    /// Discard all buffered state and return to sync search.
    pub fn reset(&mut self) {
        self.state = StmState::Sync { run: 0 };
        self.raw_buf.clear();
    }

    /// Feed bytes (each split into two nibbles, high first) through the
    /// processor, emitting complete packets to `sink` (and, if attached,
    /// `raw`).
    pub fn trace_data_in(
        &mut self,
        op: OpCode<'_>,
        sink: &mut impl PacketSink<StmPacket>,
        mut raw: Option<&mut dyn RawPacketMonitor<StmPacket>>,
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
            for nibble in [byte >> 4, byte & 0x0F] {
                if self.raw_buf.is_empty() {
                    self.packet_start = self.index;
                }
                match self.step(nibble) {
                    Ok(Some(packet)) => {
                        self.raw_buf.push(nibble);
                        if let Some(raw) = raw.as_deref_mut() {
                            raw.on_raw_packet(self.packet_start, &packet, &self.raw_buf);
                        }
                        self.raw_buf.clear();
                        match sink.on_packet(self.packet_start, &packet, None) {
                            Ok(resp) => worst = worst.combine(resp),
                            Err(_) => worst = worst.combine(DatapathResponse::FatalSysErr),
                        }
                    }
                    Ok(None) => {
                        self.raw_buf.push(nibble);
                    }
                    Err((bad, packet)) => {
                        self.raw_buf.push(nibble);
                        self.raw_buf.clear();
                        match resolve_bad_packet_action(self.flags) {
                            BadPacketAction::Fatal => {
                                worst = worst.combine(DatapathResponse::FatalInvalidData);
                            }
                            action => {
                                if let Ok(resp) =
                                    sink.on_packet(self.packet_start, &packet, Some(bad))
                                {
                                    worst = worst.combine(resp);
                                }
                                if matches!(action, BadPacketAction::EmitAndResync) {
                                    self.reset();
                                }
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

    fn step(&mut self, nibble: u8) -> Result<Option<StmPacket>, (BadPacketKind, StmPacket)> {
        match self.state {
            StmState::Sync { run } => {
                if nibble == 0xF {
                    self.state = StmState::Sync {
                        run: run.saturating_add(1),
                    };
                    Ok(None)
                } else if nibble == 0x0 && run >= 21 {
                    self.state = StmState::Header;
                    Ok(Some(StmPacket::Async))
                } else {
                    self.state = StmState::Sync { run: 0 };
                    Ok(None)
                }
            }
            StmState::Header => match classify_op1(nibble) {
                Op1::Null => Ok(Some(StmPacket::Null)),
                Op1::D4 { marker } => {
                    self.state = StmState::Payload {
                        kind: PendingKind::Data {
                            width: 4,
                            marker,
                            ts: false,
                        },
                        nibbles_needed: 1,
                        collected: 0,
                        value: 0,
                    };
                    Ok(None)
                }
                Op1::C8 => {
                    self.state = StmState::Payload {
                        kind: PendingKind::C8,
                        nibbles_needed: 2,
                        collected: 0,
                        value: 0,
                    };
                    Ok(None)
                }
                Op1::C16 => {
                    self.state = StmState::Payload {
                        kind: PendingKind::C16High,
                        nibbles_needed: 4,
                        collected: 0,
                        value: 0,
                    };
                    Ok(None)
                }
                Op1::Escape => {
                    self.state = StmState::SawEscape;
                    Ok(None)
                }
                Op1::Reserved => {
                    let packet = StmPacket::Reserved {
                        nibbles: alloc::vec![nibble],
                    };
                    Err((BadPacketKind::Reserved, packet))
                }
            },
            StmState::SawEscape => {
                if nibble == 0x0 {
                    self.state = StmState::SawDoubleEscape;
                    return Ok(None);
                }
                if let Some((width, marker, ts)) = data_width(nibble) {
                    self.state = StmState::Payload {
                        kind: PendingKind::Data { width, marker, ts },
                        nibbles_needed: width / 4,
                        collected: 0,
                        value: 0,
                    };
                    return Ok(None);
                }
                if nibble == 0x7 {
                    self.state = StmState::Payload {
                        kind: PendingKind::M8,
                        nibbles_needed: 2,
                        collected: 0,
                        value: 0,
                    };
                    return Ok(None);
                }
                let packet = StmPacket::Reserved {
                    nibbles: alloc::vec![0xF, nibble],
                };
                self.state = StmState::Header;
                Err((BadPacketKind::Reserved, packet))
            }
            StmState::SawDoubleEscape => {
                self.state = StmState::Header;
                match nibble {
                    0x0 => Ok(Some(StmPacket::Version {
                        encoding: TsEncoding::NatBinary,
                    })),
                    0x1 => {
                        self.encoding = TsEncoding::Grey;
                        Ok(Some(StmPacket::Version {
                            encoding: TsEncoding::Grey,
                        }))
                    }
                    0x2 => Ok(Some(StmPacket::Trigger)),
                    0x3 => Ok(Some(StmPacket::Gerr)),
                    0x4 => Ok(Some(StmPacket::Merr)),
                    0x5 => Ok(Some(StmPacket::Flag)),
                    0x6 => {
                        self.state = StmState::Payload {
                            kind: PendingKind::Data {
                                width: 32,
                                marker: false,
                                ts: false,
                            },
                            nibbles_needed: 8,
                            collected: 0,
                            value: 0,
                        };
                        Ok(None)
                    }
                    other => {
                        let packet = StmPacket::Reserved {
                            nibbles: alloc::vec![0xF, 0x0, other],
                        };
                        Err((BadPacketKind::Reserved, packet))
                    }
                }
            }
            StmState::Payload {
                kind,
                nibbles_needed,
                mut collected,
                mut value,
            } => {
                value = (value << 4) | u64::from(nibble);
                collected += 1;
                if collected < nibbles_needed {
                    self.state = StmState::Payload {
                        kind,
                        nibbles_needed,
                        collected,
                        value,
                    };
                    return Ok(None);
                }

                match kind {
                    PendingKind::M8 => {
                        self.state = StmState::Header;
                        Ok(Some(StmPacket::M8 {
                            data: value as u8,
                        }))
                    }
                    PendingKind::C8 => {
                        self.state = StmState::Header;
                        Ok(Some(StmPacket::C8 {
                            channel: value as u8,
                        }))
                    }
                    PendingKind::C16High => {
                        self.state = StmState::Header;
                        Ok(Some(StmPacket::C16 {
                            channel: value as u16,
                        }))
                    }
                    PendingKind::Data { width, marker, ts } => {
                        if ts {
                            self.state = StmState::TsLength { kind, value };
                            Ok(None)
                        } else {
                            self.state = StmState::Header;
                            Ok(Some(StmPacket::Data {
                                width,
                                value,
                                marker,
                                timestamp: None,
                            }))
                        }
                    }
                }
            }
            StmState::TsLength { kind, value } => {
                let ts_len = match nibble {
                    0xF => {
                        let packet = StmPacket::Reserved {
                            nibbles: alloc::vec![0xF],
                        };
                        self.state = StmState::Header;
                        return Err((BadPacketKind::BadSequence, packet));
                    }
                    0xD => 14,
                    0xE => 16,
                    n => n,
                };
                if ts_len == 0 {
                    self.state = StmState::Header;
                    return Ok(Some(Self::finish_data(kind, value, Some(0))));
                }
                self.state = StmState::TsValue {
                    kind,
                    value,
                    ts_nibbles_needed: ts_len,
                    ts_collected: 0,
                    ts_value: 0,
                };
                Ok(None)
            }
            StmState::TsValue {
                kind,
                value,
                ts_nibbles_needed,
                mut ts_collected,
                mut ts_value,
            } => {
                ts_value = (ts_value << 4) | u64::from(nibble);
                ts_collected += 1;
                if ts_collected < ts_nibbles_needed {
                    self.state = StmState::TsValue {
                        kind,
                        value,
                        ts_nibbles_needed,
                        ts_collected,
                        ts_value,
                    };
                    return Ok(None);
                }
                self.state = StmState::Header;
                let ts_value = if self.encoding == TsEncoding::Grey {
                    gray_to_binary(ts_value)
                } else {
                    ts_value
                };
                Ok(Some(Self::finish_data(kind, value, Some(ts_value))))
            }
        }
    }

    fn finish_data(kind: PendingKind, value: u64, timestamp: Option<u64>) -> StmPacket {
        match kind {
            PendingKind::Data { width, marker, .. } => StmPacket::Data {
                width,
                value,
                marker,
                timestamp,
            },
            _ => unreachable!("finish_data called for a non-data pending kind"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Collector(Vec<StmPacket>);

    impl PacketSink<StmPacket> for Collector {
        type Error = core::convert::Infallible;
        fn on_packet(
            &mut self,
            _index_sop: TraceIndex,
            packet: &StmPacket,
            _bad: Option<BadPacketKind>,
        ) -> Result<DatapathResponse, Self::Error> {
            self.0.push(packet.clone());
            Ok(DatapathResponse::Cont)
        }
    }

    fn nibbles_to_bytes(nibbles: &[u8]) -> Vec<u8> {
        nibbles
            .chunks(2)
            .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
            .collect()
    }

    #[test]
    fn sync_then_d8_marker_ts() {
        // After the 21xF+0 sync run, a D8 packet with marker and timestamp
        // suffix set, data 0x01, a one-nibble timestamp of 0x8, using this
        // module's own D8-M-TS encoding (op1N=0xF, op2N=0x8).
        let mut nibbles: Vec<u8> = alloc::vec![0xF; 21];
        nibbles.push(0x0);
        nibbles.push(0xF);
        nibbles.push(0x8);
        nibbles.push(0x0);
        nibbles.push(0x1);
        nibbles.push(0x1);
        nibbles.push(0x8);
        let input = nibbles_to_bytes(&nibbles);

        let mut proc = StmProcessor::new(PktProcFlags::PKTPROC_COMMON);
        let mut collector = Collector(Vec::new());
        proc.trace_data_in(OpCode::Data(&input), &mut collector, None);

        assert_eq!(collector.0[0], StmPacket::Async);
        assert_eq!(
            collector.0[1],
            StmPacket::Data {
                width: 8,
                value: 0x01,
                marker: true,
                timestamp: Some(0x8),
            }
        );
    }

    #[test]
    fn gray_ts_is_converted_to_binary() {
        assert_eq!(gray_to_binary(0b1011), 0b1101);
    }

    #[test]
    fn channel_select_c8_round_trips() {
        let mut nibbles: Vec<u8> = alloc::vec![0xF; 21];
        nibbles.push(0x0);
        nibbles.extend_from_slice(&[0x3, 0x2, 0xA]);
        let input = nibbles_to_bytes(&nibbles);

        let mut proc = StmProcessor::new(PktProcFlags::PKTPROC_COMMON);
        let mut collector = Collector(Vec::new());
        proc.trace_data_in(OpCode::Data(&input), &mut collector, None);
        assert_eq!(collector.0[0], StmPacket::Async);
        assert_eq!(collector.0[1], StmPacket::C8 { channel: 0x2A });
    }
}
