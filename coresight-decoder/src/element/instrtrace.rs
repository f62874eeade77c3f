//! PTM/ETMv3 element decoder and the A32/T32 waypoint stepper that
//! backs it.
//!
//! No disassembler crate appears anywhere in the corpus this workspace draws
//! from, so address-range stepping is hand-rolled here: a small classifier
//! table over the instruction encodings that can end a range (branches,
//! calls, exception returns) rather than a full decode of every mnemonic.

use alloc::vec::Vec;

use crate::element::{LastInstrKind, NoSyncReason, PeContext, TraceElement};
use crate::index::CSTraceID;
use crate::memory::{MemoryAccessMap, MemorySpace};
use crate::packet::ptm::{Isa, PtmPacket};
use crate::packet::BadPacketKind;

/// Classification of the instruction a waypoint search landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waypoint {
    /// Direct branch (B, Bcc, T32 B/Bcc): next address comes from the
    /// packet stream's branch-address packet.
    DirectBranch { len: u8 },
    /// Branch-and-link (BL, BLX immediate): same as a direct branch but
    /// classified `BranchLink` in the element.
    BranchLink { len: u8 },
    /// Indirect branch (BX, BLX register, MOV PC, LDR PC, POP {..,PC}):
    /// the target is unknown until the packet stream says otherwise.
    IndirectBranch { len: u8 },
    /// Instruction that is architecturally defined to change ISA (BX,
    /// BLX) vs one that cannot.
    ExceptionReturn { len: u8 },
}

/// Step forward from `addr` in `isa` looking for the next instruction that
/// would require a waypoint (branch, call, or exception return), reading
/// code bytes through `mem`.
///
/// Returns `(end_addr_exclusive, waypoint)` on success. `Ok(None)` means the
/// memory accessor ran out of data before a waypoint was found (the caller
/// should emit `AddrNacc` and wait for more packets); `Err(())` is returned
/// if no accessor covers `addr` at all.
fn step_to_waypoint(
    mem: &mut MemoryAccessMap<'_>,
    cs_id: CSTraceID,
    start: u64,
    isa: Isa,
) -> Result<Option<(u64, Waypoint)>, ()> {
    let mut addr = start;
    let step = if isa == Isa::Thumb { 2 } else { 4 };
    // Bound the search so a corrupted stream with no real waypoints can't
    // spin forever; CoreSight implementations cap this similarly via the
    // max atom/P-header run length.
    for _ in 0..4096 {
        let mut buf = [0u8; 4];
        let want = if isa == Isa::Thumb { 2 } else { 4 };
        let read = match mem.read_target_memory(addr, cs_id, MemorySpace::ANY, want, &mut buf[..want]) {
            Ok(outcome) => outcome.read_bytes,
            Err(_) => return Err(()),
        };
        if read < want {
            return Ok(None);
        }

        if let Some(waypoint) = classify(isa, &buf[..want]) {
            let len = match waypoint {
                Waypoint::DirectBranch { len }
                | Waypoint::BranchLink { len }
                | Waypoint::IndirectBranch { len }
                | Waypoint::ExceptionReturn { len } => len,
            };
            return Ok(Some((addr + u64::from(len), waypoint)));
        }

        addr += step;
    }
    Ok(None)
}

/// Classify one instruction encoding as a waypoint, or `None` if execution
/// simply continues to the next one.
fn classify(isa: Isa, bytes: &[u8]) -> Option<Waypoint> {
    match isa {
        Isa::Arm => classify_a32(u32::from_le_bytes(bytes.try_into().ok()?)),
        Isa::Thumb => {
            if bytes.len() < 2 {
                return None;
            }
            let half = u16::from_le_bytes([bytes[0], bytes[1]]);
            classify_t32(half)
        }
    }
}

fn classify_a32(insn: u32) -> Option<Waypoint> {
    let cond = (insn >> 28) & 0xF;
    if cond == 0xF {
        // Unconditional extension space (BLX immediate).
        if insn >> 25 == 0b1111_101 {
            return Some(Waypoint::BranchLink { len: 4 });
        }
        return None;
    }

    // B/BL: cond 101L imm24.
    if insn >> 25 == 0b101 {
        let link = insn & (1 << 24) != 0;
        return Some(if link {
            Waypoint::BranchLink { len: 4 }
        } else {
            Waypoint::DirectBranch { len: 4 }
        });
    }

    // BX/BLX (register): cond 0001 0010 1111 1111 1111 00L1 Rm.
    if insn & 0x0FFF_FFD0 == 0x012F_FF10 {
        let link = insn & (1 << 5) != 0;
        return Some(if link {
            Waypoint::IndirectBranch { len: 4 }
        } else {
            Waypoint::ExceptionReturn { len: 4 }
        });
    }

    // LDM with PC in the register list and writeback: treated as an
    // indirect branch/possible exception return (e.g. POP {..,PC} ARM
    // encoding, or exception-return LDM forms which also set bit 22).
    let is_ldm = insn & 0x0E10_0000 == 0x0810_0000;
    if is_ldm && insn & (1 << 15) != 0 {
        let exception_return = insn & (1 << 22) != 0;
        return Some(if exception_return {
            Waypoint::ExceptionReturn { len: 4 }
        } else {
            Waypoint::IndirectBranch { len: 4 }
        });
    }

    // MOV PC, Rn / data-processing with Rd == PC.
    let is_dp = insn & 0x0C00_0000 == 0x0000_0000;
    if is_dp && (insn >> 12) & 0xF == 0xF {
        return Some(Waypoint::IndirectBranch { len: 4 });
    }

    None
}

fn classify_t32(half: u16) -> Option<Waypoint> {
    // T1 unconditional branch: 11100 imm11.
    if half >> 11 == 0b11100 {
        return Some(Waypoint::DirectBranch { len: 2 });
    }
    // T1 conditional branch: 1101 cond imm8 (cond != 1110/1111).
    if half >> 12 == 0b1101 {
        let cond = (half >> 8) & 0xF;
        if cond < 0xE {
            return Some(Waypoint::DirectBranch { len: 2 });
        }
    }
    // BX/BLX (register), T1: 010001110 Rm / 010001111 Rm.
    if half >> 7 == 0b0100_0111 {
        let link = half & (1 << 7) != 0;
        return Some(if link {
            Waypoint::IndirectBranch { len: 2 }
        } else {
            Waypoint::ExceptionReturn { len: 2 }
        });
    }
    // POP {..,PC}, T1: 1011110 1 reglist (bit 8 set means PC included).
    if half >> 9 == 0b1011_110 && half & (1 << 8) != 0 {
        return Some(Waypoint::IndirectBranch { len: 2 });
    }
    // 32-bit T32 prefixes (BL/BLX immediate, B.W): first halfword
    // 11110xxxxxxxxxxx, treated here as a 4-byte waypoint since the second
    // halfword carries no further control-flow information we need to
    // inspect.
    if half >> 11 == 0b11110 {
        return Some(Waypoint::BranchLink { len: 4 });
    }
    None
}

/// PTM/ETMv3 packet → element decoder.
pub struct PtmElementDecoder {
    sync: SyncState,
    pc: Option<u64>,
    ctx: PeContext,
    pending_atom: Option<(u8, u8)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    NoSync,
    WaitSync,
    DecodePackets,
}

impl PtmElementDecoder {
    /// Build a decoder starting in `NoSync`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sync: SyncState::NoSync,
            pc: None,
            ctx: PeContext::default(),
            pending_atom: None,
        }
    }

    /// Discard accumulated PE state and return to `NoSync` (RESET op code).
    pub fn reset(&mut self) {
        self.sync = SyncState::NoSync;
        self.pc = None;
        self.pending_atom = None;
    }

    /// Clean end of trace: the element for `EoTrace`.
    #[must_use]
    pub fn eot_element(&self) -> TraceElement {
        TraceElement::EoTrace
    }

    /// Feed one packet through the element decoder, stepping through
    /// instruction ranges via `mem` whenever an atom bit needs a waypoint,
    /// and appending every element it produces to `out`. Runs exactly once
    /// per packet — a caller retrying delivery after `WAIT` must replay the
    /// elements already pushed here, never call this again for the packet.
    pub fn on_packet(
        &mut self,
        cs_id: CSTraceID,
        packet: &PtmPacket,
        bad: Option<BadPacketKind>,
        mem: &mut MemoryAccessMap<'_>,
        out: &mut Vec<TraceElement>,
    ) {
        if self.sync == SyncState::NoSync {
            out.push(TraceElement::NoSync(NoSyncReason::Init));
            self.sync = SyncState::WaitSync;
        }

        if bad.is_some() {
            self.sync = SyncState::WaitSync;
            self.pc = None;
            out.push(TraceElement::NoSync(NoSyncReason::BadPacket));
            return;
        }

        match packet {
            PtmPacket::ASync => {
                self.sync = SyncState::DecodePackets;
                out.push(TraceElement::TraceOn);
            }
            PtmPacket::ISync { address, isa, .. } if self.sync == SyncState::DecodePackets => {
                self.pc = Some(u64::from(*address));
                self.ctx.isa = *isa;
                out.push(TraceElement::PeContext(self.ctx));
            }
            PtmPacket::ContextId { value } if self.sync == SyncState::DecodePackets => {
                self.ctx.context_id = Some(*value);
                out.push(TraceElement::PeContext(self.ctx));
            }
            PtmPacket::Vmid { value } if self.sync == SyncState::DecodePackets => {
                self.ctx.vmid = Some(*value);
                out.push(TraceElement::PeContext(self.ctx));
            }
            PtmPacket::BranchAddress {
                address,
                isa,
                exception,
            } if self.sync == SyncState::DecodePackets => {
                let target = u64::from(*address);
                self.ctx.isa = *isa;
                self.pc = Some(target);
                if *exception {
                    out.push(TraceElement::ExceptionRet);
                } else {
                    out.push(TraceElement::AddrUnknown(target));
                }
            }
            PtmPacket::Atom { bits, valid_bits } if self.sync == SyncState::DecodePackets => {
                self.step_atoms(cs_id, *bits, *valid_bits, mem, out);
            }
            PtmPacket::Exception { number } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::Exception { number: *number });
            }
            PtmPacket::ExceptionReturn if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::ExceptionRet);
            }
            PtmPacket::Timestamp { value } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::Timestamp(*value));
            }
            PtmPacket::CycleCount { value } if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::CycleCount(*value));
            }
            PtmPacket::Trigger if self.sync == SyncState::DecodePackets => {
                out.push(TraceElement::Event);
            }
            _ => {}
        }
    }

    /// Walk the bits of one atom packet (MSB-first), stepping to a waypoint
    /// for each and pushing the resulting `InstrRange` to `out`.
    fn step_atoms(
        &mut self,
        cs_id: CSTraceID,
        bits: u8,
        valid_bits: u8,
        mem: &mut MemoryAccessMap<'_>,
        out: &mut Vec<TraceElement>,
    ) {
        for i in (0..valid_bits).rev() {
            let taken = (bits >> i) & 1 != 0;
            let Some(pc) = self.pc else {
                out.push(TraceElement::NoSync(NoSyncReason::BadPacket));
                continue;
            };

            match step_to_waypoint(mem, cs_id, pc, self.ctx.isa) {
                Err(()) => {
                    out.push(TraceElement::AddrNacc(pc));
                    return;
                }
                Ok(None) => {
                    out.push(TraceElement::AddrNacc(pc));
                    return;
                }
                Ok(Some((end_addr, waypoint))) => {
                    let last_instr = match waypoint {
                        Waypoint::DirectBranch { .. } => LastInstrKind::Branch,
                        Waypoint::BranchLink { .. } => LastInstrKind::BranchLink,
                        Waypoint::IndirectBranch { .. } if !taken => LastInstrKind::Other,
                        Waypoint::IndirectBranch { .. } => LastInstrKind::Branch,
                        Waypoint::ExceptionReturn { .. } => LastInstrKind::ExceptionReturn,
                    };
                    out.push(TraceElement::InstrRange {
                        start_addr: pc,
                        end_addr,
                        isa: self.ctx.isa,
                        last_instr,
                    });

                    // A taken branch's destination is only known once the
                    // packet stream supplies a branch-address packet; an
                    // untaken atom just continues past the waypoint.
                    self.pc = if taken { None } else { Some(end_addr) };
                }
            }
        }
    }
}

impl Default for PtmElementDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_arm_direct_branch() {
        // B +8 (cond=AL, link=0): 0xEA000002
        let insn: u32 = 0xEA00_0002;
        assert_eq!(
            classify_a32(insn),
            Some(Waypoint::DirectBranch { len: 4 })
        );
    }

    #[test]
    fn classifies_arm_bx_lr_as_exception_return() {
        // BX LR: 0xE12FFF1E
        let insn: u32 = 0xE12F_FF1E;
        assert_eq!(
            classify_a32(insn),
            Some(Waypoint::ExceptionReturn { len: 4 })
        );
    }

    #[test]
    fn isync_then_atom_emits_instr_range() {
        let mut decoder = PtmElementDecoder::new();
        let cs_id = CSTraceID::new(1).unwrap();
        let mut out = Vec::new();

        decoder.on_packet(cs_id, &PtmPacket::ASync, None, &mut MemoryAccessMap::new(), &mut out);

        let mut code = [0u8; 8];
        code[4..8].copy_from_slice(&0xEA00_0000u32.to_le_bytes());
        let mut mem = MemoryAccessMap::new();
        mem.add_accessor(
            crate::memory::Accessor::buffer(0x1000, 0x1007, MemorySpace::ANY, &code).unwrap(),
        )
        .unwrap();

        decoder.on_packet(
            cs_id,
            &PtmPacket::ISync {
                address: 0x1000,
                isa: Isa::Arm,
                cycle_count: None,
            },
            None,
            &mut mem,
            &mut out,
        );

        decoder.on_packet(
            cs_id,
            &PtmPacket::Atom {
                bits: 0b1,
                valid_bits: 1,
            },
            None,
            &mut mem,
            &mut out,
        );

        let found = out.iter().any(|e| {
            matches!(
                e,
                TraceElement::InstrRange {
                    start_addr: 0x1000,
                    end_addr: 0x1008,
                    ..
                }
            )
        });
        assert!(found, "expected an InstrRange ending at the branch: {out:?}");
    }

    #[test]
    fn wait_retry_does_not_skip_or_duplicate_pc_advance() {
        // Regression: step_atoms must run exactly once per Atom packet. A
        // caller that retries delivery (WAIT/FLUSH) replays the already
        // computed elements from `out` and never calls on_packet again, so
        // self.pc only ever advances once per atom bit.
        let mut decoder = PtmElementDecoder::new();
        let cs_id = CSTraceID::new(1).unwrap();
        let mut out = Vec::new();
        decoder.on_packet(cs_id, &PtmPacket::ASync, None, &mut MemoryAccessMap::new(), &mut out);

        let mut code = [0u8; 16];
        code[4..8].copy_from_slice(&0xEA00_0000u32.to_le_bytes());
        code[12..16].copy_from_slice(&0xEA00_0000u32.to_le_bytes());
        let mut mem = MemoryAccessMap::new();
        mem.add_accessor(
            crate::memory::Accessor::buffer(0x1000, 0x100F, MemorySpace::ANY, &code).unwrap(),
        )
        .unwrap();

        decoder.on_packet(
            cs_id,
            &PtmPacket::ISync {
                address: 0x1000,
                isa: Isa::Arm,
                cycle_count: None,
            },
            None,
            &mut mem,
            &mut out,
        );
        decoder.on_packet(
            cs_id,
            &PtmPacket::BranchAddress {
                address: 0x1008,
                isa: Isa::Arm,
                exception: false,
            },
            None,
            &mut mem,
            &mut out,
        );

        out.clear();
        decoder.on_packet(
            cs_id,
            &PtmPacket::Atom {
                bits: 0b1,
                valid_bits: 1,
            },
            None,
            &mut mem,
            &mut out,
        );

        let ranges: Vec<_> = out
            .iter()
            .filter(|e| matches!(e, TraceElement::InstrRange { .. }))
            .collect();
        assert_eq!(ranges.len(), 1, "exactly one InstrRange per atom bit, got {ranges:?}");
    }
}
