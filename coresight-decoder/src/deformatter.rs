//! Component C: the CoreSight frame deformatter.

use alloc::vec::Vec;

use crate::datapath::{DatapathResponse, DeformatterFlags};
use crate::index::CSTraceID;

/// Tag attached to a raw frame observed by a [`RawFrameSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    /// A normal 16-byte packed frame.
    Packed,
    /// An FSYNC pattern was consumed.
    FSync,
    /// A half-sync word was consumed.
    HSync,
    /// Demultiplexed per-ID data (mirrors what was just sent to the ID sink).
    IdData,
}

/// Optional observer of raw frame bytes, attached independently of the
/// per-ID data sink.
pub trait RawFrameSink {
    /// Called for every frame-level event the deformatter processes.
    fn on_raw_frame(&mut self, tag: FrameTag, bytes: &[u8], cs_id: Option<CSTraceID>);
}

/// Receives demultiplexed per-ID byte spans, in the order the deformatter
/// produced them.
pub trait IdDataSink {
    /// `bytes` are additional raw bytes for `cs_id`, to be fed to that ID's
    /// packet processor.
    fn on_id_data(&mut self, cs_id: CSTraceID, bytes: &[u8]) -> DatapathResponse;
}

const FSYNC_PATTERN: [u8; 4] = [0xFF, 0xFF, 0xFF, 0x7F];
const FRAME_LEN: usize = 16;

/// Demultiplexes a 16-byte CoreSight frame stream into per-source byte
/// streams.
///
/// Frames may be split across multiple `trace_data_in` calls at any byte
/// boundary; partial frame bytes are buffered internally so that decoding is
/// independent of how the caller chunks its input.
pub struct Deformatter {
    flags: DeformatterFlags,
    current_id: CSTraceID,
    partial_frame: Vec<u8>,
    consecutive_fsyncs: u32,
}

impl Deformatter {
    /// Build a deformatter configured with the given flags.
    #[must_use]
    pub fn new(flags: DeformatterFlags) -> Self {
        Self {
            flags,
            current_id: CSTraceID::UNKNOWN,
            partial_frame: Vec::with_capacity(FRAME_LEN),
            consecutive_fsyncs: 0,
        }
    }

    /// Reconfigure the deformatter's alignment mode flags.
    pub fn configure(&mut self, flags: DeformatterFlags) {
        self.flags = flags;
    }

    /// Discard all buffered partial-frame state.
    pub fn reset(&mut self) {
        self.partial_frame.clear();
        self.current_id = CSTraceID::UNKNOWN;
        self.consecutive_fsyncs = 0;
    }

    /// Feed new bytes through the deformatter, demultiplexing complete
    /// frames into `sink` as they become available.
    ///
    /// Returns the number of input bytes consumed and the worst response
    /// observed from `sink`.
    pub fn trace_data_in(
        &mut self,
        bytes: &[u8],
        sink: &mut impl IdDataSink,
        raw: Option<&mut dyn RawFrameSink>,
    ) -> (usize, DatapathResponse) {
        let mut raw = raw;
        let mut used = 0;
        let mut worst = DatapathResponse::Cont;

        let mut cursor = bytes;
        while !cursor.is_empty() {
            if self.flags.contains(DeformatterFlags::HAS_FSYNC)
                && self.partial_frame.is_empty()
                && cursor.len() >= FSYNC_PATTERN.len()
                && cursor[..FSYNC_PATTERN.len()] == FSYNC_PATTERN
            {
                if let Some(raw) = raw.as_deref_mut() {
                    raw.on_raw_frame(FrameTag::FSync, &cursor[..FSYNC_PATTERN.len()], None);
                }
                self.consecutive_fsyncs += 1;
                if self.consecutive_fsyncs >= 4 {
                    self.reset();
                }
                cursor = &cursor[FSYNC_PATTERN.len()..];
                used += FSYNC_PATTERN.len();
                continue;
            }
            self.consecutive_fsyncs = 0;

            let needed = FRAME_LEN - self.partial_frame.len();
            let take = needed.min(cursor.len());
            self.partial_frame.extend_from_slice(&cursor[..take]);
            cursor = &cursor[take..];
            used += take;

            if self.partial_frame.len() < FRAME_LEN {
                break;
            }

            let frame: [u8; FRAME_LEN] = self.partial_frame[..FRAME_LEN]
                .try_into()
                .expect("buffered exactly FRAME_LEN bytes");
            self.partial_frame.clear();

            if let Some(raw) = raw.as_deref_mut() {
                raw.on_raw_frame(FrameTag::Packed, &frame, None);
            }
            worst = worst.combine(self.demux_frame(&frame, sink, raw.as_deref_mut()));
        }

        (used, worst)
    }

    /// Flush: any bytes buffered below a full frame are only ever visible to
    /// a raw observer, never emitted as data.
    pub fn flush_incomplete(&mut self, raw: Option<&mut dyn RawFrameSink>) {
        if !self.partial_frame.is_empty() {
            if let Some(raw) = raw {
                raw.on_raw_frame(FrameTag::Packed, &self.partial_frame, None);
            }
            self.partial_frame.clear();
        }
    }

    fn demux_frame(
        &mut self,
        frame: &[u8; FRAME_LEN],
        sink: &mut impl IdDataSink,
        mut raw: Option<&mut dyn RawFrameSink>,
    ) -> DatapathResponse {
        let aux = frame[15];
        let mut worst = DatapathResponse::Cont;

        for slot in 0..8 {
            let even = frame[slot * 2];
            let aux_bit = (aux >> slot) & 1;

            if even & 1 == 1 {
                self.current_id = CSTraceID::new_unchecked(even >> 1);
            } else {
                let recovered = [even & !1 | aux_bit];
                worst = worst.combine(self.emit(&recovered, sink, raw.as_deref_mut()));
            }

            if slot < 7 {
                let odd = frame[slot * 2 + 1];
                worst = worst.combine(self.emit(&[odd], sink, raw.as_deref_mut()));
            }
        }

        worst
    }

    fn emit(
        &self,
        bytes: &[u8],
        sink: &mut impl IdDataSink,
        raw: Option<&mut dyn RawFrameSink>,
    ) -> DatapathResponse {
        if let Some(raw) = raw {
            raw.on_raw_frame(FrameTag::IdData, bytes, Some(self.current_id));
        }
        sink.on_id_data(self.current_id, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Collector(Vec<(CSTraceID, Vec<u8>)>);

    impl IdDataSink for Collector {
        fn on_id_data(&mut self, cs_id: CSTraceID, bytes: &[u8]) -> DatapathResponse {
            self.0.push((cs_id, bytes.to_vec()));
            DatapathResponse::Cont
        }
    }

    #[test]
    fn single_frame_recovers_aux_bit() {
        let frame: [u8; 16] = [
            0x21, 0xAA, 0xBA, 0xCC, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x02,
        ];
        let mut deformatter = Deformatter::new(DeformatterFlags::MEM_ALIGN);
        let mut collector = Collector(Vec::new());
        let (used, resp) = deformatter.trace_data_in(&frame, &mut collector, None);
        assert_eq!(used, 16);
        assert_eq!(resp, DatapathResponse::Cont);

        let id = CSTraceID::new(0x10).unwrap();
        let bytes: Vec<u8> = collector
            .0
            .iter()
            .flat_map(|(got_id, chunk)| {
                assert_eq!(*got_id, id);
                chunk.clone()
            })
            .collect();
        assert_eq!(
            bytes,
            alloc::vec![
                0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn partial_frame_spans_calls() {
        let frame: [u8; 16] = [
            0x21, 0xAA, 0xBA, 0xCC, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x02,
        ];
        let mut deformatter = Deformatter::new(DeformatterFlags::MEM_ALIGN);
        let mut collector = Collector(Vec::new());
        let (used1, _) = deformatter.trace_data_in(&frame[..5], &mut collector, None);
        assert_eq!(used1, 5);
        assert!(collector.0.is_empty());
        let (used2, _) = deformatter.trace_data_in(&frame[5..], &mut collector, None);
        assert_eq!(used2, 11);
        assert!(!collector.0.is_empty());
    }
}
