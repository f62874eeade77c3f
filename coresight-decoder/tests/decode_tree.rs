//! Black-box tests driving the full pipeline (deformatter/single-stream →
//! packet processor → element decoder) through [`DecodeTree`], covering the
//! properties and scenarios that a single module's unit tests can't reach on
//! their own: bad-packet recovery, backpressure, and index monotonicity
//! across the whole stack.

use coresight_decoder::element::TraceElement;
use coresight_decoder::index::{CSTraceID, TraceIndex};
use coresight_decoder::{CreateFlags, DatapathResponse, DecodeTree, ElementSink, PktProcFlags, ProtocolId, SourceType};

struct Collector(Vec<(TraceIndex, TraceElement)>);

impl ElementSink for Collector {
    type Error = core::convert::Infallible;

    fn trace_elem_in(
        &mut self,
        index_sop: TraceIndex,
        _cs_id: CSTraceID,
        elem: &TraceElement,
    ) -> Result<DatapathResponse, Self::Error> {
        self.0.push((index_sop, *elem));
        Ok(DatapathResponse::Cont)
    }
}

const ASYNC: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x80];

fn itm_tree(pkt_flags: PktProcFlags) -> DecodeTree<'static, Collector> {
    let cs_id = CSTraceID::new(0x11).unwrap();
    let mut tree = DecodeTree::new(SourceType::Single, CreateFlags::FullDecoder, Collector(Vec::new()));
    tree.create_decoder(cs_id, ProtocolId::Itm, pkt_flags).unwrap();
    tree
}

/// With `UnsyncOnBadPkts` set, a bad packet forces the packet processor back
/// into its wait-sync state; the next well-formed ASYNC resumes a fully
/// synced trace.
#[test]
fn bad_packet_then_resync_reenters_trace_on() {
    let mut tree = itm_tree(PktProcFlags::PKTPROC_COMMON | PktProcFlags::UNSYNC_ON_BAD_PKTS);

    let mut input = ASYNC.to_vec();
    // Reserved ITM header: nibble 0x0, bit 7 set, not the 0xC0 TS-local-cont
    // pattern.
    input.push(0x80);
    input.extend_from_slice(&ASYNC);

    let (used, resp) = tree.trace_data_in(&input);
    assert_eq!(used, input.len());
    assert!(!resp.is_fatal());

    let elems: Vec<_> = tree.elem_sink_mut().0.iter().map(|(_, e)| *e).collect();
    let trace_on_count = elems.iter().filter(|e| matches!(e, TraceElement::TraceOn)).count();
    assert_eq!(trace_on_count, 2, "expected TraceOn once for each ASYNC: {elems:?}");
    assert!(elems
        .iter()
        .any(|e| matches!(e, TraceElement::NoSync(coresight_decoder::element::NoSyncReason::BadPacket))));
}

/// `indexSOP` is non-decreasing across the elements emitted for one trace
/// ID, regardless of how many packets/elements each byte run produces.
#[test]
fn index_sop_is_monotonic_across_elements() {
    let mut tree = itm_tree(PktProcFlags::PKTPROC_COMMON);
    let mut input = ASYNC.to_vec();
    // SWIT src 3, size 1, twice, to produce two SwTrace elements.
    input.extend_from_slice(&[0x19, 0xAA]);
    input.extend_from_slice(&[0x19, 0xBB]);

    tree.trace_data_in(&input);
    tree.trace_data_eot();

    let indices: Vec<TraceIndex> = tree.elem_sink_mut().0.iter().map(|(i, _)| *i).collect();
    assert!(indices.windows(2).all(|w| w[0] <= w[1]), "{indices:?}");
}

/// A sink that returns `WAIT` once must have its queued element delivered by
/// a subsequent no-data `FLUSH`-shaped call (modeled here as a follow-up
/// `trace_data_in` with an empty slice), and further flushes are idempotent
/// once the sink accepts.
#[test]
fn wait_then_flush_drains_queued_element() {
    struct OnceWait {
        waited: bool,
        seen: Vec<TraceElement>,
    }

    impl ElementSink for OnceWait {
        type Error = core::convert::Infallible;
        fn trace_elem_in(
            &mut self,
            _index_sop: TraceIndex,
            _cs_id: CSTraceID,
            elem: &TraceElement,
        ) -> Result<DatapathResponse, Self::Error> {
            if !self.waited {
                self.waited = true;
                return Ok(DatapathResponse::Wait);
            }
            self.seen.push(*elem);
            Ok(DatapathResponse::Cont)
        }
    }

    let cs_id = CSTraceID::new(0x11).unwrap();
    let mut tree = DecodeTree::new(
        SourceType::Single,
        CreateFlags::FullDecoder,
        OnceWait {
            waited: false,
            seen: Vec::new(),
        },
    );
    tree.create_decoder(cs_id, ProtocolId::Itm, PktProcFlags::PKTPROC_COMMON)
        .unwrap();

    let (_used, resp) = tree.trace_data_in(&ASYNC);
    assert_eq!(resp, DatapathResponse::Wait);
    assert!(tree.elem_sink_mut().seen.is_empty());

    // A FLUSH-shaped follow-up call with no new bytes drains the pending
    // element once the sink accepts it.
    let (_, resp) = tree.trace_data_in(&[]);
    assert_eq!(resp, DatapathResponse::Cont);
    assert!(tree
        .elem_sink_mut()
        .seen
        .iter()
        .any(|e| matches!(e, TraceElement::TraceOn)));

    // A second flush with nothing pending stays idempotent.
    let (_, resp) = tree.trace_data_in(&[]);
    assert_eq!(resp, DatapathResponse::Cont);
}
