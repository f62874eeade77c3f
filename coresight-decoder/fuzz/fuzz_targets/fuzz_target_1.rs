#![no_main]

use arbitrary::Arbitrary;
use coresight_decoder::element::{ElementSink, TraceElement};
use coresight_decoder::{
    CSTraceID, CreateFlags, DatapathResponse, DecodeTree, PktProcFlags, ProtocolId, SourceType,
    TraceIndex,
};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum FuzzProtocol {
    Itm,
    Stm,
    Ptm,
    Etmv3,
}

impl From<&FuzzProtocol> for ProtocolId {
    fn from(value: &FuzzProtocol) -> Self {
        match value {
            FuzzProtocol::Itm => ProtocolId::Itm,
            FuzzProtocol::Stm => ProtocolId::Stm,
            FuzzProtocol::Ptm => ProtocolId::Ptm,
            FuzzProtocol::Etmv3 => ProtocolId::Etmv3,
        }
    }
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    protocol: FuzzProtocol,
    err_bad_pkts: bool,
    unsync_on_bad_pkts: bool,
    data: Vec<u8>,
}

#[derive(Default)]
struct Collector {
    elements: Vec<TraceElement>,
}

impl ElementSink for Collector {
    type Error = std::convert::Infallible;

    fn trace_elem_in(
        &mut self,
        _index_sop: TraceIndex,
        _cs_id: CSTraceID,
        elem: &TraceElement,
    ) -> Result<DatapathResponse, Self::Error> {
        self.elements.push(*elem);
        Ok(DatapathResponse::Cont)
    }
}

fn build_tree(input: &FuzzInput) -> DecodeTree<'static, Collector> {
    let cs_id = CSTraceID::new(1).unwrap();
    let mut pkt_flags = PktProcFlags::PKTPROC_COMMON;
    if input.err_bad_pkts {
        pkt_flags |= PktProcFlags::ERR_BAD_PKTS;
    }
    if input.unsync_on_bad_pkts {
        pkt_flags |= PktProcFlags::UNSYNC_ON_BAD_PKTS;
    }

    let mut tree = DecodeTree::new(SourceType::Single, CreateFlags::FullDecoder, Collector::default());
    tree.create_decoder(cs_id, ProtocolId::from(&input.protocol), pkt_flags)
        .expect("built-in protocols always construct a decoder");
    tree
}

// Feeding the same bytes through one `DATA` call or a byte-at-a-time
// sequence of `DATA` calls must decode to the same element stream.
fuzz_target!(|input: FuzzInput| {
    let mut whole = build_tree(&input);
    let _ = whole.trace_data_in(&input.data);
    let _ = whole.trace_data_eot();

    let mut piecewise = build_tree(&input);
    for byte in &input.data {
        let _ = piecewise.trace_data_in(std::slice::from_ref(byte));
    }
    let _ = piecewise.trace_data_eot();

    assert_eq!(whole.elem_sink_mut().elements, piecewise.elem_sink_mut().elements);
});
