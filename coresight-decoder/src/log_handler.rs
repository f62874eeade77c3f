//! An [`ElementSink`] that logs every element through the [`log`] facade.
//!
//! Useful for debugging a custom sink: attach [`ElementLogger`] on its own,
//! or alongside a real sink with a small fan-out wrapper, the way the
//! teacher's `PacketHandlerRawLogger` is meant to be composed via
//! `CombinedPacketHandler`.

use core::convert::Infallible;

use crate::datapath::DatapathResponse;
use crate::element::{ElementSink, TraceElement};
use crate::index::{CSTraceID, TraceIndex};

/// Logs every element it receives at `trace` level and otherwise does
/// nothing.
#[derive(Debug, Default)]
pub struct ElementLogger {}

impl ElementSink for ElementLogger {
    // This logger will never error.
    type Error = Infallible;

    fn trace_elem_in(
        &mut self,
        index_sop: TraceIndex,
        cs_id: CSTraceID,
        elem: &TraceElement,
    ) -> Result<DatapathResponse, Self::Error> {
        log::trace!("[{cs_id}@{index_sop}]\t{elem:?}");
        Ok(DatapathResponse::Cont)
    }
}
