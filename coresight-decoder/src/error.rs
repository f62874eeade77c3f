//! Error records and error kinds shared across every component.

use core as std; // workaround for `perfect_derive`

use alloc::string::String;
use perfect_derive::perfect_derive;
use thiserror::Error;

use crate::index::{CSTraceID, TraceIndex};

/// Exhaustive error kind list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A parameter value was out of range or otherwise invalid.
    #[error("invalid parameter value")]
    InvalidParamVal,
    /// A parameter was of the wrong variant/type for the call.
    #[error("invalid parameter type")]
    InvalidParamType,
    /// The component was used before being fully configured.
    #[error("component not initialised")]
    NotInit,
    /// No accessor covers the requested `(addr, space)`.
    #[error("memory not accessible")]
    MemNacc,
    /// Two accessors would overlap in both address range and memory space.
    #[error("accessor ranges overlap")]
    MemOverlap,
    /// A packet processor's state machine observed a sequence its protocol
    /// forbids.
    #[error("bad packet sequence")]
    BadPacketSeq,
    /// A packet header encoded a value the protocol reserves.
    #[error("invalid packet header")]
    InvalidPcktHdr,
    /// A decoder was registered under a name already in use.
    #[error("decoder name already registered")]
    DcdregNameRepeat,
    /// A decoder lookup by name found nothing.
    #[error("decoder name unknown")]
    DcdregNameUnknown,
    /// A decoder lookup by protocol enum found nothing.
    #[error("decoder type unknown")]
    DcdregTypeUnknown,
    /// An unanticipated internal error.
    #[error("internal failure")]
    Fail,
}

/// Severity attached to an [`ErrorRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Purely informational; no action required.
    Info,
    /// Recoverable condition worth surfacing to a log.
    Warn,
    /// Non-fatal error; the datapath response is `ErrCont`/`ErrStop`.
    Error,
    /// Unrecoverable; the datapath response is one of the `Fatal*` variants.
    Fatal,
}

/// An error record as carried by the datapath.
#[derive(Debug, Clone, Error)]
#[error("[{severity:?}] {kind} at index {trace_index} (id {cs_id:?}): {message}")]
pub struct ErrorRecord {
    /// How serious this condition is.
    pub severity: Severity,
    /// The kind of error.
    pub kind: ErrorKind,
    /// Byte offset into the buffer where the error was detected.
    pub trace_index: TraceIndex,
    /// Source ID the error pertains to, if one was known.
    pub cs_id: Option<CSTraceID>,
    /// Human-readable detail, e.g. the offending header byte.
    pub message: String,
}

impl ErrorRecord {
    /// Build a record with no associated source ID.
    #[must_use]
    pub fn new(
        severity: Severity,
        kind: ErrorKind,
        trace_index: TraceIndex,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            kind,
            trace_index,
            cs_id: None,
            message: message.into(),
        }
    }

    /// Attach a source ID to the record.
    #[must_use]
    pub fn with_cs_id(mut self, cs_id: CSTraceID) -> Self {
        self.cs_id = Some(cs_id);
        self
    }
}

/// Error returned by a component whose terminal sink is generic over its own
/// error type.
///
/// Every stage of this pipeline (packet sinks, raw monitors, element sinks)
/// can fail with its own error type `E`, so this type is parameterised over
/// it and uses `perfect_derive` to avoid requiring `E: Debug` on callers that
/// never inspect the sink variant.
#[derive(Error)]
#[perfect_derive(Debug)]
#[non_exhaustive]
pub enum DecodeError<E: core::error::Error> {
    /// An attached sink returned an error.
    #[error("sink error")]
    Sink(#[source] E),
    /// An internal protocol/data error, carrying its full record.
    #[error(transparent)]
    Internal(ErrorRecord),
}

impl<E: core::error::Error> From<ErrorRecord> for DecodeError<E> {
    fn from(record: ErrorRecord) -> Self {
        Self::Internal(record)
    }
}

/// Convenience alias for a result whose error is a [`DecodeError`].
pub type DecodeResult<T, E> = core::result::Result<T, DecodeError<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_record_display_includes_kind_and_index() {
        let record = ErrorRecord::new(Severity::Error, ErrorKind::MemNacc, 42, "0x1000")
            .with_cs_id(CSTraceID::new(3).unwrap());
        let text = alloc::format!("{record}");
        assert!(text.contains("MemNacc"));
        assert!(text.contains("42"));
    }
}
