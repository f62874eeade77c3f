#![no_std]

extern crate alloc;

pub mod datapath;
pub mod deformatter;
pub mod element;
pub mod error;
pub mod index;
pub mod memory;
pub mod packet;
pub mod registry;
pub mod snapshot;
pub mod tree;

#[cfg(feature = "log_handler")]
pub mod log_handler;

pub use datapath::{DatapathResponse, DeformatterFlags, OpCode, PktProcFlags};
pub use element::{ElementSink, TraceElement};
pub use error::{DecodeError, DecodeResult, ErrorKind, ErrorRecord, Severity};
pub use index::{CSTraceID, TraceIndex};
pub use memory::{Accessor, MemoryAccessMap, MemorySpace};
pub use registry::{DecoderRegistry, ProtocolId};
pub use tree::{CreateFlags, DecodeTree, SourceType};
