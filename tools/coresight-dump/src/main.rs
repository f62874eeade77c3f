use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use coresight_decoder::log_handler::ElementLogger;
use coresight_decoder::{CSTraceID, CreateFlags, DecodeTree, PktProcFlags, ProtocolId, SourceType};

/// Decode a CoreSight trace capture and log every decoded element.
///
/// Set the environment variable `RUST_LOG=trace` for logging.
#[derive(Parser)]
struct Cmdline {
    /// Path of the trace capture
    #[arg(short, long)]
    input: PathBuf,
    /// Whether the capture is a single ID-tagged protocol stream, or a
    /// CoreSight frame-formatted multiplexed stream
    #[arg(short, long, value_enum, default_value_t = Mode::Single)]
    mode: Mode,
    /// Trace source ID to decode (0x1..=0x6F). Required in `single` mode; in
    /// `framed` mode, one decoder is still needed to know which ID(s) in the
    /// multiplexed stream to decode
    #[arg(long)]
    id: u8,
    /// Protocol to decode the source ID as
    #[arg(short, long, value_enum)]
    protocol: Protocol,
    /// Treat a bad packet sequence as a fatal error instead of emitting it
    #[arg(long)]
    err_bad_pkts: bool,
    /// Return to the unsynced state after a bad packet instead of resuming
    /// at the current position
    #[arg(long)]
    unsync_on_bad_pkts: bool,
}

#[derive(ValueEnum, Clone, Copy, Default)]
enum Mode {
    /// The capture holds exactly one protocol's bytes, with no CoreSight
    /// frame multiplexing
    #[default]
    Single,
    /// The capture is multiplexed into 16-byte CoreSight frames
    Framed,
}

#[derive(ValueEnum, Clone, Copy)]
enum Protocol {
    Itm,
    Stm,
    Ptm,
    Etmv3,
}

impl From<Protocol> for ProtocolId {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::Itm => ProtocolId::Itm,
            Protocol::Stm => ProtocolId::Stm,
            Protocol::Ptm => ProtocolId::Ptm,
            Protocol::Etmv3 => ProtocolId::Etmv3,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let Cmdline {
        input,
        mode,
        id,
        protocol,
        err_bad_pkts,
        unsync_on_bad_pkts,
    } = Cmdline::parse();

    let file = File::open(input).context("Failed to open input file")?;
    // SAFETY: check the safety requirements of memmap2 documentation
    let buf = unsafe { memmap2::Mmap::map(&file).context("Failed to mmap input file")? };

    let source_type = match mode {
        Mode::Single => SourceType::Single,
        Mode::Framed => SourceType::FrameFormatted,
    };
    let cs_id = CSTraceID::new(id).context("Trace source ID must be in 0x01..=0x6F")?;

    let mut pkt_flags = PktProcFlags::PKTPROC_COMMON;
    if err_bad_pkts {
        pkt_flags |= PktProcFlags::ERR_BAD_PKTS;
    }
    if unsync_on_bad_pkts {
        pkt_flags |= PktProcFlags::UNSYNC_ON_BAD_PKTS;
    }

    let mut tree = DecodeTree::new(source_type, CreateFlags::FullDecoder, ElementLogger::default());
    tree.create_decoder(cs_id, protocol.into(), pkt_flags)
        .context("Failed to create decoder")?;

    let (consumed, response) = tree.trace_data_in(&buf);
    log::info!("consumed {consumed} of {} bytes, response: {response:?}", buf.len());
    if response.is_fatal() {
        anyhow::bail!("decoder reported a fatal error: {response:?}");
    }

    let eot_response = tree.trace_data_eot();
    if eot_response.is_fatal() {
        anyhow::bail!("decoder reported a fatal error at end of trace: {eot_response:?}");
    }

    Ok(())
}
