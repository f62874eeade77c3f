//! Shared data-path primitives: op codes, the response lattice, and the
//! op-mode flags consumed by packet processors.

/// Minimal `bitflags!`-shaped macro.
///
/// No bitflags-family crate appears anywhere in the retrieved example pack,
/// so flag types here follow the same hand-rolled `const`-mask pattern the
/// packet processors use for header bits, rather than pulling in a new
/// dependency for this alone.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: Self = Self($value);
            )*

            /// The empty flag set.
            pub const NONE: Self = Self(0);

            /// Build from a raw bit pattern.
            #[must_use]
            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            /// The raw bit pattern.
            #[must_use]
            pub const fn bits(self) -> $repr {
                self.0
            }

            /// Whether all bits of `other` are set in `self`.
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

/// Operation requested of a `traceDataIn`-shaped entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode<'a> {
    /// New bytes to decode, starting logically at the given index.
    Data(&'a [u8]),
    /// No new bytes; drain any state a prior [`DatapathResponse::Wait`] left
    /// pending.
    Flush,
    /// Clean end of trace; any incomplete packet is resolved per the
    /// processor's `IncompleteEOT` policy.
    Eot,
    /// Discard all buffered state without producing further output.
    Reset,
}

/// Result of feeding an [`OpCode`] through a component.
///
/// Ordered so that folding several responses together (e.g. across sinks
/// attached to one chain) can take the worst one with a plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatapathResponse {
    /// Keep going; nothing to report.
    Cont,
    /// A sink is backpressuring; the caller must retry with
    /// [`OpCode::Flush`] once it can accept more.
    Wait,
    /// A non-fatal error was encountered and absorbed; decoding continues.
    ErrCont,
    /// A non-fatal error was encountered and the caller should stop feeding
    /// this component new data (but existing state is not corrupted).
    ErrStop,
    /// The component was used before being fully configured.
    FatalNotInit,
    /// The input violated protocol rules badly enough that no recovery is
    /// attempted.
    FatalInvalidData,
    /// An internal invariant was violated.
    FatalSysErr,
}

impl DatapathResponse {
    /// Whether this response terminates the pipeline for good.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::FatalNotInit | Self::FatalInvalidData | Self::FatalSysErr
        )
    }

    /// Combine two responses from parallel sinks, keeping the more severe one.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        if self >= other { self } else { other }
    }
}

bitflags_like! {
    /// Op-mode flags shared by all packet processors.
    pub struct PktProcFlags: u8 {
        /// Baseline capability marker; always set by processors created
        /// through [`crate::registry`].
        const PKTPROC_COMMON = 1 << 0;
        /// Treat a `BadSequence`/`Reserved` packet as
        /// [`DatapathResponse::FatalInvalidData`] instead of emitting it.
        const ERR_BAD_PKTS = 1 << 1;
        /// After emitting a bad packet, return to `WaitSync` instead of
        /// continuing to decode at the current position.
        const UNSYNC_ON_BAD_PKTS = 1 << 2;
    }
}

bitflags_like! {
    /// Deformatter configuration flags.
    pub struct DeformatterFlags: u8 {
        /// Every 16-byte frame starts on a 16-byte boundary (default mode).
        const MEM_ALIGN = 1 << 0;
        /// Frames may be separated by the 4-byte FSYNC pattern.
        const HAS_FSYNC = 1 << 1;
        /// Half-sync words may appear mid-frame on 2-byte boundaries.
        const HAS_HSYNC = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_lattice_orders_as_documented() {
        assert!(DatapathResponse::Cont < DatapathResponse::Wait);
        assert!(DatapathResponse::Wait < DatapathResponse::ErrCont);
        assert!(DatapathResponse::ErrCont < DatapathResponse::FatalNotInit);
        assert!(DatapathResponse::FatalSysErr.is_fatal());
        assert!(!DatapathResponse::ErrCont.is_fatal());
    }

    #[test]
    fn combine_keeps_worse_response() {
        assert_eq!(
            DatapathResponse::Cont.combine(DatapathResponse::Wait),
            DatapathResponse::Wait
        );
        assert_eq!(
            DatapathResponse::FatalSysErr.combine(DatapathResponse::Cont),
            DatapathResponse::FatalSysErr
        );
    }

    #[test]
    fn pktproc_flags_combine() {
        let flags = PktProcFlags::PKTPROC_COMMON | PktProcFlags::ERR_BAD_PKTS;
        assert!(flags.contains(PktProcFlags::ERR_BAD_PKTS));
        assert!(!flags.contains(PktProcFlags::UNSYNC_ON_BAD_PKTS));
    }
}
