//! Component A: memory access map with a paged, per-trace-ID cache.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{ErrorKind, ErrorRecord, Severity};
use crate::index::CSTraceID;

/// Bitmask over the ARM exception-level / security-state memory spaces an
/// [`Accessor`] or a read can target.
///
/// Implemented as a hand-rolled bitmask (see [`crate::datapath`]'s
/// `bitflags_like!`) rather than pulling in a bitflags crate, since nothing
/// in the retrieved example pack reaches for one even for bit-heavy header
/// fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySpace(u8);

impl MemorySpace {
    /// Empty set.
    pub const NONE: Self = Self(0);
    /// Non-secure EL1.
    pub const EL1N: Self = Self(1 << 0);
    /// Non-secure EL2.
    pub const EL2: Self = Self(1 << 1);
    /// EL3 (always secure).
    pub const EL3: Self = Self(1 << 2);
    /// Secure EL1.
    pub const EL1S: Self = Self(1 << 3);
    /// Secure EL2.
    pub const EL2S: Self = Self(1 << 4);
    /// Realm EL1.
    pub const EL1R: Self = Self(1 << 5);
    /// Realm EL2.
    pub const EL2R: Self = Self(1 << 6);
    /// Root world.
    pub const ROOT: Self = Self(1 << 7);

    /// Union of every non-secure space.
    pub const NON_SECURE: Self = Self(Self::EL1N.0 | Self::EL2.0);
    /// Union of every secure space.
    pub const SECURE: Self = Self(Self::EL1S.0 | Self::EL2S.0 | Self::EL3.0);
    /// Union of every realm space.
    pub const REALM: Self = Self(Self::EL1R.0 | Self::EL2R.0);
    /// Union of every space this crate knows about.
    pub const ANY: Self = Self(0xFF);

    /// Build from a raw bitmask.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw bitmask.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether `self` and `other` share at least one space.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Parse a snapshot-style memory space string.
    ///
    /// `s|secure`, `n|nonsecure|ns`, `r|realm`, `el1s`, `el1n`, `el2`, `el3`,
    /// `root` map to the corresponding mask; anything unrecognised maps to
    /// [`MemorySpace::ANY`], matching the external-interface contract rather
    /// than rejecting the row.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "s" | "secure" => Self::SECURE,
            "n" | "nonsecure" | "ns" => Self::NON_SECURE,
            "r" | "realm" => Self::REALM,
            "el1s" => Self::EL1S,
            "el1n" => Self::EL1N,
            "el2" => Self::EL2,
            "el3" => Self::EL3,
            "root" => Self::ROOT,
            _ => Self::ANY,
        }
    }
}

impl core::ops::BitOr for MemorySpace {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Where an [`Accessor`] reads its bytes from.
pub enum AccessorKind<'a> {
    /// A caller-owned in-memory buffer.
    Buffer(&'a [u8]),
    /// A callback invoked per read, e.g. backing a memory-mapped file.
    Callback(alloc::boxed::Box<dyn FnMut(u64, &mut [u8]) -> usize + 'a>),
}

impl core::fmt::Debug for AccessorKind<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Buffer(buf) => f.debug_tuple("Buffer").field(&buf.len()).finish(),
            Self::Callback(_) => f.debug_tuple("Callback").finish(),
        }
    }
}

/// A registered memory range backing opcode reads.
#[derive(Debug)]
pub struct Accessor<'a> {
    start_addr: u64,
    end_addr: u64,
    spaces: MemorySpace,
    kind: AccessorKind<'a>,
}

impl<'a> Accessor<'a> {
    /// Build an accessor backed by an in-memory buffer mapped at `start_addr`.
    ///
    /// `start_addr` and `end_addr + 1` must both be even; `start_addr` must
    /// not exceed `end_addr`. Returns `None` if those invariants don't hold.
    #[must_use]
    pub fn buffer(start_addr: u64, end_addr: u64, spaces: MemorySpace, data: &'a [u8]) -> Option<Self> {
        Self::new(start_addr, end_addr, spaces, AccessorKind::Buffer(data))
    }

    /// Build an accessor backed by a read callback.
    #[must_use]
    pub fn callback(
        start_addr: u64,
        end_addr: u64,
        spaces: MemorySpace,
        read: impl FnMut(u64, &mut [u8]) -> usize + 'a,
    ) -> Option<Self> {
        Self::new(
            start_addr,
            end_addr,
            spaces,
            AccessorKind::Callback(alloc::boxed::Box::new(read)),
        )
    }

    fn new(start_addr: u64, end_addr: u64, spaces: MemorySpace, kind: AccessorKind<'a>) -> Option<Self> {
        if start_addr > end_addr || start_addr % 2 != 0 || (end_addr + 1) % 2 != 0 {
            return None;
        }
        Some(Self {
            start_addr,
            end_addr,
            spaces,
            kind,
        })
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start_addr <= other.end_addr
            && other.start_addr <= self.end_addr
            && self.spaces.intersects(other.spaces)
    }

    fn covers(&self, addr: u64, space: MemorySpace) -> bool {
        addr >= self.start_addr && addr <= self.end_addr && self.spaces.intersects(space)
    }

    /// Read up to `out.len()` bytes starting at `addr`, returning the number
    /// actually read (short at the end of the covered range).
    fn read(&mut self, addr: u64, out: &mut [u8]) -> usize {
        let available = (self.end_addr - addr + 1).min(out.len() as u64) as usize;
        let out = &mut out[..available];
        match &mut self.kind {
            AccessorKind::Buffer(buf) => {
                let offset = (addr - self.start_addr) as usize;
                let Some(src) = buf.get(offset..) else {
                    return 0;
                };
                let n = src.len().min(out.len());
                out[..n].copy_from_slice(&src[..n]);
                n
            }
            AccessorKind::Callback(read) => read(addr, out),
        }
    }
}

#[derive(Debug)]
struct CachePage {
    start: u64,
    valid_len: usize,
    trace_id: Option<CSTraceID>,
    use_sequence: u64,
    data: Vec<u8>,
}

impl CachePage {
    fn empty(page_bytes: usize) -> Self {
        Self {
            start: 0,
            valid_len: 0,
            trace_id: None,
            use_sequence: 0,
            data: vec![0; page_bytes],
        }
    }

    fn satisfies(&self, addr: u64, req_bytes: usize, cs_id: CSTraceID) -> bool {
        self.valid_len > 0
            && self.trace_id == Some(cs_id)
            && self.start <= addr
            && addr + req_bytes as u64 <= self.start + self.valid_len as u64
    }
}

/// Result of a [`MemoryAccessMap::read_target_memory`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Number of bytes actually populated, `<= requested`.
    pub read_bytes: usize,
}

/// Serves opcode reads by address, memory space, and trace ID, through a set
/// of non-overlapping accessors and an optional per-trace-ID page cache
///.
pub struct MemoryAccessMap<'a> {
    accessors: Vec<Accessor<'a>>,
    current_accessor: Option<usize>,
    caching_enabled: bool,
    page_bytes: usize,
    pages: Vec<CachePage>,
    next_use_sequence: u64,
}

/// Default page size in bytes.
pub const DEFAULT_PAGE_BYTES: usize = 2048;
/// Default page count.
pub const DEFAULT_PAGE_COUNT: usize = 16;

impl<'a> MemoryAccessMap<'a> {
    /// Build a map with caching enabled at the documented defaults
    /// (2048-byte pages, 16 of them).
    #[must_use]
    pub fn new() -> Self {
        let mut map = Self {
            accessors: Vec::new(),
            current_accessor: None,
            caching_enabled: true,
            page_bytes: DEFAULT_PAGE_BYTES,
            pages: Vec::new(),
            next_use_sequence: 1,
        };
        map.rebuild_pages();
        map
    }

    fn rebuild_pages(&mut self) {
        self.pages = (0..DEFAULT_PAGE_COUNT)
            .map(|_| CachePage::empty(self.page_bytes))
            .collect();
    }

    /// Register an accessor, rejecting it with [`ErrorKind::MemOverlap`] if
    /// it overlaps an existing one in both address range and memory space.
    pub fn add_accessor(&mut self, accessor: Accessor<'a>) -> Result<(), ErrorRecord> {
        if self.accessors.iter().any(|existing| existing.overlaps(&accessor)) {
            return Err(ErrorRecord::new(
                Severity::Error,
                ErrorKind::MemOverlap,
                0,
                "accessor overlaps an existing one in range and memory space",
            ));
        }
        self.accessors.push(accessor);
        self.current_accessor = None;
        Ok(())
    }

    /// Drop every cache page tagged with `cs_id`, forcing the next read for
    /// that ID to reload from its accessor.
    pub fn invalidate_by_trace_id(&mut self, cs_id: CSTraceID) {
        for page in &mut self.pages {
            if page.trace_id == Some(cs_id) {
                page.valid_len = 0;
                page.trace_id = None;
            }
        }
    }

    /// Enable or disable the page cache.
    pub fn enable_caching(&mut self, enabled: bool) {
        self.caching_enabled = enabled;
    }

    /// Reconfigure the cache's page size and page count.
    ///
    /// `page_bytes` is clamped to `[64, 16384]` and `page_count` to
    /// `[4, 256]`; reconfiguring drops all cached data.
    pub fn set_cache_sizes(&mut self, page_bytes: usize, page_count: usize) {
        self.page_bytes = page_bytes.clamp(64, 16384);
        let page_count = page_count.clamp(4, 256);
        self.pages = (0..page_count)
            .map(|_| CachePage::empty(self.page_bytes))
            .collect();
    }

    fn find_accessor(&mut self, addr: u64, space: MemorySpace) -> Option<usize> {
        if let Some(idx) = self.current_accessor {
            if self.accessors[idx].covers(addr, space) {
                return Some(idx);
            }
        }
        let idx = self
            .accessors
            .iter()
            .position(|accessor| accessor.covers(addr, space))?;
        self.current_accessor = Some(idx);
        Some(idx)
    }

    /// Read up to `req_bytes` bytes of opcode memory at `addr`, valid in
    /// memory space `space`, on behalf of trace ID `cs_id`.
    ///
    /// Returns a short read when the covering accessor's range ends before
    /// `req_bytes` bytes are available; returns
    /// [`ErrorKind::MemNacc`] when nothing covers `(addr, space)`.
    pub fn read_target_memory(
        &mut self,
        addr: u64,
        cs_id: CSTraceID,
        space: MemorySpace,
        req_bytes: usize,
        out: &mut [u8],
    ) -> Result<ReadOutcome, ErrorRecord> {
        debug_assert!(out.len() >= req_bytes);

        if !self.caching_enabled || req_bytes > self.page_bytes {
            let Some(idx) = self.find_accessor(addr, space) else {
                return Err(ErrorRecord::new(
                    Severity::Warn,
                    ErrorKind::MemNacc,
                    0,
                    "no accessor covers the requested address/space",
                )
                .with_cs_id(cs_id));
            };
            let read_bytes = self.accessors[idx].read(addr, &mut out[..req_bytes]);
            return Ok(ReadOutcome { read_bytes });
        }

        if let Some(page) = self
            .pages
            .iter_mut()
            .find(|page| page.satisfies(addr, req_bytes, cs_id))
        {
            self.next_use_sequence += 1;
            page.use_sequence = self.next_use_sequence;
            let offset = (addr - page.start) as usize;
            out[..req_bytes].copy_from_slice(&page.data[offset..offset + req_bytes]);
            return Ok(ReadOutcome { read_bytes: req_bytes });
        }

        let Some(idx) = self.find_accessor(addr, space) else {
            return Err(ErrorRecord::new(
                Severity::Warn,
                ErrorKind::MemNacc,
                0,
                "no accessor covers the requested address/space",
            )
            .with_cs_id(cs_id));
        };

        // Mirrors legacy behaviour: pages from the request address, not a
        // page-aligned boundary.
        let victim = self
            .pages
            .iter_mut()
            .min_by_key(|page| page.use_sequence)
            .expect("cache always holds at least one page");
        let page_bytes = self.page_bytes;
        let read_len = self.accessors[idx].read(addr, &mut victim.data[..page_bytes]);
        victim.start = addr;
        victim.valid_len = read_len;
        victim.trace_id = Some(cs_id);
        self.next_use_sequence += 1;
        victim.use_sequence = self.next_use_sequence;

        let read_bytes = read_len.min(req_bytes);
        out[..read_bytes].copy_from_slice(&victim.data[..read_bytes]);
        Ok(ReadOutcome { read_bytes })
    }
}

impl Default for MemoryAccessMap<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_accessors_are_rejected() {
        let mut map = MemoryAccessMap::new();
        let data = [0u8; 0x1000];
        map.add_accessor(Accessor::buffer(0x1000, 0x1FFF, MemorySpace::NON_SECURE, &data).unwrap())
            .unwrap();
        let err = map
            .add_accessor(Accessor::buffer(0x1800, 0x27FF, MemorySpace::NON_SECURE, &data).unwrap())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MemOverlap);

        map.add_accessor(Accessor::buffer(0x1800, 0x27FF, MemorySpace::SECURE, &data).unwrap())
            .unwrap();
    }

    #[test]
    fn cache_hit_avoids_reload_and_invalidate_forces_one() {
        let mut map = MemoryAccessMap::new();
        let data: Vec<u8> = (0..=255u8).cycle().take(0x2000).collect();
        map.add_accessor(Accessor::buffer(0x1000, 0x2FFF, MemorySpace::NON_SECURE, &data).unwrap())
            .unwrap();
        let id = CSTraceID::new(1).unwrap();

        let mut out = [0u8; 4];
        map.read_target_memory(0x1000, id, MemorySpace::NON_SECURE, 4, &mut out)
            .unwrap();
        assert_eq!(out, data[0..4]);

        // Second read at an offset within the same page must hit.
        let mut out2 = [0u8; 4];
        let outcome = map
            .read_target_memory(0x1004, id, MemorySpace::NON_SECURE, 4, &mut out2)
            .unwrap();
        assert_eq!(outcome.read_bytes, 4);
        assert_eq!(out2, data[4..8]);

        map.invalidate_by_trace_id(id);
        let mut out3 = [0u8; 4];
        map.read_target_memory(0x1000, id, MemorySpace::NON_SECURE, 4, &mut out3)
            .unwrap();
        assert_eq!(out3, data[0..4]);
    }

    #[test]
    fn unmapped_read_is_mem_nacc() {
        let mut map = MemoryAccessMap::new();
        let id = CSTraceID::new(2).unwrap();
        let mut out = [0u8; 4];
        let err = map
            .read_target_memory(0x9000, id, MemorySpace::ANY, 4, &mut out)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MemNacc);
    }
}
