//! Memory type definitions shared by the kernel and the platform layer

use bitflags::bitflags;

/// Physical address type
pub type PhysicalAddress = u64;

/// Virtual address type
pub type VirtualAddress = u64;

/// The one page size the kernel deals in. Every kernel-managed memory cell
/// is a whole number of these.
pub const PAGE_SIZE: usize = 4096;

/// log2 of `PAGE_SIZE`
pub const PAGE_SHIFT: u32 = 12;

bitflags! {
    /// Memory mapping flags
    ///
    /// `WRITE` and `EXECUTE` are mutually exclusive on every mapping the
    /// kernel creates; the RPT manager rejects the combination.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Returns `addr` rounded down to the nearest page boundary.
#[inline]
pub const fn page_aligned(addr: u64) -> u64 {
    addr & !((PAGE_SIZE as u64) - 1)
}

/// Returns true if `addr` sits on a page boundary.
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    (addr & ((PAGE_SIZE as u64) - 1)) == 0
}
