//! Per-PP loader handoff
//!
//! The bootloader enters the kernel once per physical processor with a
//! pointer to one of these. The layout is part of the loader contract.

use crate::debug_ring::DebugRing;
use crate::paging::Pml4t;
use crate::state::StateSave;

/// The number of extension ELF images the loader may hand over.
pub const MAX_ELF_FILES: usize = 2;

/// A loader-provided byte range. Raw parts rather than a slice so the
/// struct stays FFI-stable; `as_slice` is the only way the kernel reads it.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ByteSpan {
    pub addr: *mut u8,
    pub size: usize,
}

impl ByteSpan {
    pub const fn empty() -> Self {
        Self { addr: core::ptr::null_mut(), size: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.addr.is_null() || self.size == 0
    }

    /// # Safety
    ///
    /// The span must describe live, initialized memory for the 'static
    /// lifetime of the kernel, which is the loader's side of the contract.
    pub unsafe fn as_slice(&self) -> &'static [u8] {
        unsafe { core::slice::from_raw_parts(self.addr, self.size) }
    }
}

/// The arguments the loader passes to the kernel, once per PP. The BSP is
/// the PP with `ppid == BF_BS_PPID`; only the BSP runs full initialization.
#[repr(C)]
pub struct MkArgs {
    /// the id of this PP
    pub ppid: u16,
    /// the number of PPs the loader brought online
    pub online_pps: u16,
    /// the microkernel's own entry state
    pub mk_state: *mut StateSave,
    /// the root VP's state, seed for init_as_root and target of promote
    pub root_vp_state: *mut StateSave,
    /// the ring the kernel mirrors its log into for the loader
    pub debug_ring: *mut DebugRing,
    /// the microkernel's own ELF image
    pub mk_elf_file: ByteSpan,
    /// the extension ELF images
    pub ext_elf_files: [ByteSpan; MAX_ELF_FILES],
    /// the initial root page table the loader built
    pub rpt: *mut Pml4t,
    /// physical address of `rpt`
    pub rpt_phys: u64,
    /// the page pool donation
    pub page_pool: ByteSpan,
    /// physical address of the page pool donation
    pub page_pool_phys: u64,
    /// the huge pool donation
    pub huge_pool: ByteSpan,
    /// physical address of the huge pool donation
    pub huge_pool_phys: u64,
}
