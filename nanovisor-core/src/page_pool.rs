//! The kernel page pool
//!
//! Hands out 4 KiB pages from the contiguous range the loader donated and
//! reclaims them through an intrusive free list threaded through the first
//! qword of each free page; a bump cursor feeds the list on first use.
//! Every allocation carries a tag naming its reason, and the pool keeps a
//! per-tag outstanding count so a free with the wrong tag is caught and
//! logged without corrupting the pool.

use core::ptr::NonNull;

use crate::error;
use crate::status::{MkError, MkResult};
use nanovisor_hal::memory::{is_page_aligned, PhysicalAddress, PAGE_SIZE};
use spin::Mutex;

/// Why a page was allocated. Free must present the same tag back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTag {
    Pml4t,
    Pdpt,
    Pdt,
    Pt,
    ExtStack,
    ExtTls,
    ExtElf,
    BfMemOpAllocPage,
    BfMemOpAllocHeap,
    /// the VPS hardware page (VMCS or VMCB)
    VmcsVmcb,
}

const TAG_KINDS: usize = 10;

impl PageTag {
    const fn index(self) -> usize {
        match self {
            Self::Pml4t => 0,
            Self::Pdpt => 1,
            Self::Pdt => 2,
            Self::Pt => 3,
            Self::ExtStack => 4,
            Self::ExtTls => 5,
            Self::ExtElf => 6,
            Self::BfMemOpAllocPage => 7,
            Self::BfMemOpAllocHeap => 8,
            Self::VmcsVmcb => 9,
        }
    }
}

#[repr(C)]
struct FreePage {
    next: *mut FreePage,
}

struct Inner {
    base: usize,
    phys_base: PhysicalAddress,
    size: usize,
    crsr: usize,
    free_head: *mut FreePage,
    outstanding: [usize; TAG_KINDS],
}

// Inner only holds pointers into the loader-donated range; all access is
// under the pool lock.
unsafe impl Send for Inner {}

/// The page pool. One per kernel, shared by every PP.
pub struct PagePool {
    inner: Mutex<Inner>,
}

impl PagePool {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                base: 0,
                phys_base: 0,
                size: 0,
                crsr: 0,
                free_head: core::ptr::null_mut(),
                outstanding: [0; TAG_KINDS],
            }),
        }
    }

    /// Adopts the loader-donated range. `base` is the kernel virtual
    /// address of the range, `phys_base` its physical address.
    ///
    /// # Safety
    ///
    /// The range must be valid, unaliased kernel memory for the lifetime
    /// of the pool.
    pub unsafe fn initialize(
        &self,
        base: *mut u8,
        phys_base: PhysicalAddress,
        size: usize,
    ) -> MkResult<()> {
        let mut inner = self.inner.lock();

        if inner.size != 0 {
            error!("page pool already initialized");
            return Err(MkError::Unknown);
        }

        if base.is_null() || size < PAGE_SIZE {
            error!("page pool donation too small: {:#x} bytes", size);
            return Err(MkError::InvalidParams1);
        }

        if !is_page_aligned(base as u64) || !is_page_aligned(phys_base) {
            error!("page pool donation is not page aligned");
            return Err(MkError::InvalidParams1);
        }

        inner.base = base as usize;
        inner.phys_base = phys_base;
        inner.size = size & !(PAGE_SIZE - 1);
        inner.crsr = 0;
        inner.free_head = core::ptr::null_mut();

        Ok(())
    }

    /// Allocates one zeroed page.
    pub fn allocate(&self, tag: PageTag) -> MkResult<NonNull<u8>> {
        let mut inner = self.inner.lock();

        if inner.size == 0 {
            error!("page pool not initialized");
            return Err(MkError::Unknown);
        }

        let page = if !inner.free_head.is_null() {
            let head = inner.free_head;
            inner.free_head = unsafe { (*head).next };
            head as *mut u8
        } else if inner.crsr + PAGE_SIZE <= inner.size {
            let page = (inner.base + inner.crsr) as *mut u8;
            inner.crsr += PAGE_SIZE;
            page
        } else {
            error!("page pool out of pages");
            return Err(MkError::OutOfMemory);
        };

        inner.outstanding[tag.index()] += 1;
        unsafe { core::ptr::write_bytes(page, 0, PAGE_SIZE) };

        // the range was checked non-null at initialize and never hands out
        // the null page
        Ok(unsafe { NonNull::new_unchecked(page) })
    }

    /// Returns a page to the pool. A tag that does not match any
    /// outstanding allocation is logged as a bug; the page is still
    /// reclaimed.
    pub fn deallocate(&self, virt: NonNull<u8>, tag: PageTag) {
        let mut inner = self.inner.lock();

        let addr = virt.as_ptr() as usize;
        if addr < inner.base || addr >= inner.base + inner.size || !is_page_aligned(addr as u64) {
            error!("attempt to free {:#x}, which the page pool does not own", addr);
            return;
        }

        if inner.outstanding[tag.index()] == 0 {
            error!("page freed with mismatched tag {:?}", tag);
        } else {
            inner.outstanding[tag.index()] -= 1;
        }

        let page = addr as *mut FreePage;
        unsafe { (*page).next = inner.free_head };
        inner.free_head = page;
    }

    /// Kernel virtual address → physical address, constant time.
    pub fn virt_to_phys(&self, virt: *const u8) -> MkResult<PhysicalAddress> {
        let inner = self.inner.lock();
        let addr = virt as usize;

        if addr < inner.base || addr >= inner.base + inner.size {
            error!("virt_to_phys: {:#x} is outside the page pool", addr);
            return Err(MkError::InvalidParams1);
        }

        Ok(inner.phys_base + (addr - inner.base) as u64)
    }

    /// Physical address → kernel virtual address, constant time.
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> MkResult<*mut u8> {
        let inner = self.inner.lock();

        if phys < inner.phys_base || phys >= inner.phys_base + inner.size as u64 {
            error!("phys_to_virt: {:#x} is outside the page pool", phys);
            return Err(MkError::InvalidParams1);
        }

        Ok((inner.base + (phys - inner.phys_base) as usize) as *mut u8)
    }

    /// Outstanding allocations carrying `tag`. Audit/test support.
    pub fn outstanding(&self, tag: PageTag) -> usize {
        self.inner.lock().outstanding[tag.index()]
    }

    /// Total outstanding allocations. Audit/test support.
    pub fn total_outstanding(&self) -> usize {
        self.inner.lock().outstanding.iter().sum()
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}
