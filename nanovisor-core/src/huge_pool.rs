//! The kernel huge pool
//!
//! Allocator for physically contiguous multi-page blocks, fed by its own
//! loader-donated range. A bounded descriptor table tracks live blocks;
//! freed blocks of the same size are reused first-fit, everything else
//! comes off a bump cursor. The kernel itself only needs this for
//! `bf_mem_op_alloc_huge`, so the descriptor table stays small.

use core::ptr::NonNull;

use crate::error;
use crate::status::{MkError, MkResult};
use nanovisor_hal::memory::{is_page_aligned, PhysicalAddress, PAGE_SIZE};
use spin::Mutex;

const MAX_BLOCKS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Block {
    offset: usize,
    pages: usize,
    freed: usize,
    used: bool,
}

struct Inner {
    base: usize,
    phys_base: PhysicalAddress,
    size: usize,
    crsr: usize,
    blocks: [Block; MAX_BLOCKS],
}

unsafe impl Send for Inner {}

/// The huge pool. One per kernel, shared by every PP.
pub struct HugePool {
    inner: Mutex<Inner>,
}

impl HugePool {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                base: 0,
                phys_base: 0,
                size: 0,
                crsr: 0,
                blocks: [Block { offset: 0, pages: 0, freed: 0, used: false }; MAX_BLOCKS],
            }),
        }
    }

    /// Adopts the loader-donated range.
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
            error!("huge pool already initialized");
            return Err(MkError::Unknown);
        }

        if base.is_null() || size < PAGE_SIZE {
            error!("huge pool donation too small: {:#x} bytes", size);
            return Err(MkError::InvalidParams1);
        }

        if !is_page_aligned(base as u64) || !is_page_aligned(phys_base) {
            error!("huge pool donation is not page aligned");
            return Err(MkError::InvalidParams1);
        }

        inner.base = base as usize;
        inner.phys_base = phys_base;
        inner.size = size & !(PAGE_SIZE - 1);
        inner.crsr = 0;

        Ok(())
    }

    /// Allocates `pages` physically contiguous, zeroed pages.
    pub fn allocate(&self, pages: usize) -> MkResult<NonNull<u8>> {
        let mut inner = self.inner.lock();

        if inner.size == 0 {
            error!("huge pool not initialized");
            return Err(MkError::Unknown);
        }

        if pages == 0 {
            error!("huge allocation of zero pages");
            return Err(MkError::InvalidParams1);
        }

        let bytes = match pages.checked_mul(PAGE_SIZE) {
            Some(bytes) => bytes,
            None => {
                error!("huge allocation of {:#x} pages is invalid", pages);
                return Err(MkError::InvalidParams1);
            }
        };

        // reuse a freed block of the exact size before growing
        let mut found: Option<usize> = None;
        for (i, block) in inner.blocks.iter().enumerate() {
            if !block.used && block.pages == pages {
                found = Some(i);
                break;
            }
        }

        let offset = match found {
            Some(i) => {
                inner.blocks[i].used = true;
                inner.blocks[i].offset
            }
            None => {
                if inner.crsr + bytes > inner.size {
                    error!("huge pool out of memory");
                    return Err(MkError::OutOfMemory);
                }

                let slot = match inner.blocks.iter().position(|b| b.pages == 0) {
                    Some(slot) => slot,
                    None => {
                        error!("huge pool block table exhausted");
                        return Err(MkError::OutOfMemory);
                    }
                };

                let offset = inner.crsr;
                inner.crsr += bytes;
                inner.blocks[slot] = Block { offset, pages, freed: 0, used: true };
                offset
            }
        };

        let ptr = (inner.base + offset) as *mut u8;
        unsafe { core::ptr::write_bytes(ptr, 0, bytes) };

        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Returns one page of a block to the pool. Teardown walks leaf PTEs,
    /// so a block comes back one page at a time; the block is reusable
    /// once its last page is in.
    pub fn deallocate_page(&self, virt: NonNull<u8>) -> MkResult<()> {
        let mut inner = self.inner.lock();

        let addr = virt.as_ptr() as usize;
        if addr < inner.base || addr >= inner.base + inner.size {
            error!("attempt to free {:#x}, which the huge pool does not own", addr);
            return Err(MkError::InvalidParams1);
        }

        let offset = addr - inner.base;
        for block in inner.blocks.iter_mut() {
            if block.used
                && offset >= block.offset
                && offset < block.offset + block.pages * PAGE_SIZE
            {
                block.freed += 1;
                if block.freed == block.pages {
                    block.freed = 0;
                    block.used = false;
                }
                return Ok(());
            }
        }

        error!("huge free of {:#x} matches no live block", addr);
        Err(MkError::InvalidParams1)
    }

    /// Kernel virtual address → physical address, constant time.
    pub fn virt_to_phys(&self, virt: *const u8) -> MkResult<PhysicalAddress> {
        let inner = self.inner.lock();
        let addr = virt as usize;

        if addr < inner.base || addr >= inner.base + inner.size {
            error!("virt_to_phys: {:#x} is outside the huge pool", addr);
            return Err(MkError::InvalidParams1);
        }

        Ok(inner.phys_base + (addr - inner.base) as u64)
    }

    /// Physical address → kernel virtual address, constant time.
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> MkResult<*mut u8> {
        let inner = self.inner.lock();

        if phys < inner.phys_base || phys >= inner.phys_base + inner.size as u64 {
            error!("phys_to_virt: {:#x} is outside the huge pool", phys);
            return Err(MkError::InvalidParams1);
        }

        Ok((inner.base + (phys - inner.phys_base) as usize) as *mut u8)
    }

    /// Live blocks. Audit/test support.
    pub fn outstanding_blocks(&self) -> usize {
        self.inner.lock().blocks.iter().filter(|b| b.used).count()
    }
}

impl Default for HugePool {
    fn default() -> Self {
        Self::new()
    }
}
