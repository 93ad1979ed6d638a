//! The root page table manager
//!
//! Builds, tears down and activates one 4-level x86-64 page table
//! hierarchy. Interior tables come from the page pool and are tagged per
//! level; leaf PTEs carry an auto-release tag naming the pool that owns
//! the pointed-to page, which is what makes `release` a complete, exact
//! teardown of everything an extension ever mapped.
//!
//! Aliasing: `add_tables` copies the present PML4 entries of another
//! hierarchy into this one with `alias = 1`. Aliased entries make the
//! other hierarchy's memory visible here but are never walked on release,
//! so the owning hierarchy frees them exactly once.

use core::ptr::NonNull;

use crate::error;
use crate::huge_pool::HugePool;
use crate::page_pool::{PagePool, PageTag};
use crate::status::{MkError, MkResult};
use nanovisor_hal::memory::{is_page_aligned, page_aligned, MapFlags, PhysicalAddress};
use nanovisor_hal::paging::{
    pdpt_index, pdt_index, pml4_index, pt_index, AutoRelease, Pdpt, Pdt, Pml4t, Pt,
};
use nanovisor_hal::Intrinsic;
use spin::Mutex;

struct Rpt {
    initialized: bool,
    pml4t: *mut Pml4t,
    pml4t_phys: PhysicalAddress,
}

// the table pointers reference page-pool memory; access is under the lock
unsafe impl Send for Rpt {}

/// One root page table: a PML4T plus every interior table reachable from
/// its non-aliased entries.
pub struct RootPageTable {
    inner: Mutex<Rpt>,
}

impl RootPageTable {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Rpt {
                initialized: false,
                pml4t: core::ptr::null_mut(),
                pml4t_phys: 0,
            }),
        }
    }

    /// Allocates the PML4T and brings this RPT to life.
    pub fn initialize(&self, page_pool: &PagePool) -> MkResult<()> {
        let mut rpt = self.inner.lock();

        if rpt.initialized {
            error!("root page table already initialized");
            return Err(MkError::Unknown);
        }

        let table = page_pool.allocate(PageTag::Pml4t)?;
        rpt.pml4t = table.as_ptr() as *mut Pml4t;
        rpt.pml4t_phys = page_pool.virt_to_phys(table.as_ptr())?;
        rpt.initialized = true;

        Ok(())
    }

    /// Tears down everything this RPT owns: every auto-released leaf page
    /// goes back to its owning pool, then the interior tables, then the
    /// PML4T itself. Aliased PML4 entries are skipped.
    pub fn release(&self, page_pool: &PagePool, huge_pool: &HugePool) {
        let mut rpt = self.inner.lock();

        if !rpt.initialized {
            return;
        }

        let pml4t = unsafe { &mut *rpt.pml4t };
        for pml4te in pml4t.entries.iter() {
            if !pml4te.present() || pml4te.alias() {
                continue;
            }

            remove_pdpt(page_pool, huge_pool, pml4te.phys());
        }

        deallocate_table(page_pool, rpt.pml4t as *mut u8, PageTag::Pml4t);
        rpt.pml4t = core::ptr::null_mut();
        rpt.pml4t_phys = 0;
        rpt.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// The physical address of the PML4T, i.e. what `activate` puts in
    /// CR3.
    pub fn pml4t_phys(&self) -> MkResult<PhysicalAddress> {
        let rpt = self.inner.lock();
        if !rpt.initialized {
            error!("root page table not initialized");
            return Err(MkError::Unknown);
        }

        Ok(rpt.pml4t_phys)
    }

    /// Makes this the current root page table on this PP.
    pub fn activate(&self, intrinsic: &dyn Intrinsic) -> MkResult<()> {
        let rpt = self.inner.lock();
        if !rpt.initialized {
            error!("root page table not initialized");
            return Err(MkError::Unknown);
        }

        intrinsic.set_cr3(rpt.pml4t_phys);
        Ok(())
    }

    /// Aliases every present PML4 entry of `src` into this RPT. The copies
    /// carry `alias = 1` and are never walked for teardown.
    ///
    /// # Safety
    ///
    /// `src` must point at a live PML4T.
    pub unsafe fn add_tables_from(&self, src: *const Pml4t) -> MkResult<()> {
        let mut rpt = self.inner.lock();
        if !rpt.initialized {
            error!("root page table not initialized");
            return Err(MkError::Unknown);
        }

        let src = unsafe { &*src };
        let dst = unsafe { &mut *rpt.pml4t };
        for (i, entry) in src.entries.iter().enumerate() {
            if entry.present() {
                let mut copy = *entry;
                copy.set_alias(true);
                dst.entries[i] = copy;
            }
        }

        Ok(())
    }

    /// Aliases every present PML4 entry of `other` into this RPT.
    pub fn add_tables(&self, other: &RootPageTable) -> MkResult<()> {
        let src = {
            let other = other.inner.lock();
            if !other.initialized {
                error!("source root page table not initialized");
                return Err(MkError::Unknown);
            }
            other.pml4t as *const Pml4t
        };

        unsafe { self.add_tables_from(src) }
    }

    /// Maps a 4 KiB leaf. Both addresses must be page aligned, `WRITE` and
    /// `EXECUTE` are mutually exclusive, and a userspace mapping may not
    /// land in a PML4 slot owned by the kernel. An address that is already
    /// mapped returns `MkError::AlreadyExists`.
    pub fn map_page(
        &self,
        page_pool: &PagePool,
        page_virt: u64,
        page_phys: PhysicalAddress,
        page_flags: MapFlags,
        auto_release: AutoRelease,
    ) -> MkResult<()> {
        let mut rpt = self.inner.lock();

        if !rpt.initialized {
            error!("root page table not initialized");
            return Err(MkError::Unknown);
        }

        if page_virt == 0 || !is_page_aligned(page_virt) {
            error!("virtual address is invalid: {:#x}", page_virt);
            return Err(MkError::InvalidParams1);
        }

        if page_phys == 0 || !is_page_aligned(page_phys) {
            error!("physical address is invalid: {:#x}", page_phys);
            return Err(MkError::InvalidParams2);
        }

        if page_flags.is_empty() {
            error!("invalid flags: {:#x}", page_flags.bits());
            return Err(MkError::InvalidParams3);
        }

        if page_flags.contains(MapFlags::WRITE) && page_flags.contains(MapFlags::EXECUTE) {
            error!("invalid page_flags: {:#x}", page_flags.bits());
            return Err(MkError::InvalidParams3);
        }

        let pml4t = unsafe { &mut *rpt.pml4t };
        let pml4te = &mut pml4t.entries[pml4_index(page_virt)];
        if !pml4te.present() {
            let table_phys = add_table(page_pool, PageTag::Pdpt)?;
            pml4te.set_phys(table_phys);
            pml4te.set_present(true);
            pml4te.set_writable(true);
            pml4te.set_user(true);
        } else if !pml4te.user() {
            // the loader never maps the kernel's own tables, so walking
            // them is impossible; kernel slots can only be aliased
            error!(
                "attempt to map the userspace address {:#x} in an address range owned by the kernel",
                page_virt
            );
            return Err(MkError::Unknown);
        }

        let pdpt = unsafe { &mut *(table_virt(page_pool, pml4te.phys())? as *mut Pdpt) };
        let pdpte = &mut pdpt.entries[pdpt_index(page_virt)];
        if !pdpte.present() {
            let table_phys = add_table(page_pool, PageTag::Pdt)?;
            pdpte.set_phys(table_phys);
            pdpte.set_present(true);
            pdpte.set_writable(true);
            pdpte.set_user(true);
        }

        let pdt = unsafe { &mut *(table_virt(page_pool, pdpte.phys())? as *mut Pdt) };
        let pdte = &mut pdt.entries[pdt_index(page_virt)];
        if !pdte.present() {
            let table_phys = add_table(page_pool, PageTag::Pt)?;
            pdte.set_phys(table_phys);
            pdte.set_present(true);
            pdte.set_writable(true);
            pdte.set_user(true);
        }

        let pt = unsafe { &mut *(table_virt(page_pool, pdte.phys())? as *mut Pt) };
        let pte = &mut pt.entries[pt_index(page_virt)];
        if pte.present() {
            error!("virtual address {:#x} already mapped", page_virt);
            return Err(MkError::AlreadyExists);
        }

        pte.set_phys(page_phys);
        pte.set_present(true);
        pte.set_user(true);
        pte.set_auto_release(auto_release);
        pte.set_writable(page_flags.contains(MapFlags::WRITE));
        pte.set_no_execute(!page_flags.contains(MapFlags::EXECUTE));

        Ok(())
    }

    /// `map_page` for callers holding unaligned addresses; rounds both
    /// down to their page.
    pub fn map_page_unaligned(
        &self,
        page_pool: &PagePool,
        page_virt: u64,
        page_phys: PhysicalAddress,
        page_flags: MapFlags,
        auto_release: AutoRelease,
    ) -> MkResult<()> {
        self.map_page(
            page_pool,
            page_aligned(page_virt),
            page_aligned(page_phys),
            page_flags,
            auto_release,
        )
    }

    /// Allocates a page from the page pool and maps it read/write at
    /// `page_virt` with the given auto-release tag. Returns the kernel
    /// virtual address of the page.
    pub fn allocate_page_rw(
        &self,
        page_pool: &PagePool,
        page_virt: u64,
        auto_release: AutoRelease,
    ) -> MkResult<NonNull<u8>> {
        self.allocate_page(page_pool, page_virt, MapFlags::READ | MapFlags::WRITE, auto_release)
    }

    /// Like `allocate_page_rw` but maps read/execute.
    pub fn allocate_page_rx(
        &self,
        page_pool: &PagePool,
        page_virt: u64,
        auto_release: AutoRelease,
    ) -> MkResult<NonNull<u8>> {
        self.allocate_page(page_pool, page_virt, MapFlags::READ | MapFlags::EXECUTE, auto_release)
    }

    fn allocate_page(
        &self,
        page_pool: &PagePool,
        page_virt: u64,
        page_flags: MapFlags,
        auto_release: AutoRelease,
    ) -> MkResult<NonNull<u8>> {
        let tag = match auto_release {
            AutoRelease::Stack => PageTag::ExtStack,
            AutoRelease::Tls => PageTag::ExtTls,
            AutoRelease::Elf => PageTag::ExtElf,
            AutoRelease::AllocHeap => PageTag::BfMemOpAllocHeap,
            _ => {
                error!("unknown tag");
                return Err(MkError::InvalidParams3);
            }
        };

        let page = page_pool.allocate(tag)?;
        let page_phys = page_pool.virt_to_phys(page.as_ptr())?;

        if let Err(e) = self.map_page(page_pool, page_virt, page_phys, page_flags, auto_release) {
            page_pool.deallocate(page, tag);
            return Err(e);
        }

        Ok(page)
    }

    /// Walks `virt` down to its leaf PTE and returns the physical frame it
    /// maps, or an error when any level is not present.
    pub fn lookup(&self, page_pool: &PagePool, virt: u64) -> MkResult<PhysicalAddress> {
        let rpt = self.inner.lock();

        if !rpt.initialized {
            error!("root page table not initialized");
            return Err(MkError::Unknown);
        }

        let pml4t = unsafe { &*rpt.pml4t };
        let pml4te = &pml4t.entries[pml4_index(virt)];
        if !pml4te.present() {
            return Err(MkError::Unknown);
        }

        let pdpt = unsafe { &*(table_virt(page_pool, pml4te.phys())? as *const Pdpt) };
        let pdpte = &pdpt.entries[pdpt_index(virt)];
        if !pdpte.present() {
            return Err(MkError::Unknown);
        }

        let pdt = unsafe { &*(table_virt(page_pool, pdpte.phys())? as *const Pdt) };
        let pdte = &pdt.entries[pdt_index(virt)];
        if !pdte.present() {
            return Err(MkError::Unknown);
        }

        let pt = unsafe { &*(table_virt(page_pool, pdte.phys())? as *const Pt) };
        let pte = &pt.entries[pt_index(virt)];
        if !pte.present() {
            return Err(MkError::Unknown);
        }

        Ok(pte.phys())
    }
}

impl Default for RootPageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn add_table(page_pool: &PagePool, tag: PageTag) -> MkResult<PhysicalAddress> {
    let table = page_pool.allocate(tag)?;
    page_pool.virt_to_phys(table.as_ptr())
}

fn table_virt(page_pool: &PagePool, phys: PhysicalAddress) -> MkResult<*mut u8> {
    page_pool.phys_to_virt(phys)
}

fn deallocate_table(page_pool: &PagePool, table: *mut u8, tag: PageTag) {
    if let Some(ptr) = NonNull::new(table) {
        page_pool.deallocate(ptr, tag);
    }
}

fn remove_pdpt(page_pool: &PagePool, huge_pool: &HugePool, pdpt_phys: PhysicalAddress) {
    let Ok(pdpt_virt) = table_virt(page_pool, pdpt_phys) else {
        error!("pdpt at {:#x} is outside the page pool", pdpt_phys);
        return;
    };

    let pdpt = unsafe { &*(pdpt_virt as *const Pdpt) };
    for pdpte in pdpt.entries.iter() {
        if pdpte.present() {
            remove_pdt(page_pool, huge_pool, pdpte.phys());
        }
    }

    deallocate_table(page_pool, pdpt_virt, PageTag::Pdpt);
}

fn remove_pdt(page_pool: &PagePool, huge_pool: &HugePool, pdt_phys: PhysicalAddress) {
    let Ok(pdt_virt) = table_virt(page_pool, pdt_phys) else {
        error!("pdt at {:#x} is outside the page pool", pdt_phys);
        return;
    };

    let pdt = unsafe { &*(pdt_virt as *const Pdt) };
    for pdte in pdt.entries.iter() {
        if pdte.present() {
            remove_pt(page_pool, huge_pool, pdte.phys());
        }
    }

    deallocate_table(page_pool, pdt_virt, PageTag::Pdt);
}

fn remove_pt(page_pool: &PagePool, huge_pool: &HugePool, pt_phys: PhysicalAddress) {
    let Ok(pt_virt) = table_virt(page_pool, pt_phys) else {
        error!("pt at {:#x} is outside the page pool", pt_phys);
        return;
    };

    let pt = unsafe { &*(pt_virt as *const Pt) };
    for pte in pt.entries.iter() {
        if !pte.present() {
            continue;
        }

        match pte.auto_release() {
            Some(AutoRelease::NoAutoRelease) => {}
            Some(AutoRelease::AllocPage) => {
                release_to_page_pool(page_pool, pte.phys(), PageTag::BfMemOpAllocPage);
            }
            Some(AutoRelease::AllocHuge) => {
                if let Ok(virt) = huge_pool.phys_to_virt(pte.phys()) {
                    if let Some(ptr) = NonNull::new(virt) {
                        let _ = huge_pool.deallocate_page(ptr);
                    }
                } else {
                    error!("huge page at {:#x} is outside the huge pool", pte.phys());
                }
            }
            Some(AutoRelease::AllocHeap) => {
                release_to_page_pool(page_pool, pte.phys(), PageTag::BfMemOpAllocHeap);
            }
            Some(AutoRelease::Stack) => {
                release_to_page_pool(page_pool, pte.phys(), PageTag::ExtStack);
            }
            Some(AutoRelease::Tls) => {
                release_to_page_pool(page_pool, pte.phys(), PageTag::ExtTls);
            }
            Some(AutoRelease::Elf) => {
                release_to_page_pool(page_pool, pte.phys(), PageTag::ExtElf);
            }
            None => {
                error!("unknown tag");
            }
        }
    }

    deallocate_table(page_pool, pt_virt, PageTag::Pt);
}

fn release_to_page_pool(page_pool: &PagePool, phys: PhysicalAddress, tag: PageTag) {
    match page_pool.phys_to_virt(phys) {
        Ok(virt) => {
            if let Some(ptr) = NonNull::new(virt) {
                page_pool.deallocate(ptr, tag);
            }
        }
        Err(_) => {
            error!("auto-release page at {:#x} is outside the page pool", phys);
        }
    }
}
