//! The extension object
//!
//! An extension is the one privileged user-mode program the kernel hosts.
//! This object owns everything given to it: its main root page table (the
//! microkernel mapping aliased in, plus its ELF segments, per-PP stacks and
//! TLS blocks), its per-VM direct-map RPTs, its heap cursor, its registered
//! callback entry points and its handle.
//!
//! Memory model: page and huge allocations always land in VM 0's direct
//! map at `EXT_PAGE_POOL_ADDR + phys`. VM 0 can never be destroyed, so
//! those mappings tear down exactly once, with the extension itself. When
//! some other VM is active, touching such an address page-faults and the
//! fault handler direct-maps the same physical page into that VM's RPT
//! with no auto-release tag, so nothing is ever freed twice. Heap memory
//! must be virtually contiguous, so it lives in the main RPT instead, and
//! growing it re-aliases any fresh PML4 slots into every live direct map.

use crate::config::{
    EXT_CODE_ADDR, EXT_CODE_SIZE, EXT_DIRECT_MAP_ADDR, EXT_DIRECT_MAP_SIZE, EXT_HEAP_POOL_ADDR,
    EXT_HEAP_POOL_SIZE, EXT_PAGE_POOL_ADDR, EXT_STACK_ADDR, EXT_STACK_SIZE, EXT_TLS_ADDR,
    EXT_TLS_SIZE, MAX_EXTS, MAX_VMS,
};
use crate::elf::{ElfImage, Segment, PF_X};
use crate::error;
use crate::huge_pool::HugePool;
use crate::page_pool::{PagePool, PageTag};
use crate::root_page_table::RootPageTable;
use crate::status::{MkError, MkResult};
use crate::tls::Tls;
use nanovisor_hal::abi::{bf_is_spec_supported, BF_ALL_SPECS_SUPPORTED_VAL};
use nanovisor_hal::memory::{page_aligned, MapFlags, PAGE_SIZE};
use nanovisor_hal::paging::AutoRelease;
use nanovisor_hal::Intrinsic;
use spin::Mutex;

#[derive(Default)]
struct ExtState {
    initialized: bool,
    started: bool,
    entry_ip: u64,
    bootstrap_ip: u64,
    vmexit_ip: u64,
    fail_ip: u64,
    handle: u64,
    heap_crsr: u64,
}

/// One extension
pub struct Extension {
    id: u16,
    main_rpt: RootPageTable,
    direct_map_rpts: [RootPageTable; MAX_VMS],
    state: Mutex<ExtState>,
}

impl Extension {
    fn new(id: u16) -> Self {
        Self {
            id,
            main_rpt: RootPageTable::new(),
            direct_map_rpts: core::array::from_fn(|_| RootPageTable::new()),
            state: Mutex::new(ExtState::default()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// The extension's main root page table. Shared across every VM; the
    /// per-VM direct maps alias it.
    pub fn main_rpt(&self) -> &RootPageTable {
        &self.main_rpt
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// True once the extension's entry point has returned.
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    // ------------------------------------------------------------------
    // initialization
    // ------------------------------------------------------------------

    /// Loads the extension: validates the ELF image, builds the main RPT
    /// (system aliases + segments + stacks + TLS blocks), creates VM 0's
    /// direct map and records the entry point.
    pub fn initialize(
        &self,
        tls: &Tls,
        page_pool: &PagePool,
        huge_pool: &HugePool,
        system_rpt: &RootPageTable,
        elf_file: &[u8],
    ) -> MkResult<()> {
        {
            let state = self.state.lock();
            if state.initialized {
                error!("ext {:#x} already initialized", self.id);
                return Err(MkError::Unknown);
            }
        }

        let image = ElfImage::parse(elf_file)?;
        validate_address_windows(&image)?;

        if let Err(e) = self.initialize_rpt(tls, page_pool, system_rpt, &image) {
            self.main_rpt.release(page_pool, huge_pool);
            return Err(e);
        }

        if let Err(e) = self.initialize_direct_map_rpt(page_pool, &self.direct_map_rpts[0]) {
            if self.direct_map_rpts[0].is_initialized() {
                self.direct_map_rpts[0].release(page_pool, huge_pool);
            }
            self.main_rpt.release(page_pool, huge_pool);
            return Err(e);
        }

        let mut state = self.state.lock();
        state.entry_ip = image.entry;
        state.initialized = true;

        Ok(())
    }

    fn initialize_rpt(
        &self,
        tls: &Tls,
        page_pool: &PagePool,
        system_rpt: &RootPageTable,
        image: &ElfImage<'_>,
    ) -> MkResult<()> {
        self.main_rpt.initialize(page_pool)?;
        self.main_rpt.add_tables(system_rpt)?;
        self.add_segments(page_pool, image)?;
        self.apply_relocations(page_pool, image)?;
        self.add_stacks(tls, page_pool)?;
        self.add_tls_blocks(tls, page_pool, image)?;

        Ok(())
    }

    fn initialize_direct_map_rpt(&self, page_pool: &PagePool, rpt: &RootPageTable) -> MkResult<()> {
        rpt.initialize(page_pool)?;
        rpt.add_tables(&self.main_rpt)
    }

    /// Maps each PT_LOAD segment page by page and copies the file bytes
    /// in. Pages carry the `Elf` auto-release tag.
    fn add_segments(&self, page_pool: &PagePool, image: &ElfImage<'_>) -> MkResult<()> {
        for seg in image.segments.iter() {
            let bytes = image.segment_bytes(seg)?;
            let executable = (seg.flags & PF_X) != 0;

            let seg_end = seg.vaddr + seg.memsz;
            let mut page_virt = page_aligned(seg.vaddr);

            while page_virt < seg_end {
                let page = if executable {
                    self.main_rpt.allocate_page_rx(page_pool, page_virt, AutoRelease::Elf)?
                } else {
                    self.main_rpt.allocate_page_rw(page_pool, page_virt, AutoRelease::Elf)?
                };

                let copy_start = page_virt.max(seg.vaddr);
                let copy_end = (page_virt + PAGE_SIZE as u64).min(seg.vaddr + seg.filesz);
                if copy_end > copy_start {
                    let dst_off = (copy_start - page_virt) as usize;
                    let src_off = (copy_start - seg.vaddr) as usize;
                    let len = (copy_end - copy_start) as usize;

                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            bytes[src_off..src_off + len].as_ptr(),
                            page.as_ptr().add(dst_off),
                            len,
                        );
                    }
                }

                page_virt += PAGE_SIZE as u64;
            }
        }

        Ok(())
    }

    /// Applies the image's `R_X86_64_RELATIVE` relocations. Targets are
    /// resolved through the freshly built RPT, so this must run after
    /// `add_segments`.
    fn apply_relocations(&self, page_pool: &PagePool, image: &ElfImage<'_>) -> MkResult<()> {
        for i in 0..image.relocation_count() {
            let rela = image.relocation(i)?;

            if rela.offset < EXT_CODE_ADDR || rela.offset >= EXT_CODE_ADDR + EXT_CODE_SIZE {
                error!("relocation target {:#x} is outside the image", rela.offset);
                return Err(MkError::Unsupported);
            }

            let offset_in_page = (rela.offset & (PAGE_SIZE as u64 - 1)) as usize;
            if offset_in_page + 8 > PAGE_SIZE {
                error!("relocation target {:#x} straddles a page", rela.offset);
                return Err(MkError::Unsupported);
            }

            let phys = self.main_rpt.lookup(page_pool, page_aligned(rela.offset))?;
            let page = page_pool.phys_to_virt(phys)?;

            unsafe {
                (page.add(offset_in_page) as *mut u64).write_unaligned(rela.addend);
            }
        }

        Ok(())
    }

    fn add_stack(&self, page_pool: &PagePool, addr: u64) -> MkResult<()> {
        let mut bytes = 0u64;
        while bytes < EXT_STACK_SIZE {
            self.main_rpt.allocate_page_rw(page_pool, addr + bytes, AutoRelease::Stack)?;
            bytes += PAGE_SIZE as u64;
        }

        Ok(())
    }

    /// One stack per online PP, a guard page of unmapped space between
    /// them.
    fn add_stacks(&self, tls: &Tls, page_pool: &PagePool) -> MkResult<()> {
        for pp in 0..u64::from(tls.online_pps) {
            let offs = (EXT_STACK_SIZE + PAGE_SIZE as u64) * pp;
            self.add_stack(page_pool, EXT_STACK_ADDR + offs)?;
        }

        Ok(())
    }

    fn add_tls_block(
        &self,
        page_pool: &PagePool,
        addr_usr: u64,
        addr_abi: u64,
        image: &ElfImage<'_>,
    ) -> MkResult<()> {
        let page_usr = self.main_rpt.allocate_page_rw(page_pool, addr_usr, AutoRelease::Tls)?;
        let page_abi = self.main_rpt.allocate_page_rw(page_pool, addr_abi, AutoRelease::Tls)?;

        // the ABI page's first qword is its own address, which is what the
        // thread pointer ABI expects at fs:0
        unsafe { (page_abi.as_ptr() as *mut u64).write(addr_abi) };

        if let Some(tls_seg) = &image.tls {
            let bytes = image.segment_bytes(tls_seg)?;
            let dst_index = PAGE_SIZE - tls_seg.memsz as usize;

            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    page_usr.as_ptr().add(dst_index),
                    tls_seg.filesz as usize,
                );
            }
        }

        Ok(())
    }

    fn add_tls_blocks(
        &self,
        tls: &Tls,
        page_pool: &PagePool,
        image: &ElfImage<'_>,
    ) -> MkResult<()> {
        for pp in 0..u64::from(tls.online_pps) {
            let offs = (EXT_TLS_SIZE + PAGE_SIZE as u64) * pp;
            let addr = EXT_TLS_ADDR + offs;
            self.add_tls_block(page_pool, addr, addr + PAGE_SIZE as u64, image)?;
        }

        Ok(())
    }

    /// Releases everything this extension owns.
    pub fn release(&self, page_pool: &PagePool, huge_pool: &HugePool) {
        {
            let mut state = self.state.lock();
            *state = ExtState::default();
        }

        for rpt in self.direct_map_rpts.iter() {
            if rpt.is_initialized() {
                rpt.release(page_pool, huge_pool);
            }
        }

        if self.main_rpt.is_initialized() {
            self.main_rpt.release(page_pool, huge_pool);
        }
    }

    // ------------------------------------------------------------------
    // callbacks and handle
    // ------------------------------------------------------------------

    pub fn bootstrap_ip(&self) -> u64 {
        self.state.lock().bootstrap_ip
    }

    pub fn set_bootstrap_ip(&self, ip: u64) {
        self.state.lock().bootstrap_ip = ip;
    }

    pub fn vmexit_ip(&self) -> u64 {
        self.state.lock().vmexit_ip
    }

    pub fn set_vmexit_ip(&self, ip: u64) {
        self.state.lock().vmexit_ip = ip;
    }

    pub fn fail_ip(&self) -> u64 {
        self.state.lock().fail_ip
    }

    pub fn set_fail_ip(&self, ip: u64) {
        self.state.lock().fail_ip = ip;
    }

    /// Opens the extension's handle: id + 1, cached until closed. The
    /// version word is the extension declaring which ABI generations it
    /// understands.
    pub fn open_handle(&self, version: u32) -> MkResult<u64> {
        if !bf_is_spec_supported(version) {
            error!("unsupported ABI version: {:#x}", version);
            return Err(MkError::Unsupported);
        }

        let mut state = self.state.lock();
        if state.handle != 0 {
            error!("handle already opened");
            return Err(MkError::Unknown);
        }

        state.handle = u64::from(self.id) + 1;
        Ok(state.handle)
    }

    pub fn close_handle(&self) {
        self.state.lock().handle = 0;
    }

    pub fn is_handle_open(&self) -> bool {
        self.state.lock().handle != 0
    }

    pub fn is_handle_valid(&self, handle: u64) -> bool {
        let state = self.state.lock();
        state.handle != 0 && state.handle == handle
    }

    // ------------------------------------------------------------------
    // memory on behalf of the extension
    // ------------------------------------------------------------------

    /// Allocates one page into VM 0's direct map. Returns (virt, phys).
    pub fn alloc_page(&self, page_pool: &PagePool) -> MkResult<(u64, u64)> {
        if !self.is_initialized() {
            error!("ext {:#x} not initialized", self.id);
            return Err(MkError::Unknown);
        }

        let page = page_pool.allocate(PageTag::BfMemOpAllocPage)?;
        let phys = match page_pool.virt_to_phys(page.as_ptr()) {
            Ok(phys) => phys,
            Err(e) => {
                page_pool.deallocate(page, PageTag::BfMemOpAllocPage);
                return Err(e);
            }
        };

        let virt = EXT_PAGE_POOL_ADDR + phys;
        if let Err(e) = self.direct_map_rpts[0].map_page(
            page_pool,
            virt,
            phys,
            MapFlags::READ | MapFlags::WRITE,
            AutoRelease::AllocPage,
        ) {
            page_pool.deallocate(page, PageTag::BfMemOpAllocPage);
            return Err(e);
        }

        Ok((virt, phys))
    }

    /// The kernel never unmaps direct-map pages early; teardown reclaims
    /// them. Kept well-formed in the ABI and refused here.
    pub fn free_page(&self, _page_virt: u64) -> MkResult<()> {
        error!("free_page is currently unsupported");
        Err(MkError::Unsupported)
    }

    /// Allocates a physically contiguous block into VM 0's direct map.
    /// `size` must be a page multiple. Returns (virt, phys).
    pub fn alloc_huge(
        &self,
        page_pool: &PagePool,
        huge_pool: &HugePool,
        size: u64,
    ) -> MkResult<(u64, u64)> {
        if !self.is_initialized() {
            error!("ext {:#x} not initialized", self.id);
            return Err(MkError::Unknown);
        }

        if size == 0 || size % PAGE_SIZE as u64 != 0 {
            error!("invalid size: {:#x}", size);
            return Err(MkError::InvalidParams1);
        }

        let pages = (size / PAGE_SIZE as u64) as usize;
        let block = huge_pool.allocate(pages)?;
        let phys = huge_pool.virt_to_phys(block.as_ptr())?;
        let virt = EXT_PAGE_POOL_ADDR + phys;

        for i in 0..pages as u64 {
            let offs = i * PAGE_SIZE as u64;
            self.direct_map_rpts[0].map_page(
                page_pool,
                virt + offs,
                phys + offs,
                MapFlags::READ | MapFlags::WRITE,
                AutoRelease::AllocHuge,
            )?;
        }

        Ok((virt, phys))
    }

    /// See `free_page`.
    pub fn free_huge(&self, _huge_virt: u64) -> MkResult<()> {
        error!("free_huge is currently unsupported");
        Err(MkError::Unsupported)
    }

    /// Grows the heap by whole pages and returns the previous break. Fresh
    /// PML4 slots are re-aliased into every live direct map so the heap
    /// stays visible from every VM.
    pub fn alloc_heap(&self, page_pool: &PagePool, size: u64) -> MkResult<u64> {
        if !self.is_initialized() {
            error!("ext {:#x} not initialized", self.id);
            return Err(MkError::Unknown);
        }

        if size == 0 {
            error!("invalid size: {:#x}", size);
            return Err(MkError::InvalidParams1);
        }

        let pages = size.div_ceil(PAGE_SIZE as u64);
        let bytes = match pages.checked_mul(PAGE_SIZE as u64) {
            Some(bytes) => bytes,
            None => {
                error!("invalid size: {:#x}", size);
                return Err(MkError::InvalidParams1);
            }
        };

        let mut state = self.state.lock();
        if state.heap_crsr.saturating_add(bytes) > EXT_HEAP_POOL_SIZE {
            error!("the extension's heap pool is out of memory");
            return Err(MkError::OutOfMemory);
        }

        let previous_heap_virt = EXT_HEAP_POOL_ADDR + state.heap_crsr;

        for _ in 0..pages {
            let page_virt = EXT_HEAP_POOL_ADDR + state.heap_crsr;
            self.main_rpt.allocate_page_rw(page_pool, page_virt, AutoRelease::AllocHeap)?;
            state.heap_crsr += PAGE_SIZE as u64;
        }

        drop(state);
        self.update_direct_map_rpts()?;

        Ok(previous_heap_virt)
    }

    fn update_direct_map_rpts(&self) -> MkResult<()> {
        for rpt in self.direct_map_rpts.iter() {
            if rpt.is_initialized() {
                rpt.add_tables(&self.main_rpt)?;
            }
        }

        Ok(())
    }

    /// Page-fault service for the direct map: lazily maps the faulting
    /// address into the active VM's direct map with no auto-release, so a
    /// physical page shared across VMs is only ever freed through VM 0.
    pub fn map_page_direct(&self, tls: &Tls, page_pool: &PagePool, page_virt: u64) -> MkResult<()> {
        if page_virt < EXT_DIRECT_MAP_ADDR
            || page_virt >= EXT_DIRECT_MAP_ADDR + EXT_DIRECT_MAP_SIZE
        {
            return Err(MkError::Unknown);
        }

        let rpt = self
            .direct_map_rpts
            .get(tls.active_vmid as usize)
            .ok_or(MkError::Unknown)?;

        match rpt.map_page_unaligned(
            page_pool,
            page_virt,
            page_virt - EXT_DIRECT_MAP_ADDR,
            MapFlags::READ | MapFlags::WRITE,
            AutoRelease::NoAutoRelease,
        ) {
            Ok(()) | Err(MkError::AlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // VM lifecycle notifications
    // ------------------------------------------------------------------

    /// A VM was created: bring up its direct-map RPT.
    pub fn signal_vm_created(&self, page_pool: &PagePool, vmid: u16) -> MkResult<()> {
        if !self.is_initialized() {
            error!("ext {:#x} not initialized", self.id);
            return Err(MkError::Unknown);
        }

        let rpt = match self.direct_map_rpts.get(vmid as usize) {
            Some(rpt) => rpt,
            None => {
                error!("vmid {:#x} is invalid or greater than the MAX_VMS {:#x}", vmid, MAX_VMS);
                return Err(MkError::InvalidParams1);
            }
        };

        self.initialize_direct_map_rpt(page_pool, rpt)
    }

    /// A VM was destroyed: tear down its direct-map RPT, returning every
    /// auto-released page it held.
    pub fn signal_vm_destroyed(
        &self,
        page_pool: &PagePool,
        huge_pool: &HugePool,
        vmid: u16,
    ) -> MkResult<()> {
        if !self.is_initialized() {
            error!("ext {:#x} not initialized", self.id);
            return Err(MkError::Unknown);
        }

        let rpt = match self.direct_map_rpts.get(vmid as usize) {
            Some(rpt) => rpt,
            None => {
                error!("vmid {:#x} is invalid or greater than the MAX_VMS {:#x}", vmid, MAX_VMS);
                return Err(MkError::InvalidParams1);
            }
        };

        rpt.release(page_pool, huge_pool);
        Ok(())
    }

    // ------------------------------------------------------------------
    // execution
    // ------------------------------------------------------------------

    /// Enters the extension at `ip` with two SysV arguments, on the
    /// active VM's direct-map RPT. Returns when the extension hands
    /// control back through the run path.
    pub fn execute(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        ip: u64,
        arg0: u64,
        arg1: u64,
    ) -> MkResult<()> {
        if !self.is_initialized() {
            error!("ext {:#x} not initialized", self.id);
            return Err(MkError::Unknown);
        }

        if ip == 0 {
            error!("invalid instruction pointer");
            return Err(MkError::InvalidParams1);
        }

        let rpt = self
            .direct_map_rpts
            .get(tls.active_vmid as usize)
            .ok_or(MkError::Unknown)?;
        if !rpt.is_initialized() {
            error!("invalid active_vmid: {:#x}", tls.active_vmid);
            return Err(MkError::Unknown);
        }

        let rpt_phys = rpt.pml4t_phys()?;
        if tls.active_rpt_phys != rpt_phys {
            rpt.activate(intrinsic)?;
            tls.active_rpt_phys = rpt_phys;
        }

        tls.active_extid = self.id;

        intrinsic.call_ext(tls, ip, arg0, arg1).map_err(|_| MkError::Unknown)
    }

    /// Runs the extension's `_start`, passing the supported-ABI token.
    pub fn start(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic) -> MkResult<()> {
        let entry_ip = self.state.lock().entry_ip;
        self.execute(tls, intrinsic, entry_ip, u64::from(BF_ALL_SPECS_SUPPORTED_VAL), 0)?;
        self.state.lock().started = true;

        Ok(())
    }

    /// Enters the bootstrap callback with the caller's PP id.
    pub fn bootstrap(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic) -> MkResult<()> {
        let bootstrap_ip = self.state.lock().bootstrap_ip;
        if bootstrap_ip == 0 {
            error!("a bootstrap handler was never registered");
            return Err(MkError::Unknown);
        }

        let ppid = u64::from(tls.ppid);
        self.execute(tls, intrinsic, bootstrap_ip, ppid, 0)
    }

    /// Enters the VMExit callback with the active VPS and the exit reason.
    pub fn vmexit(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic, exit_reason: u64) -> MkResult<()> {
        let vmexit_ip = self.state.lock().vmexit_ip;
        if vmexit_ip == 0 {
            error!("a vmexit handler was never registered");
            return Err(MkError::Unknown);
        }

        let active_vpsid = u64::from(tls.active_vpsid);
        self.execute(tls, intrinsic, vmexit_ip, active_vpsid, exit_reason)
    }

    /// Enters the fail callback with a status word.
    pub fn fail(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic, status: u64) -> MkResult<()> {
        let fail_ip = self.state.lock().fail_ip;
        if fail_ip == 0 {
            error!("a fail handler was never registered");
            return Err(MkError::Unknown);
        }

        self.execute(tls, intrinsic, fail_ip, status, 0)
    }
}

fn validate_address_windows(image: &ElfImage<'_>) -> MkResult<()> {
    for seg in image.segments.iter() {
        if !segment_in_code_window(seg) {
            error!("ELF load segment virtual address not supported");
            return Err(MkError::Unsupported);
        }
    }

    if let Some(tls_seg) = &image.tls {
        if !segment_in_code_window(tls_seg) {
            error!("ELF TLS segment virtual address not supported");
            return Err(MkError::Unsupported);
        }
    }

    if image.entry < EXT_CODE_ADDR || image.entry >= EXT_CODE_ADDR + EXT_CODE_SIZE {
        error!("ELF entry point not supported");
        return Err(MkError::Unsupported);
    }

    Ok(())
}

fn segment_in_code_window(seg: &Segment) -> bool {
    seg.vaddr >= EXT_CODE_ADDR
        && seg.memsz <= EXT_CODE_SIZE
        && seg
            .vaddr
            .checked_add(seg.memsz)
            .map_or(false, |end| end <= EXT_CODE_ADDR + EXT_CODE_SIZE)
}

/// The extension pool
pub struct ExtPool {
    exts: [Extension; MAX_EXTS],
}

impl ExtPool {
    pub fn new() -> Self {
        Self { exts: core::array::from_fn(|i| Extension::new(i as u16)) }
    }

    /// Loads one extension per provided ELF image, up to `MAX_EXTS`.
    pub fn initialize(
        &self,
        tls: &Tls,
        page_pool: &PagePool,
        huge_pool: &HugePool,
        system_rpt: &RootPageTable,
        elf_files: &[&[u8]],
    ) -> MkResult<()> {
        if elf_files.is_empty() {
            error!("no extension images were provided");
            return Err(MkError::InvalidParams1);
        }

        for (ext, file) in self.exts.iter().zip(elf_files.iter()) {
            ext.initialize(tls, page_pool, huge_pool, system_rpt, file)?;
        }

        Ok(())
    }

    pub fn get(&self, extid: u16) -> MkResult<&Extension> {
        let Some(ext) = self.exts.get(extid as usize) else {
            error!("extid {:#x} is greater than the MAX_EXTS {:#x}", extid, MAX_EXTS);
            return Err(MkError::InvalidParams1);
        };

        if !ext.is_initialized() {
            error!("ext {:#x} not initialized", extid);
            return Err(MkError::Unknown);
        }

        Ok(ext)
    }

    /// Runs every initialized extension's `_start` on the BSP.
    pub fn start(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic) -> MkResult<()> {
        for ext in self.exts.iter() {
            if ext.is_initialized() {
                ext.start(tls, intrinsic)?;
            }
        }

        Ok(())
    }

    /// Runs every started extension's bootstrap callback on this PP.
    pub fn bootstrap(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic) -> MkResult<()> {
        for ext in self.exts.iter() {
            if ext.is_initialized() {
                ext.bootstrap(tls, intrinsic)?;
            }
        }

        Ok(())
    }

    /// Fans a VM-created notification out to every initialized extension.
    pub fn signal_vm_created(&self, page_pool: &PagePool, vmid: u16) -> MkResult<()> {
        for ext in self.exts.iter() {
            if ext.is_initialized() {
                ext.signal_vm_created(page_pool, vmid)?;
            }
        }

        Ok(())
    }

    /// Fans a VM-destroyed notification out to every initialized
    /// extension.
    pub fn signal_vm_destroyed(
        &self,
        page_pool: &PagePool,
        huge_pool: &HugePool,
        vmid: u16,
    ) -> MkResult<()> {
        for ext in self.exts.iter() {
            if ext.is_initialized() {
                ext.signal_vm_destroyed(page_pool, huge_pool, vmid)?;
            }
        }

        Ok(())
    }
}

impl Default for ExtPool {
    fn default() -> Self {
        Self::new()
    }
}
