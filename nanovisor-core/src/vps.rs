//! The kernel's notion of a VPS
//!
//! One VPS owns one 4 KiB hardware structure, an Intel VMCS or an AMD
//! VMCB, plus the "missing registers" block holding the GPRs the hardware
//! does not save across a guest entry. The backend is a sum type chosen at
//! create time from the CPU vendor; both variants always compile.
//!
//! The hardware structure can be loaded on at most one PP at a time.
//! Changing PPs requires a `clear` first, reads and writes require the VPS
//! to be loadable on the current PP, and `migrate` only changes the
//! assignment; the next load performs the actual move and invalidates the
//! stale VPID/ASID state.

use core::ptr::NonNull;

use crate::config::MAX_PPS;
use crate::config::MAX_VPSS;
use crate::error;
use crate::page_pool::{PagePool, PageTag};
use crate::pool::{AllocatedStatus, ObjectPool};
use crate::status::{MkError, MkResult};
use crate::tls::Tls;
use nanovisor_hal::abi::{BfReg, BF_INVALID_ID};
use nanovisor_hal::arch::x86_64::{vmcb, vmcs};
use nanovisor_hal::intrinsic::{MissingRegisters, Vendor};
use nanovisor_hal::state::StateSave;
use nanovisor_hal::Intrinsic;

/// Which hardware structure backs a VPS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpsBackend {
    /// Intel VT-x: a VMCS driven through VMREAD/VMWRITE
    Intel,
    /// AMD SVM: a VMCB driven through structured memory access
    Amd,
}

impl From<Vendor> for VpsBackend {
    fn from(v: Vendor) -> Self {
        match v {
            Vendor::Intel => Self::Intel,
            Vendor::Amd => Self::Amd,
        }
    }
}

/// MSRs Intel keeps outside the VMCS; tracked in software per VPS.
#[derive(Debug, Default, Clone, Copy)]
struct SwMsrs {
    star: u64,
    lstar: u64,
    cstar: u64,
    fmask: u64,
    kernel_gs_base: u64,
}

/// One VPS
pub struct Vps {
    id: u16,
    status: AllocatedStatus,
    assigned_vpid: u16,
    assigned_ppid: u16,
    active_ppid: u16,
    loaded_on_ppid: u16,
    backend: VpsBackend,
    hw_page: *mut u8,
    hw_phys: u64,
    launched: bool,
    needs_invalidation: bool,
    regs: MissingRegisters,
    // guest state with no VMCS field; the VMCB has slots for these
    cr2: u64,
    dr6: u64,
    msrs: SwMsrs,
}

// hw_page references page-pool memory and is only touched under the
// object's pool lock
unsafe impl Send for Vps {}

impl Vps {
    fn new(id: u16) -> Self {
        Self {
            id,
            status: AllocatedStatus::Unallocated,
            assigned_vpid: BF_INVALID_ID,
            assigned_ppid: BF_INVALID_ID,
            active_ppid: BF_INVALID_ID,
            loaded_on_ppid: BF_INVALID_ID,
            backend: VpsBackend::Intel,
            hw_page: core::ptr::null_mut(),
            hw_phys: 0,
            launched: false,
            needs_invalidation: false,
            regs: MissingRegisters::default(),
            cr2: 0,
            dr6: 0,
            msrs: SwMsrs::default(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_allocated(&self) -> bool {
        self.status == AllocatedStatus::Allocated
    }

    pub fn is_zombie(&self) -> bool {
        self.status == AllocatedStatus::Zombie
    }

    pub fn assigned_vp(&self) -> u16 {
        self.assigned_vpid
    }

    pub fn assigned_pp(&self) -> u16 {
        self.assigned_ppid
    }

    pub fn loaded_on(&self) -> u16 {
        self.loaded_on_ppid
    }

    pub fn is_active(&self) -> bool {
        self.active_ppid != BF_INVALID_ID
    }

    /// Allocates the hardware page, stamps the VMCS revision id (Intel)
    /// and records the VP/PP assignment.
    fn allocate(
        &mut self,
        intrinsic: &dyn Intrinsic,
        page_pool: &PagePool,
        vpid: u16,
        ppid: u16,
    ) -> MkResult<()> {
        match self.status {
            AllocatedStatus::Unallocated => {}
            AllocatedStatus::Allocated => {
                error!("vps {:#x} was already allocated", self.id);
                return Err(MkError::Unknown);
            }
            AllocatedStatus::Zombie => {
                error!("vps {:#x} is a zombie", self.id);
                return Err(MkError::Unknown);
            }
        }

        let page = page_pool.allocate(PageTag::VmcsVmcb)?;
        let phys = match page_pool.virt_to_phys(page.as_ptr()) {
            Ok(phys) => phys,
            Err(e) => {
                page_pool.deallocate(page, PageTag::VmcsVmcb);
                return Err(e);
            }
        };

        self.backend = VpsBackend::from(intrinsic.vendor());
        self.hw_page = page.as_ptr();
        self.hw_phys = phys;

        if self.backend == VpsBackend::Intel {
            let revision = match intrinsic.rdmsr(vmcs::IA32_VMX_BASIC) {
                Ok(basic) => (basic & vmcs::VMX_BASIC_REVISION_MASK) as u32,
                Err(_) => {
                    page_pool.deallocate(page, PageTag::VmcsVmcb);
                    self.hw_page = core::ptr::null_mut();
                    self.hw_phys = 0;
                    error!("IA32_VMX_BASIC could not be read");
                    return Err(MkError::Unknown);
                }
            };

            unsafe { (self.hw_page as *mut u32).write_volatile(revision) };
            let _ = intrinsic.vmclear(self.hw_phys);
        }

        self.assigned_vpid = vpid;
        self.assigned_ppid = ppid;
        self.active_ppid = BF_INVALID_ID;
        self.loaded_on_ppid = BF_INVALID_ID;
        self.launched = false;
        self.needs_invalidation = false;
        self.regs = MissingRegisters::default();
        self.cr2 = 0;
        self.dr6 = 0;
        self.msrs = SwMsrs::default();
        self.status = AllocatedStatus::Allocated;

        Ok(())
    }

    fn deallocate(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        page_pool: &PagePool,
    ) -> MkResult<()> {
        if self.status != AllocatedStatus::Allocated {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.active_ppid != BF_INVALID_ID {
            error!("vps {:#x} is still active and cannot be deallocated", self.id);
            self.status = AllocatedStatus::Zombie;
            return Err(MkError::Unknown);
        }

        if self.loaded_on_ppid != BF_INVALID_ID && self.loaded_on_ppid != tls.ppid {
            // the hardware state cannot be proven quiescent from here
            error!("vps {:#x} is loaded on pp {:#x}", self.id, self.loaded_on_ppid);
            self.status = AllocatedStatus::Zombie;
            return Err(MkError::Unknown);
        }

        if self.loaded_on_ppid == tls.ppid {
            let _ = intrinsic.vmclear(self.hw_phys);
            if tls.loaded_vpsid == self.id {
                tls.loaded_vpsid = BF_INVALID_ID;
            }
        }

        if let Some(page) = NonNull::new(self.hw_page) {
            page_pool.deallocate(page, PageTag::VmcsVmcb);
        }

        self.hw_page = core::ptr::null_mut();
        self.hw_phys = 0;
        self.assigned_vpid = BF_INVALID_ID;
        self.assigned_ppid = BF_INVALID_ID;
        self.loaded_on_ppid = BF_INVALID_ID;
        self.launched = false;
        self.status = AllocatedStatus::Unallocated;

        Ok(())
    }

    pub fn set_active(&mut self, tls: &mut Tls) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if tls.active_vpsid != BF_INVALID_ID {
            error!("vps {:#x} is still active on pp {:#x}", tls.active_vpsid, tls.ppid);
            return Err(MkError::Unknown);
        }

        if self.active_ppid != BF_INVALID_ID {
            error!("vps {:#x} is already active", self.id);
            return Err(MkError::Unknown);
        }

        self.active_ppid = tls.ppid;
        tls.active_vpsid = self.id;

        Ok(())
    }

    pub fn set_inactive(&mut self, tls: &mut Tls) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if tls.active_vpsid != self.id || self.active_ppid == BF_INVALID_ID {
            error!("vps {:#x} is not active", self.id);
            return Err(MkError::Unknown);
        }

        self.active_ppid = BF_INVALID_ID;
        tls.active_vpsid = BF_INVALID_ID;

        Ok(())
    }

    /// Makes this VPS's hardware structure current on the calling PP.
    /// Fails while it is loaded on a different PP; `clear` is the only way
    /// off that PP.
    fn ensure_loaded(&mut self, tls: &mut Tls, intrinsic: &dyn Intrinsic) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.loaded_on_ppid != BF_INVALID_ID && self.loaded_on_ppid != tls.ppid {
            error!(
                "vps {:#x} is loaded on pp {:#x} and cannot be used on pp {:#x} without a clear",
                self.id, self.loaded_on_ppid, tls.ppid
            );
            return Err(MkError::Unknown);
        }

        if tls.loaded_vpsid != self.id {
            intrinsic.vmload(self.hw_phys)?;
            tls.loaded_vpsid = self.id;
        }

        self.loaded_on_ppid = tls.ppid;

        if self.needs_invalidation {
            match self.backend {
                VpsBackend::Intel => {
                    // single-context invalidation of this VPS's VPID
                    intrinsic.invvpid(0, self.id.wrapping_add(1), 1);
                }
                VpsBackend::Amd => {
                    intrinsic.invlpga(0, u64::from(self.id.wrapping_add(1)));
                }
            }
            self.needs_invalidation = false;
        }

        Ok(())
    }

    /// Flushes the hardware structure and detaches it from its PP. After
    /// this the VPS is safe to migrate, and the next `run` uses VMLAUNCH
    /// again.
    pub fn clear(&mut self, tls: &mut Tls, intrinsic: &dyn Intrinsic) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.loaded_on_ppid != BF_INVALID_ID && self.loaded_on_ppid != tls.ppid {
            error!("vps {:#x} is loaded on pp {:#x}", self.id, self.loaded_on_ppid);
            return Err(MkError::Unknown);
        }

        intrinsic.vmclear(self.hw_phys)?;

        if tls.loaded_vpsid == self.id {
            tls.loaded_vpsid = BF_INVALID_ID;
        }

        self.loaded_on_ppid = BF_INVALID_ID;
        self.launched = false;

        Ok(())
    }

    /// Rebinds this VPS to another PP. Requires a prior `clear`; forces a
    /// VPID/ASID invalidate on the next load.
    pub fn migrate(&mut self, tls: &Tls, ppid: u16) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.active_ppid != BF_INVALID_ID {
            error!("vps {:#x} is currently active and cannot be migrated", self.id);
            return Err(MkError::Unknown);
        }

        if self.loaded_on_ppid != BF_INVALID_ID {
            error!("vps {:#x} must be cleared before it can be migrated", self.id);
            return Err(MkError::Unknown);
        }

        if ppid >= tls.online_pps || ppid as usize >= MAX_PPS {
            error!("pp {:#x} is out of range", ppid);
            return Err(MkError::InvalidParams2);
        }

        self.assigned_ppid = ppid;
        self.needs_invalidation = true;
        self.launched = false;

        Ok(())
    }

    // ------------------------------------------------------------------
    // field access by architectural index
    // ------------------------------------------------------------------

    fn vmcb_read<T: Copy>(&self, index: u64) -> MkResult<T> {
        let size = core::mem::size_of::<T>();
        let offset = index as usize;
        if index >= vmcb::VMCB_SIZE as u64 || offset + size > vmcb::VMCB_SIZE || offset % size != 0
        {
            error!("vmcb index {:#x} is out of range or misaligned", index);
            return Err(MkError::InvalidParams2);
        }

        Ok(unsafe { (self.hw_page.add(offset) as *const T).read_volatile() })
    }

    fn vmcb_write<T: Copy>(&mut self, index: u64, val: T) -> MkResult<()> {
        let size = core::mem::size_of::<T>();
        let offset = index as usize;
        if index >= vmcb::VMCB_SIZE as u64 || offset + size > vmcb::VMCB_SIZE || offset % size != 0
        {
            error!("vmcb index {:#x} is out of range or misaligned", index);
            return Err(MkError::InvalidParams2);
        }

        unsafe { (self.hw_page.add(offset) as *mut T).write_volatile(val) };
        Ok(())
    }

    pub fn read8(&mut self, tls: &mut Tls, intrinsic: &dyn Intrinsic, index: u64) -> MkResult<u8> {
        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => {
                // no 8-bit VMCS field exists
                error!("8 bit VMCS field access is not supported");
                Err(MkError::Unsupported)
            }
            VpsBackend::Amd => self.vmcb_read::<u8>(index),
        }
    }

    pub fn read16(&mut self, tls: &mut Tls, intrinsic: &dyn Intrinsic, index: u64) -> MkResult<u16> {
        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => Ok(intrinsic.vmread16(index)?),
            VpsBackend::Amd => self.vmcb_read::<u16>(index),
        }
    }

    pub fn read32(&mut self, tls: &mut Tls, intrinsic: &dyn Intrinsic, index: u64) -> MkResult<u32> {
        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => Ok(intrinsic.vmread32(index)?),
            VpsBackend::Amd => self.vmcb_read::<u32>(index),
        }
    }

    pub fn read64(&mut self, tls: &mut Tls, intrinsic: &dyn Intrinsic, index: u64) -> MkResult<u64> {
        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => Ok(intrinsic.vmread64(index)?),
            VpsBackend::Amd => self.vmcb_read::<u64>(index),
        }
    }

    pub fn write8(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        index: u64,
        val: u8,
    ) -> MkResult<()> {
        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => {
                error!("8 bit VMCS field access is not supported");
                Err(MkError::Unsupported)
            }
            VpsBackend::Amd => self.vmcb_write(index, val),
        }
    }

    pub fn write16(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        index: u64,
        val: u16,
    ) -> MkResult<()> {
        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => Ok(intrinsic.vmwrite16(index, val)?),
            VpsBackend::Amd => self.vmcb_write(index, val),
        }
    }

    pub fn write32(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        index: u64,
        val: u32,
    ) -> MkResult<()> {
        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => Ok(intrinsic.vmwrite32(index, val)?),
            VpsBackend::Amd => self.vmcb_write(index, val),
        }
    }

    pub fn write64(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        index: u64,
        val: u64,
    ) -> MkResult<()> {
        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => Ok(intrinsic.vmwrite64(index, val)?),
            VpsBackend::Amd => self.vmcb_write(index, val),
        }
    }

    // ------------------------------------------------------------------
    // field access by abstract register
    // ------------------------------------------------------------------

    pub fn read_reg(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        reg: BfReg,
    ) -> MkResult<u64> {
        if !self.is_allocated() {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        // the missing-registers block needs no load
        if let Some(val) = self.read_missing_reg(reg) {
            return Ok(val);
        }

        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => self.read_reg_intel(intrinsic, reg),
            VpsBackend::Amd => self.read_reg_amd(reg),
        }
    }

    pub fn write_reg(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        reg: BfReg,
        val: u64,
    ) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.write_missing_reg(reg, val) {
            return Ok(());
        }

        self.ensure_loaded(tls, intrinsic)?;
        match self.backend {
            VpsBackend::Intel => self.write_reg_intel(intrinsic, reg, val),
            VpsBackend::Amd => self.write_reg_amd(reg, val),
        }
    }

    /// GPRs held in the missing-registers block, by backend. On Intel the
    /// VMCS holds rsp/rip only; on AMD the VMCB additionally holds rax.
    fn read_missing_reg(&self, reg: BfReg) -> Option<u64> {
        if self.backend == VpsBackend::Amd && reg == BfReg::Rax {
            return None;
        }

        match reg {
            BfReg::Rax => Some(self.regs.rax),
            BfReg::Rbx => Some(self.regs.rbx),
            BfReg::Rcx => Some(self.regs.rcx),
            BfReg::Rdx => Some(self.regs.rdx),
            BfReg::Rbp => Some(self.regs.rbp),
            BfReg::Rsi => Some(self.regs.rsi),
            BfReg::Rdi => Some(self.regs.rdi),
            BfReg::R8 => Some(self.regs.r8),
            BfReg::R9 => Some(self.regs.r9),
            BfReg::R10 => Some(self.regs.r10),
            BfReg::R11 => Some(self.regs.r11),
            BfReg::R12 => Some(self.regs.r12),
            BfReg::R13 => Some(self.regs.r13),
            BfReg::R14 => Some(self.regs.r14),
            BfReg::R15 => Some(self.regs.r15),
            _ => None,
        }
    }

    fn write_missing_reg(&mut self, reg: BfReg, val: u64) -> bool {
        if self.backend == VpsBackend::Amd && reg == BfReg::Rax {
            return false;
        }

        let slot = match reg {
            BfReg::Rax => &mut self.regs.rax,
            BfReg::Rbx => &mut self.regs.rbx,
            BfReg::Rcx => &mut self.regs.rcx,
            BfReg::Rdx => &mut self.regs.rdx,
            BfReg::Rbp => &mut self.regs.rbp,
            BfReg::Rsi => &mut self.regs.rsi,
            BfReg::Rdi => &mut self.regs.rdi,
            BfReg::R8 => &mut self.regs.r8,
            BfReg::R9 => &mut self.regs.r9,
            BfReg::R10 => &mut self.regs.r10,
            BfReg::R11 => &mut self.regs.r11,
            BfReg::R12 => &mut self.regs.r12,
            BfReg::R13 => &mut self.regs.r13,
            BfReg::R14 => &mut self.regs.r14,
            BfReg::R15 => &mut self.regs.r15,
            _ => return false,
        };

        *slot = val;
        true
    }

    fn read_reg_intel(&mut self, intrinsic: &dyn Intrinsic, reg: BfReg) -> MkResult<u64> {
        use vmcs::*;

        let val = match reg {
            BfReg::Rsp => intrinsic.vmread64(GUEST_RSP)?,
            BfReg::Rip => intrinsic.vmread64(GUEST_RIP)?,
            BfReg::Rflags => intrinsic.vmread64(GUEST_RFLAGS)?,
            BfReg::GdtrBase => intrinsic.vmread64(GUEST_GDTR_BASE)?,
            BfReg::GdtrLimit => u64::from(intrinsic.vmread32(GUEST_GDTR_LIMIT)?),
            BfReg::IdtrBase => intrinsic.vmread64(GUEST_IDTR_BASE)?,
            BfReg::IdtrLimit => u64::from(intrinsic.vmread32(GUEST_IDTR_LIMIT)?),
            BfReg::EsSelector => u64::from(intrinsic.vmread16(GUEST_ES_SELECTOR)?),
            BfReg::EsAttrib => u64::from(intrinsic.vmread32(GUEST_ES_AR_BYTES)?),
            BfReg::EsLimit => u64::from(intrinsic.vmread32(GUEST_ES_LIMIT)?),
            BfReg::EsBase => intrinsic.vmread64(GUEST_ES_BASE)?,
            BfReg::CsSelector => u64::from(intrinsic.vmread16(GUEST_CS_SELECTOR)?),
            BfReg::CsAttrib => u64::from(intrinsic.vmread32(GUEST_CS_AR_BYTES)?),
            BfReg::CsLimit => u64::from(intrinsic.vmread32(GUEST_CS_LIMIT)?),
            BfReg::CsBase => intrinsic.vmread64(GUEST_CS_BASE)?,
            BfReg::SsSelector => u64::from(intrinsic.vmread16(GUEST_SS_SELECTOR)?),
            BfReg::SsAttrib => u64::from(intrinsic.vmread32(GUEST_SS_AR_BYTES)?),
            BfReg::SsLimit => u64::from(intrinsic.vmread32(GUEST_SS_LIMIT)?),
            BfReg::SsBase => intrinsic.vmread64(GUEST_SS_BASE)?,
            BfReg::DsSelector => u64::from(intrinsic.vmread16(GUEST_DS_SELECTOR)?),
            BfReg::DsAttrib => u64::from(intrinsic.vmread32(GUEST_DS_AR_BYTES)?),
            BfReg::DsLimit => u64::from(intrinsic.vmread32(GUEST_DS_LIMIT)?),
            BfReg::DsBase => intrinsic.vmread64(GUEST_DS_BASE)?,
            BfReg::FsSelector => u64::from(intrinsic.vmread16(GUEST_FS_SELECTOR)?),
            BfReg::FsAttrib => u64::from(intrinsic.vmread32(GUEST_FS_AR_BYTES)?),
            BfReg::FsLimit => u64::from(intrinsic.vmread32(GUEST_FS_LIMIT)?),
            BfReg::FsBase | BfReg::Ia32FsBase => intrinsic.vmread64(GUEST_FS_BASE)?,
            BfReg::GsSelector => u64::from(intrinsic.vmread16(GUEST_GS_SELECTOR)?),
            BfReg::GsAttrib => u64::from(intrinsic.vmread32(GUEST_GS_AR_BYTES)?),
            BfReg::GsLimit => u64::from(intrinsic.vmread32(GUEST_GS_LIMIT)?),
            BfReg::GsBase | BfReg::Ia32GsBase => intrinsic.vmread64(GUEST_GS_BASE)?,
            BfReg::LdtrSelector => u64::from(intrinsic.vmread16(GUEST_LDTR_SELECTOR)?),
            BfReg::LdtrAttrib => u64::from(intrinsic.vmread32(GUEST_LDTR_AR_BYTES)?),
            BfReg::LdtrLimit => u64::from(intrinsic.vmread32(GUEST_LDTR_LIMIT)?),
            BfReg::LdtrBase => intrinsic.vmread64(GUEST_LDTR_BASE)?,
            BfReg::TrSelector => u64::from(intrinsic.vmread16(GUEST_TR_SELECTOR)?),
            BfReg::TrAttrib => u64::from(intrinsic.vmread32(GUEST_TR_AR_BYTES)?),
            BfReg::TrLimit => u64::from(intrinsic.vmread32(GUEST_TR_LIMIT)?),
            BfReg::TrBase => intrinsic.vmread64(GUEST_TR_BASE)?,
            BfReg::Cr0 => intrinsic.vmread64(GUEST_CR0)?,
            BfReg::Cr2 => self.cr2,
            BfReg::Cr3 => intrinsic.vmread64(GUEST_CR3)?,
            BfReg::Cr4 => intrinsic.vmread64(GUEST_CR4)?,
            BfReg::Dr6 => self.dr6,
            BfReg::Dr7 => intrinsic.vmread64(GUEST_DR7)?,
            BfReg::Ia32Efer => intrinsic.vmread64(GUEST_IA32_EFER)?,
            BfReg::Ia32Star => self.msrs.star,
            BfReg::Ia32Lstar => self.msrs.lstar,
            BfReg::Ia32Cstar => self.msrs.cstar,
            BfReg::Ia32Fmask => self.msrs.fmask,
            BfReg::Ia32KernelGsBase => self.msrs.kernel_gs_base,
            BfReg::Ia32SysenterCs => u64::from(intrinsic.vmread32(GUEST_IA32_SYSENTER_CS)?),
            BfReg::Ia32SysenterEsp => intrinsic.vmread64(GUEST_IA32_SYSENTER_ESP)?,
            BfReg::Ia32SysenterEip => intrinsic.vmread64(GUEST_IA32_SYSENTER_EIP)?,
            BfReg::Ia32Pat => intrinsic.vmread64(GUEST_IA32_PAT)?,
            BfReg::Ia32Debugctl => intrinsic.vmread64(GUEST_IA32_DEBUGCTL)?,
            _ => {
                error!("unsupported bf_reg: {:?}", reg);
                return Err(MkError::Unsupported);
            }
        };

        Ok(val)
    }

    fn write_reg_intel(
        &mut self,
        intrinsic: &dyn Intrinsic,
        reg: BfReg,
        val: u64,
    ) -> MkResult<()> {
        use vmcs::*;

        match reg {
            BfReg::Rsp => intrinsic.vmwrite64(GUEST_RSP, val)?,
            BfReg::Rip => intrinsic.vmwrite64(GUEST_RIP, val)?,
            BfReg::Rflags => intrinsic.vmwrite64(GUEST_RFLAGS, val)?,
            BfReg::GdtrBase => intrinsic.vmwrite64(GUEST_GDTR_BASE, val)?,
            BfReg::GdtrLimit => intrinsic.vmwrite32(GUEST_GDTR_LIMIT, val as u32)?,
            BfReg::IdtrBase => intrinsic.vmwrite64(GUEST_IDTR_BASE, val)?,
            BfReg::IdtrLimit => intrinsic.vmwrite32(GUEST_IDTR_LIMIT, val as u32)?,
            BfReg::EsSelector => intrinsic.vmwrite16(GUEST_ES_SELECTOR, val as u16)?,
            BfReg::EsAttrib => intrinsic.vmwrite32(GUEST_ES_AR_BYTES, val as u32)?,
            BfReg::EsLimit => intrinsic.vmwrite32(GUEST_ES_LIMIT, val as u32)?,
            BfReg::EsBase => intrinsic.vmwrite64(GUEST_ES_BASE, val)?,
            BfReg::CsSelector => intrinsic.vmwrite16(GUEST_CS_SELECTOR, val as u16)?,
            BfReg::CsAttrib => intrinsic.vmwrite32(GUEST_CS_AR_BYTES, val as u32)?,
            BfReg::CsLimit => intrinsic.vmwrite32(GUEST_CS_LIMIT, val as u32)?,
            BfReg::CsBase => intrinsic.vmwrite64(GUEST_CS_BASE, val)?,
            BfReg::SsSelector => intrinsic.vmwrite16(GUEST_SS_SELECTOR, val as u16)?,
            BfReg::SsAttrib => intrinsic.vmwrite32(GUEST_SS_AR_BYTES, val as u32)?,
            BfReg::SsLimit => intrinsic.vmwrite32(GUEST_SS_LIMIT, val as u32)?,
            BfReg::SsBase => intrinsic.vmwrite64(GUEST_SS_BASE, val)?,
            BfReg::DsSelector => intrinsic.vmwrite16(GUEST_DS_SELECTOR, val as u16)?,
            BfReg::DsAttrib => intrinsic.vmwrite32(GUEST_DS_AR_BYTES, val as u32)?,
            BfReg::DsLimit => intrinsic.vmwrite32(GUEST_DS_LIMIT, val as u32)?,
            BfReg::DsBase => intrinsic.vmwrite64(GUEST_DS_BASE, val)?,
            BfReg::FsSelector => intrinsic.vmwrite16(GUEST_FS_SELECTOR, val as u16)?,
            BfReg::FsAttrib => intrinsic.vmwrite32(GUEST_FS_AR_BYTES, val as u32)?,
            BfReg::FsLimit => intrinsic.vmwrite32(GUEST_FS_LIMIT, val as u32)?,
            BfReg::FsBase | BfReg::Ia32FsBase => intrinsic.vmwrite64(GUEST_FS_BASE, val)?,
            BfReg::GsSelector => intrinsic.vmwrite16(GUEST_GS_SELECTOR, val as u16)?,
            BfReg::GsAttrib => intrinsic.vmwrite32(GUEST_GS_AR_BYTES, val as u32)?,
            BfReg::GsLimit => intrinsic.vmwrite32(GUEST_GS_LIMIT, val as u32)?,
            BfReg::GsBase | BfReg::Ia32GsBase => intrinsic.vmwrite64(GUEST_GS_BASE, val)?,
            BfReg::LdtrSelector => intrinsic.vmwrite16(GUEST_LDTR_SELECTOR, val as u16)?,
            BfReg::LdtrAttrib => intrinsic.vmwrite32(GUEST_LDTR_AR_BYTES, val as u32)?,
            BfReg::LdtrLimit => intrinsic.vmwrite32(GUEST_LDTR_LIMIT, val as u32)?,
            BfReg::LdtrBase => intrinsic.vmwrite64(GUEST_LDTR_BASE, val)?,
            BfReg::TrSelector => intrinsic.vmwrite16(GUEST_TR_SELECTOR, val as u16)?,
            BfReg::TrAttrib => intrinsic.vmwrite32(GUEST_TR_AR_BYTES, val as u32)?,
            BfReg::TrLimit => intrinsic.vmwrite32(GUEST_TR_LIMIT, val as u32)?,
            BfReg::TrBase => intrinsic.vmwrite64(GUEST_TR_BASE, val)?,
            BfReg::Cr0 => intrinsic.vmwrite64(GUEST_CR0, val)?,
            BfReg::Cr2 => self.cr2 = val,
            BfReg::Cr3 => intrinsic.vmwrite64(GUEST_CR3, val)?,
            BfReg::Cr4 => intrinsic.vmwrite64(GUEST_CR4, val)?,
            BfReg::Dr6 => self.dr6 = val,
            BfReg::Dr7 => intrinsic.vmwrite64(GUEST_DR7, val)?,
            BfReg::Ia32Efer => intrinsic.vmwrite64(GUEST_IA32_EFER, val)?,
            BfReg::Ia32Star => self.msrs.star = val,
            BfReg::Ia32Lstar => self.msrs.lstar = val,
            BfReg::Ia32Cstar => self.msrs.cstar = val,
            BfReg::Ia32Fmask => self.msrs.fmask = val,
            BfReg::Ia32KernelGsBase => self.msrs.kernel_gs_base = val,
            BfReg::Ia32SysenterCs => intrinsic.vmwrite32(GUEST_IA32_SYSENTER_CS, val as u32)?,
            BfReg::Ia32SysenterEsp => intrinsic.vmwrite64(GUEST_IA32_SYSENTER_ESP, val)?,
            BfReg::Ia32SysenterEip => intrinsic.vmwrite64(GUEST_IA32_SYSENTER_EIP, val)?,
            BfReg::Ia32Pat => intrinsic.vmwrite64(GUEST_IA32_PAT, val)?,
            BfReg::Ia32Debugctl => intrinsic.vmwrite64(GUEST_IA32_DEBUGCTL, val)?,
            _ => {
                error!("unsupported bf_reg: {:?}", reg);
                return Err(MkError::Unsupported);
            }
        }

        Ok(())
    }

    fn read_reg_amd(&mut self, reg: BfReg) -> MkResult<u64> {
        use vmcb::*;

        let val = match reg {
            BfReg::Rax => self.vmcb_read::<u64>(SAVE_RAX as u64)?,
            BfReg::Rsp => self.vmcb_read::<u64>(SAVE_RSP as u64)?,
            BfReg::Rip => self.vmcb_read::<u64>(SAVE_RIP as u64)?,
            BfReg::Rflags => self.vmcb_read::<u64>(SAVE_RFLAGS as u64)?,
            BfReg::GdtrBase => self.vmcb_read::<u64>((SAVE_GDTR + SEG_BASE_OFF) as u64)?,
            BfReg::GdtrLimit => u64::from(self.vmcb_read::<u32>((SAVE_GDTR + SEG_LIMIT_OFF) as u64)?),
            BfReg::IdtrBase => self.vmcb_read::<u64>((SAVE_IDTR + SEG_BASE_OFF) as u64)?,
            BfReg::IdtrLimit => u64::from(self.vmcb_read::<u32>((SAVE_IDTR + SEG_LIMIT_OFF) as u64)?),
            BfReg::EsSelector => u64::from(self.vmcb_read::<u16>(SAVE_ES_SELECTOR as u64)?),
            BfReg::EsAttrib => u64::from(self.vmcb_read::<u16>((SAVE_ES_SELECTOR + SEG_ATTRIB_OFF) as u64)?),
            BfReg::EsLimit => u64::from(self.vmcb_read::<u32>((SAVE_ES_SELECTOR + SEG_LIMIT_OFF) as u64)?),
            BfReg::EsBase => self.vmcb_read::<u64>((SAVE_ES_SELECTOR + SEG_BASE_OFF) as u64)?,
            BfReg::CsSelector => u64::from(self.vmcb_read::<u16>(SAVE_CS_SELECTOR as u64)?),
            BfReg::CsAttrib => u64::from(self.vmcb_read::<u16>((SAVE_CS_SELECTOR + SEG_ATTRIB_OFF) as u64)?),
            BfReg::CsLimit => u64::from(self.vmcb_read::<u32>((SAVE_CS_SELECTOR + SEG_LIMIT_OFF) as u64)?),
            BfReg::CsBase => self.vmcb_read::<u64>((SAVE_CS_SELECTOR + SEG_BASE_OFF) as u64)?,
            BfReg::SsSelector => u64::from(self.vmcb_read::<u16>(SAVE_SS_SELECTOR as u64)?),
            BfReg::SsAttrib => u64::from(self.vmcb_read::<u16>((SAVE_SS_SELECTOR + SEG_ATTRIB_OFF) as u64)?),
            BfReg::SsLimit => u64::from(self.vmcb_read::<u32>((SAVE_SS_SELECTOR + SEG_LIMIT_OFF) as u64)?),
            BfReg::SsBase => self.vmcb_read::<u64>((SAVE_SS_SELECTOR + SEG_BASE_OFF) as u64)?,
            BfReg::DsSelector => u64::from(self.vmcb_read::<u16>(SAVE_DS_SELECTOR as u64)?),
            BfReg::DsAttrib => u64::from(self.vmcb_read::<u16>((SAVE_DS_SELECTOR + SEG_ATTRIB_OFF) as u64)?),
            BfReg::DsLimit => u64::from(self.vmcb_read::<u32>((SAVE_DS_SELECTOR + SEG_LIMIT_OFF) as u64)?),
            BfReg::DsBase => self.vmcb_read::<u64>((SAVE_DS_SELECTOR + SEG_BASE_OFF) as u64)?,
            BfReg::FsSelector => u64::from(self.vmcb_read::<u16>(SAVE_FS_SELECTOR as u64)?),
            BfReg::FsAttrib => u64::from(self.vmcb_read::<u16>((SAVE_FS_SELECTOR + SEG_ATTRIB_OFF) as u64)?),
            BfReg::FsLimit => u64::from(self.vmcb_read::<u32>((SAVE_FS_SELECTOR + SEG_LIMIT_OFF) as u64)?),
            BfReg::FsBase | BfReg::Ia32FsBase => self.vmcb_read::<u64>((SAVE_FS_SELECTOR + SEG_BASE_OFF) as u64)?,
            BfReg::GsSelector => u64::from(self.vmcb_read::<u16>(SAVE_GS_SELECTOR as u64)?),
            BfReg::GsAttrib => u64::from(self.vmcb_read::<u16>((SAVE_GS_SELECTOR + SEG_ATTRIB_OFF) as u64)?),
            BfReg::GsLimit => u64::from(self.vmcb_read::<u32>((SAVE_GS_SELECTOR + SEG_LIMIT_OFF) as u64)?),
            BfReg::GsBase | BfReg::Ia32GsBase => self.vmcb_read::<u64>((SAVE_GS_SELECTOR + SEG_BASE_OFF) as u64)?,
            BfReg::LdtrSelector => u64::from(self.vmcb_read::<u16>(SAVE_LDTR as u64)?),
            BfReg::LdtrAttrib => u64::from(self.vmcb_read::<u16>((SAVE_LDTR + SEG_ATTRIB_OFF) as u64)?),
            BfReg::LdtrLimit => u64::from(self.vmcb_read::<u32>((SAVE_LDTR + SEG_LIMIT_OFF) as u64)?),
            BfReg::LdtrBase => self.vmcb_read::<u64>((SAVE_LDTR + SEG_BASE_OFF) as u64)?,
            BfReg::TrSelector => u64::from(self.vmcb_read::<u16>(SAVE_TR as u64)?),
            BfReg::TrAttrib => u64::from(self.vmcb_read::<u16>((SAVE_TR + SEG_ATTRIB_OFF) as u64)?),
            BfReg::TrLimit => u64::from(self.vmcb_read::<u32>((SAVE_TR + SEG_LIMIT_OFF) as u64)?),
            BfReg::TrBase => self.vmcb_read::<u64>((SAVE_TR + SEG_BASE_OFF) as u64)?,
            BfReg::Cr0 => self.vmcb_read::<u64>(SAVE_CR0 as u64)?,
            BfReg::Cr2 => self.vmcb_read::<u64>(SAVE_CR2 as u64)?,
            BfReg::Cr3 => self.vmcb_read::<u64>(SAVE_CR3 as u64)?,
            BfReg::Cr4 => self.vmcb_read::<u64>(SAVE_CR4 as u64)?,
            BfReg::Dr6 => self.vmcb_read::<u64>(SAVE_DR6 as u64)?,
            BfReg::Dr7 => self.vmcb_read::<u64>(SAVE_DR7 as u64)?,
            BfReg::Ia32Efer => self.vmcb_read::<u64>(SAVE_EFER as u64)?,
            BfReg::Ia32Star => self.vmcb_read::<u64>(SAVE_STAR as u64)?,
            BfReg::Ia32Lstar => self.vmcb_read::<u64>(SAVE_LSTAR as u64)?,
            BfReg::Ia32Cstar => self.vmcb_read::<u64>(SAVE_CSTAR as u64)?,
            BfReg::Ia32Fmask => self.vmcb_read::<u64>(SAVE_SFMASK as u64)?,
            BfReg::Ia32KernelGsBase => self.vmcb_read::<u64>(SAVE_KERNEL_GS_BASE as u64)?,
            BfReg::Ia32SysenterCs => self.vmcb_read::<u64>(SAVE_SYSENTER_CS as u64)?,
            BfReg::Ia32SysenterEsp => self.vmcb_read::<u64>(SAVE_SYSENTER_ESP as u64)?,
            BfReg::Ia32SysenterEip => self.vmcb_read::<u64>(SAVE_SYSENTER_EIP as u64)?,
            BfReg::Ia32Pat => self.vmcb_read::<u64>(SAVE_PAT as u64)?,
            BfReg::Ia32Debugctl => self.vmcb_read::<u64>(SAVE_DBGCTL as u64)?,
            _ => {
                error!("unsupported bf_reg: {:?}", reg);
                return Err(MkError::Unsupported);
            }
        };

        Ok(val)
    }

    fn write_reg_amd(&mut self, reg: BfReg, val: u64) -> MkResult<()> {
        use vmcb::*;

        match reg {
            BfReg::Rax => self.vmcb_write(SAVE_RAX as u64, val)?,
            BfReg::Rsp => self.vmcb_write(SAVE_RSP as u64, val)?,
            BfReg::Rip => self.vmcb_write(SAVE_RIP as u64, val)?,
            BfReg::Rflags => self.vmcb_write(SAVE_RFLAGS as u64, val)?,
            BfReg::GdtrBase => self.vmcb_write((SAVE_GDTR + SEG_BASE_OFF) as u64, val)?,
            BfReg::GdtrLimit => self.vmcb_write((SAVE_GDTR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::IdtrBase => self.vmcb_write((SAVE_IDTR + SEG_BASE_OFF) as u64, val)?,
            BfReg::IdtrLimit => self.vmcb_write((SAVE_IDTR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::EsSelector => self.vmcb_write(SAVE_ES_SELECTOR as u64, val as u16)?,
            BfReg::EsAttrib => self.vmcb_write((SAVE_ES_SELECTOR + SEG_ATTRIB_OFF) as u64, val as u16)?,
            BfReg::EsLimit => self.vmcb_write((SAVE_ES_SELECTOR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::EsBase => self.vmcb_write((SAVE_ES_SELECTOR + SEG_BASE_OFF) as u64, val)?,
            BfReg::CsSelector => self.vmcb_write(SAVE_CS_SELECTOR as u64, val as u16)?,
            BfReg::CsAttrib => self.vmcb_write((SAVE_CS_SELECTOR + SEG_ATTRIB_OFF) as u64, val as u16)?,
            BfReg::CsLimit => self.vmcb_write((SAVE_CS_SELECTOR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::CsBase => self.vmcb_write((SAVE_CS_SELECTOR + SEG_BASE_OFF) as u64, val)?,
            BfReg::SsSelector => self.vmcb_write(SAVE_SS_SELECTOR as u64, val as u16)?,
            BfReg::SsAttrib => self.vmcb_write((SAVE_SS_SELECTOR + SEG_ATTRIB_OFF) as u64, val as u16)?,
            BfReg::SsLimit => self.vmcb_write((SAVE_SS_SELECTOR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::SsBase => self.vmcb_write((SAVE_SS_SELECTOR + SEG_BASE_OFF) as u64, val)?,
            BfReg::DsSelector => self.vmcb_write(SAVE_DS_SELECTOR as u64, val as u16)?,
            BfReg::DsAttrib => self.vmcb_write((SAVE_DS_SELECTOR + SEG_ATTRIB_OFF) as u64, val as u16)?,
            BfReg::DsLimit => self.vmcb_write((SAVE_DS_SELECTOR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::DsBase => self.vmcb_write((SAVE_DS_SELECTOR + SEG_BASE_OFF) as u64, val)?,
            BfReg::FsSelector => self.vmcb_write(SAVE_FS_SELECTOR as u64, val as u16)?,
            BfReg::FsAttrib => self.vmcb_write((SAVE_FS_SELECTOR + SEG_ATTRIB_OFF) as u64, val as u16)?,
            BfReg::FsLimit => self.vmcb_write((SAVE_FS_SELECTOR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::FsBase | BfReg::Ia32FsBase => self.vmcb_write((SAVE_FS_SELECTOR + SEG_BASE_OFF) as u64, val)?,
            BfReg::GsSelector => self.vmcb_write(SAVE_GS_SELECTOR as u64, val as u16)?,
            BfReg::GsAttrib => self.vmcb_write((SAVE_GS_SELECTOR + SEG_ATTRIB_OFF) as u64, val as u16)?,
            BfReg::GsLimit => self.vmcb_write((SAVE_GS_SELECTOR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::GsBase | BfReg::Ia32GsBase => self.vmcb_write((SAVE_GS_SELECTOR + SEG_BASE_OFF) as u64, val)?,
            BfReg::LdtrSelector => self.vmcb_write(SAVE_LDTR as u64, val as u16)?,
            BfReg::LdtrAttrib => self.vmcb_write((SAVE_LDTR + SEG_ATTRIB_OFF) as u64, val as u16)?,
            BfReg::LdtrLimit => self.vmcb_write((SAVE_LDTR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::LdtrBase => self.vmcb_write((SAVE_LDTR + SEG_BASE_OFF) as u64, val)?,
            BfReg::TrSelector => self.vmcb_write(SAVE_TR as u64, val as u16)?,
            BfReg::TrAttrib => self.vmcb_write((SAVE_TR + SEG_ATTRIB_OFF) as u64, val as u16)?,
            BfReg::TrLimit => self.vmcb_write((SAVE_TR + SEG_LIMIT_OFF) as u64, val as u32)?,
            BfReg::TrBase => self.vmcb_write((SAVE_TR + SEG_BASE_OFF) as u64, val)?,
            BfReg::Cr0 => self.vmcb_write(SAVE_CR0 as u64, val)?,
            BfReg::Cr2 => self.vmcb_write(SAVE_CR2 as u64, val)?,
            BfReg::Cr3 => self.vmcb_write(SAVE_CR3 as u64, val)?,
            BfReg::Cr4 => self.vmcb_write(SAVE_CR4 as u64, val)?,
            BfReg::Dr6 => self.vmcb_write(SAVE_DR6 as u64, val)?,
            BfReg::Dr7 => self.vmcb_write(SAVE_DR7 as u64, val)?,
            BfReg::Ia32Efer => self.vmcb_write(SAVE_EFER as u64, val)?,
            BfReg::Ia32Star => self.vmcb_write(SAVE_STAR as u64, val)?,
            BfReg::Ia32Lstar => self.vmcb_write(SAVE_LSTAR as u64, val)?,
            BfReg::Ia32Cstar => self.vmcb_write(SAVE_CSTAR as u64, val)?,
            BfReg::Ia32Fmask => self.vmcb_write(SAVE_SFMASK as u64, val)?,
            BfReg::Ia32KernelGsBase => self.vmcb_write(SAVE_KERNEL_GS_BASE as u64, val)?,
            BfReg::Ia32SysenterCs => self.vmcb_write(SAVE_SYSENTER_CS as u64, val)?,
            BfReg::Ia32SysenterEsp => self.vmcb_write(SAVE_SYSENTER_ESP as u64, val)?,
            BfReg::Ia32SysenterEip => self.vmcb_write(SAVE_SYSENTER_EIP as u64, val)?,
            BfReg::Ia32Pat => self.vmcb_write(SAVE_PAT as u64, val)?,
            BfReg::Ia32Debugctl => self.vmcb_write(SAVE_DBGCTL as u64, val)?,
            _ => {
                error!("unsupported bf_reg: {:?}", reg);
                return Err(MkError::Unsupported);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // bulk state copies
    // ------------------------------------------------------------------

    /// Every register pair touched by the bulk state copies, in copy
    /// order.
    const STATE_REGS: [BfReg; 66] = [
        BfReg::Rax,
        BfReg::Rbx,
        BfReg::Rcx,
        BfReg::Rdx,
        BfReg::Rbp,
        BfReg::Rsi,
        BfReg::Rdi,
        BfReg::R8,
        BfReg::R9,
        BfReg::R10,
        BfReg::R11,
        BfReg::R12,
        BfReg::R13,
        BfReg::R14,
        BfReg::R15,
        BfReg::Rsp,
        BfReg::Rip,
        BfReg::Rflags,
        BfReg::GdtrBase,
        BfReg::GdtrLimit,
        BfReg::IdtrBase,
        BfReg::IdtrLimit,
        BfReg::EsSelector,
        BfReg::EsAttrib,
        BfReg::EsLimit,
        BfReg::EsBase,
        BfReg::CsSelector,
        BfReg::CsAttrib,
        BfReg::CsLimit,
        BfReg::CsBase,
        BfReg::SsSelector,
        BfReg::SsAttrib,
        BfReg::SsLimit,
        BfReg::SsBase,
        BfReg::DsSelector,
        BfReg::DsAttrib,
        BfReg::DsLimit,
        BfReg::DsBase,
        BfReg::FsSelector,
        BfReg::FsAttrib,
        BfReg::FsLimit,
        BfReg::FsBase,
        BfReg::GsSelector,
        BfReg::GsAttrib,
        BfReg::GsLimit,
        BfReg::GsBase,
        BfReg::LdtrSelector,
        BfReg::LdtrAttrib,
        BfReg::LdtrLimit,
        BfReg::LdtrBase,
        BfReg::TrSelector,
        BfReg::TrAttrib,
        BfReg::TrLimit,
        BfReg::TrBase,
        BfReg::Cr0,
        BfReg::Cr2,
        BfReg::Cr3,
        BfReg::Cr4,
        BfReg::Dr6,
        BfReg::Dr7,
        BfReg::Ia32Efer,
        BfReg::Ia32Star,
        BfReg::Ia32Lstar,
        BfReg::Ia32Cstar,
        BfReg::Ia32Fmask,
        BfReg::Ia32KernelGsBase,
    ];

    fn state_field(state: &StateSave, reg: BfReg) -> u64 {
        match reg {
            BfReg::Rax => state.rax,
            BfReg::Rbx => state.rbx,
            BfReg::Rcx => state.rcx,
            BfReg::Rdx => state.rdx,
            BfReg::Rbp => state.rbp,
            BfReg::Rsi => state.rsi,
            BfReg::Rdi => state.rdi,
            BfReg::R8 => state.r8,
            BfReg::R9 => state.r9,
            BfReg::R10 => state.r10,
            BfReg::R11 => state.r11,
            BfReg::R12 => state.r12,
            BfReg::R13 => state.r13,
            BfReg::R14 => state.r14,
            BfReg::R15 => state.r15,
            BfReg::Rsp => state.rsp,
            BfReg::Rip => state.rip,
            BfReg::Rflags => state.rflags,
            BfReg::GdtrBase => state.gdtr.base,
            BfReg::GdtrLimit => u64::from(state.gdtr.limit),
            BfReg::IdtrBase => state.idtr.base,
            BfReg::IdtrLimit => u64::from(state.idtr.limit),
            BfReg::EsSelector => u64::from(state.es.selector),
            BfReg::EsAttrib => u64::from(state.es.attrib),
            BfReg::EsLimit => u64::from(state.es.limit),
            BfReg::EsBase => state.es.base,
            BfReg::CsSelector => u64::from(state.cs.selector),
            BfReg::CsAttrib => u64::from(state.cs.attrib),
            BfReg::CsLimit => u64::from(state.cs.limit),
            BfReg::CsBase => state.cs.base,
            BfReg::SsSelector => u64::from(state.ss.selector),
            BfReg::SsAttrib => u64::from(state.ss.attrib),
            BfReg::SsLimit => u64::from(state.ss.limit),
            BfReg::SsBase => state.ss.base,
            BfReg::DsSelector => u64::from(state.ds.selector),
            BfReg::DsAttrib => u64::from(state.ds.attrib),
            BfReg::DsLimit => u64::from(state.ds.limit),
            BfReg::DsBase => state.ds.base,
            BfReg::FsSelector => u64::from(state.fs.selector),
            BfReg::FsAttrib => u64::from(state.fs.attrib),
            BfReg::FsLimit => u64::from(state.fs.limit),
            BfReg::FsBase => state.fs.base,
            BfReg::GsBase => state.gs.base,
            BfReg::GsSelector => u64::from(state.gs.selector),
            BfReg::GsAttrib => u64::from(state.gs.attrib),
            BfReg::GsLimit => u64::from(state.gs.limit),
            BfReg::LdtrSelector => u64::from(state.ldtr.selector),
            BfReg::LdtrAttrib => u64::from(state.ldtr.attrib),
            BfReg::LdtrLimit => u64::from(state.ldtr.limit),
            BfReg::LdtrBase => state.ldtr.base,
            BfReg::TrSelector => u64::from(state.tr.selector),
            BfReg::TrAttrib => u64::from(state.tr.attrib),
            BfReg::TrLimit => u64::from(state.tr.limit),
            BfReg::TrBase => state.tr.base,
            BfReg::Cr0 => state.cr0,
            BfReg::Cr2 => state.cr2,
            BfReg::Cr3 => state.cr3,
            BfReg::Cr4 => state.cr4,
            BfReg::Dr6 => state.dr6,
            BfReg::Dr7 => state.dr7,
            BfReg::Ia32Efer => state.ia32_efer,
            BfReg::Ia32Star => state.ia32_star,
            BfReg::Ia32Lstar => state.ia32_lstar,
            BfReg::Ia32Cstar => state.ia32_cstar,
            BfReg::Ia32Fmask => state.ia32_fmask,
            BfReg::Ia32KernelGsBase => state.ia32_kernel_gs_base,
            _ => 0,
        }
    }

    fn set_state_field(state: &mut StateSave, reg: BfReg, val: u64) {
        match reg {
            BfReg::Rax => state.rax = val,
            BfReg::Rbx => state.rbx = val,
            BfReg::Rcx => state.rcx = val,
            BfReg::Rdx => state.rdx = val,
            BfReg::Rbp => state.rbp = val,
            BfReg::Rsi => state.rsi = val,
            BfReg::Rdi => state.rdi = val,
            BfReg::R8 => state.r8 = val,
            BfReg::R9 => state.r9 = val,
            BfReg::R10 => state.r10 = val,
            BfReg::R11 => state.r11 = val,
            BfReg::R12 => state.r12 = val,
            BfReg::R13 => state.r13 = val,
            BfReg::R14 => state.r14 = val,
            BfReg::R15 => state.r15 = val,
            BfReg::Rsp => state.rsp = val,
            BfReg::Rip => state.rip = val,
            BfReg::Rflags => state.rflags = val,
            BfReg::GdtrBase => state.gdtr.base = val,
            BfReg::GdtrLimit => state.gdtr.limit = val as u16,
            BfReg::IdtrBase => state.idtr.base = val,
            BfReg::IdtrLimit => state.idtr.limit = val as u16,
            BfReg::EsSelector => state.es.selector = val as u16,
            BfReg::EsAttrib => state.es.attrib = val as u16,
            BfReg::EsLimit => state.es.limit = val as u32,
            BfReg::EsBase => state.es.base = val,
            BfReg::CsSelector => state.cs.selector = val as u16,
            BfReg::CsAttrib => state.cs.attrib = val as u16,
            BfReg::CsLimit => state.cs.limit = val as u32,
            BfReg::CsBase => state.cs.base = val,
            BfReg::SsSelector => state.ss.selector = val as u16,
            BfReg::SsAttrib => state.ss.attrib = val as u16,
            BfReg::SsLimit => state.ss.limit = val as u32,
            BfReg::SsBase => state.ss.base = val,
            BfReg::DsSelector => state.ds.selector = val as u16,
            BfReg::DsAttrib => state.ds.attrib = val as u16,
            BfReg::DsLimit => state.ds.limit = val as u32,
            BfReg::DsBase => state.ds.base = val,
            BfReg::FsSelector => state.fs.selector = val as u16,
            BfReg::FsAttrib => state.fs.attrib = val as u16,
            BfReg::FsLimit => state.fs.limit = val as u32,
            BfReg::FsBase => state.fs.base = val,
            BfReg::GsBase => state.gs.base = val,
            BfReg::GsSelector => state.gs.selector = val as u16,
            BfReg::GsAttrib => state.gs.attrib = val as u16,
            BfReg::GsLimit => state.gs.limit = val as u32,
            BfReg::LdtrSelector => state.ldtr.selector = val as u16,
            BfReg::LdtrAttrib => state.ldtr.attrib = val as u16,
            BfReg::LdtrLimit => state.ldtr.limit = val as u32,
            BfReg::LdtrBase => state.ldtr.base = val,
            BfReg::TrSelector => state.tr.selector = val as u16,
            BfReg::TrAttrib => state.tr.attrib = val as u16,
            BfReg::TrLimit => state.tr.limit = val as u32,
            BfReg::TrBase => state.tr.base = val,
            BfReg::Cr0 => state.cr0 = val,
            BfReg::Cr2 => state.cr2 = val,
            BfReg::Cr3 => state.cr3 = val,
            BfReg::Cr4 => state.cr4 = val,
            BfReg::Dr6 => state.dr6 = val,
            BfReg::Dr7 => state.dr7 = val,
            BfReg::Ia32Efer => state.ia32_efer = val,
            BfReg::Ia32Star => state.ia32_star = val,
            BfReg::Ia32Lstar => state.ia32_lstar = val,
            BfReg::Ia32Cstar => state.ia32_cstar = val,
            BfReg::Ia32Fmask => state.ia32_fmask = val,
            BfReg::Ia32KernelGsBase => state.ia32_kernel_gs_base = val,
            _ => {}
        }
    }

    /// Bulk copies a loader state save into this VPS. `init_as_root` is
    /// this plus nothing else.
    pub fn state_save_to_vps(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        state: &StateSave,
    ) -> MkResult<()> {
        self.ensure_loaded(tls, intrinsic)?;

        for reg in Self::STATE_REGS {
            self.write_reg(tls, intrinsic, reg, Self::state_field(state, reg))?;
        }

        // the remaining MSR pairs have backend-dependent homes
        self.write_reg(tls, intrinsic, BfReg::Ia32FsBase, state.ia32_fs_base)?;
        self.write_reg(tls, intrinsic, BfReg::Ia32GsBase, state.ia32_gs_base)?;
        self.write_reg(tls, intrinsic, BfReg::Ia32SysenterCs, state.ia32_sysenter_cs)?;
        self.write_reg(tls, intrinsic, BfReg::Ia32SysenterEsp, state.ia32_sysenter_esp)?;
        self.write_reg(tls, intrinsic, BfReg::Ia32SysenterEip, state.ia32_sysenter_eip)?;
        self.write_reg(tls, intrinsic, BfReg::Ia32Pat, state.ia32_pat)?;
        self.write_reg(tls, intrinsic, BfReg::Ia32Debugctl, state.ia32_debugctl)?;

        Ok(())
    }

    /// Bulk copies this VPS into a loader state save. `promote` writes the
    /// root VP state with this before leaving the hypervisor.
    pub fn vps_to_state_save(
        &mut self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        state: &mut StateSave,
    ) -> MkResult<()> {
        self.ensure_loaded(tls, intrinsic)?;

        for reg in Self::STATE_REGS {
            let val = self.read_reg(tls, intrinsic, reg)?;
            Self::set_state_field(state, reg, val);
        }

        state.ia32_fs_base = self.read_reg(tls, intrinsic, BfReg::Ia32FsBase)?;
        state.ia32_gs_base = self.read_reg(tls, intrinsic, BfReg::Ia32GsBase)?;
        state.ia32_sysenter_cs = self.read_reg(tls, intrinsic, BfReg::Ia32SysenterCs)?;
        state.ia32_sysenter_esp = self.read_reg(tls, intrinsic, BfReg::Ia32SysenterEsp)?;
        state.ia32_sysenter_eip = self.read_reg(tls, intrinsic, BfReg::Ia32SysenterEip)?;
        state.ia32_pat = self.read_reg(tls, intrinsic, BfReg::Ia32Pat)?;
        state.ia32_debugctl = self.read_reg(tls, intrinsic, BfReg::Ia32Debugctl)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // execution
    // ------------------------------------------------------------------

    /// Reads the last exit's instruction length and moves RIP past it.
    pub fn advance_ip(&mut self, tls: &mut Tls, intrinsic: &dyn Intrinsic) -> MkResult<()> {
        self.ensure_loaded(tls, intrinsic)?;

        match self.backend {
            VpsBackend::Intel => {
                let len = u64::from(intrinsic.vmread32(vmcs::VM_EXIT_INSTRUCTION_LEN)?);
                let rip = intrinsic.vmread64(vmcs::GUEST_RIP)?;
                intrinsic.vmwrite64(vmcs::GUEST_RIP, rip.wrapping_add(len))?;
            }
            VpsBackend::Amd => {
                let nrip = self.vmcb_read::<u64>(vmcb::NRIP as u64)?;
                self.vmcb_write(vmcb::SAVE_RIP as u64, nrip)?;
            }
        }

        Ok(())
    }

    /// Enters the guest. VMLAUNCH on the first entry after an allocate,
    /// clear or migrate, VMRESUME after that (Intel); VMRUN either way
    /// (AMD). Returns the raw exit reason.
    pub fn run(&mut self, tls: &mut Tls, intrinsic: &dyn Intrinsic) -> MkResult<u64> {
        if !self.is_allocated() {
            error!("vps {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.assigned_ppid != tls.ppid {
            error!(
                "vps {:#x} is assigned to pp {:#x} and cannot run on pp {:#x} without a migrate",
                self.id, self.assigned_ppid, tls.ppid
            );
            return Err(MkError::Unknown);
        }

        self.ensure_loaded(tls, intrinsic)?;

        match intrinsic.vm_run(&mut self.regs, self.hw_phys, self.launched) {
            Ok(exit_reason) => {
                self.launched = true;
                Ok(exit_reason)
            }
            Err(e) => {
                error!("vmlaunch/vmresume/vmrun of vps {:#x} failed: {:?}", self.id, e);
                Err(MkError::Unknown)
            }
        }
    }
}

/// The VPS pool
pub struct VpsPool {
    pool: ObjectPool<Vps, MAX_VPSS>,
}

impl VpsPool {
    pub fn new() -> Self {
        Self { pool: ObjectPool::new(Vps::new) }
    }

    pub fn allocate(
        &self,
        intrinsic: &dyn Intrinsic,
        page_pool: &PagePool,
        vpid: u16,
        ppid: u16,
    ) -> MkResult<u16> {
        self.pool.allocate_with(|vps| vps.allocate(intrinsic, page_pool, vpid, ppid))
    }

    pub fn deallocate(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        page_pool: &PagePool,
        vpsid: u16,
    ) -> MkResult<()> {
        self.pool.deallocate_with(vpsid, |vps| vps.deallocate(tls, intrinsic, page_pool))
    }

    pub fn is_allocated(&self, vpsid: u16) -> bool {
        self.pool.with(vpsid, |vps| vps.is_allocated()).unwrap_or(false)
    }

    pub fn is_zombie(&self, vpsid: u16) -> bool {
        self.pool.with(vpsid, |vps| vps.is_zombie()).unwrap_or(false)
    }

    pub fn is_active(&self, vpsid: u16) -> bool {
        self.pool.with(vpsid, |vps| vps.is_active()).unwrap_or(false)
    }

    pub fn loaded_on(&self, vpsid: u16) -> u16 {
        self.pool.with(vpsid, |vps| vps.loaded_on()).unwrap_or(BF_INVALID_ID)
    }

    pub fn assigned_vp(&self, vpsid: u16) -> u16 {
        self.pool.with(vpsid, |vps| vps.assigned_vp()).unwrap_or(BF_INVALID_ID)
    }

    pub fn assigned_pp(&self, vpsid: u16) -> u16 {
        self.pool.with(vpsid, |vps| vps.assigned_pp()).unwrap_or(BF_INVALID_ID)
    }

    pub fn set_active(&self, tls: &mut Tls, vpsid: u16) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.set_active(tls))?
    }

    pub fn set_inactive(&self, tls: &mut Tls, vpsid: u16) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.set_inactive(tls))?
    }

    pub fn clear(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic, vpsid: u16) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.clear(tls, intrinsic))?
    }

    pub fn migrate(&self, tls: &Tls, vpsid: u16, ppid: u16) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.migrate(tls, ppid))?
    }

    pub fn read8(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        index: u64,
    ) -> MkResult<u8> {
        self.pool.with(vpsid, |vps| vps.read8(tls, intrinsic, index))?
    }

    pub fn read16(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        index: u64,
    ) -> MkResult<u16> {
        self.pool.with(vpsid, |vps| vps.read16(tls, intrinsic, index))?
    }

    pub fn read32(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        index: u64,
    ) -> MkResult<u32> {
        self.pool.with(vpsid, |vps| vps.read32(tls, intrinsic, index))?
    }

    pub fn read64(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        index: u64,
    ) -> MkResult<u64> {
        self.pool.with(vpsid, |vps| vps.read64(tls, intrinsic, index))?
    }

    pub fn write8(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        index: u64,
        val: u8,
    ) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.write8(tls, intrinsic, index, val))?
    }

    pub fn write16(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        index: u64,
        val: u16,
    ) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.write16(tls, intrinsic, index, val))?
    }

    pub fn write32(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        index: u64,
        val: u32,
    ) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.write32(tls, intrinsic, index, val))?
    }

    pub fn write64(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        index: u64,
        val: u64,
    ) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.write64(tls, intrinsic, index, val))?
    }

    pub fn read_reg(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        reg: BfReg,
    ) -> MkResult<u64> {
        self.pool.with(vpsid, |vps| vps.read_reg(tls, intrinsic, reg))?
    }

    pub fn write_reg(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        reg: BfReg,
        val: u64,
    ) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.write_reg(tls, intrinsic, reg, val))?
    }

    pub fn state_save_to_vps(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        state: &StateSave,
    ) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.state_save_to_vps(tls, intrinsic, state))?
    }

    pub fn vps_to_state_save(
        &self,
        tls: &mut Tls,
        intrinsic: &dyn Intrinsic,
        vpsid: u16,
        state: &mut StateSave,
    ) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.vps_to_state_save(tls, intrinsic, state))?
    }

    pub fn advance_ip(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic, vpsid: u16) -> MkResult<()> {
        self.pool.with(vpsid, |vps| vps.advance_ip(tls, intrinsic))?
    }

    pub fn run(&self, tls: &mut Tls, intrinsic: &dyn Intrinsic, vpsid: u16) -> MkResult<u64> {
        self.pool.with(vpsid, |vps| vps.run(tls, intrinsic))?
    }

    /// True if any allocated VPS is assigned to the given VP. Destroying a
    /// VP is refused while this holds.
    pub fn any_assigned_to_vp(&self, vpid: u16) -> bool {
        let mut found = false;
        self.pool.for_each(|_, vps| {
            if vps.is_allocated() && vps.assigned_vp() == vpid {
                found = true;
            }
        });
        found
    }
}

impl Default for VpsPool {
    fn default() -> Self {
        Self::new()
    }
}
