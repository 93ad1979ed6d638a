//! The CPU instruction surface the kernel executes
//!
//! Everything the microkernel does to the hardware goes through this trait:
//! MSR access, TLB/EPT/VPID invalidation, VMCS/VMCB management, the guest
//! launch itself, the jump into the extension and the final promote back to
//! the host OS. The bodies are side effects only; `nanovisor-x86_64`
//! provides the bare-metal implementation and host tests provide a mock, so
//! every kernel path above this line runs unmodified in both worlds.

use crate::state::StateSave;
use crate::tls::Tls;
use static_assertions::const_assert_eq;

/// CPU vendor, which selects the VPS backend (VMCS vs. VMCB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
}

/// Errors surfaced by the intrinsic layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicError {
    /// RDMSR/WRMSR faulted (unsupported or locked MSR)
    Msr,
    /// A VMX instruction failed with a valid current VMCS; carries the
    /// VM-instruction-error field
    VmxFailValid(u32),
    /// A VMX instruction failed with no valid current VMCS
    VmxFailInvalid,
    /// The extension faulted or exited abnormally
    ExtFault,
}

/// A failed guest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmRunError {
    /// VMLAUNCH/VMRESUME/VMRUN refused entry; carries the
    /// VM-instruction-error field (Intel) or the exit code (AMD)
    EntryFailed(u64),
    /// No valid current VMCS/VMCB
    InvalidState,
}

/// The general purpose registers the hardware does not save across a guest
/// entry. The run shim restores these before entry and stores them back on
/// exit. `#[repr(C)]`: the assembly side indexes this block by offset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MissingRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

const_assert_eq!(core::mem::size_of::<MissingRegisters>(), 120);

/// Thin, mockable wrappers over the CPU instructions the kernel uses.
pub trait Intrinsic: Sync {
    /// Reports the CPU vendor this PP runs on.
    fn vendor(&self) -> Vendor;

    /// Writes the thread pointer (IA32_FS_BASE) for the extension ABI.
    fn set_tp(&self, val: u64);

    /// Loads CR3 with the physical address of a PML4T.
    fn set_cr3(&self, phys: u64);

    /// Stops this PP. Fatal paths only.
    fn halt(&self) -> !;

    /// Reads an MSR.
    fn rdmsr(&self, msr: u32) -> Result<u64, IntrinsicError>;

    /// Writes an MSR.
    fn wrmsr(&self, msr: u32, val: u64) -> Result<(), IntrinsicError>;

    /// Invalidates the TLB entry for a virtual address on this PP.
    fn invlpg(&self, virt: u64);

    /// Invalidates guest TLB entries for an address/ASID pair (AMD).
    fn invlpga(&self, virt: u64, asid: u64);

    /// Invalidates EPT-derived mappings (Intel).
    fn invept(&self, eptp: u64, kind: u64);

    /// Invalidates VPID-tagged mappings (Intel).
    fn invvpid(&self, virt: u64, vpid: u16, kind: u64);

    /// VMCLEAR (Intel): flushes and deactivates the VMCS at `phys`. On AMD
    /// this is a no-op; the VMCB has no load state to flush.
    fn vmclear(&self, phys: u64) -> Result<(), IntrinsicError>;

    /// VMPTRLD (Intel): makes the VMCS at `phys` current on this PP. On
    /// AMD this is a no-op.
    fn vmload(&self, phys: u64) -> Result<(), IntrinsicError>;

    /// VMREAD of a 16-bit field from the current VMCS.
    fn vmread16(&self, field: u64) -> Result<u16, IntrinsicError>;

    /// VMREAD of a 32-bit field from the current VMCS.
    fn vmread32(&self, field: u64) -> Result<u32, IntrinsicError>;

    /// VMREAD of a 64-bit field from the current VMCS.
    fn vmread64(&self, field: u64) -> Result<u64, IntrinsicError>;

    /// VMWRITE of a 16-bit field to the current VMCS.
    fn vmwrite16(&self, field: u64, val: u16) -> Result<(), IntrinsicError>;

    /// VMWRITE of a 32-bit field to the current VMCS.
    fn vmwrite32(&self, field: u64, val: u32) -> Result<(), IntrinsicError>;

    /// VMWRITE of a 64-bit field to the current VMCS.
    fn vmwrite64(&self, field: u64, val: u64) -> Result<(), IntrinsicError>;

    /// Enters the guest: restores `regs`, executes VMLAUNCH (first entry on
    /// this PP) or VMRESUME (Intel), or VMRUN against the VMCB at `hw_phys`
    /// (AMD), then stores the exit-time GPRs back into `regs` and returns
    /// the raw exit reason.
    fn vm_run(
        &self,
        regs: &mut MissingRegisters,
        hw_phys: u64,
        launched: bool,
    ) -> Result<u64, VmRunError>;

    /// Transfers control to the extension at `ip` with `arg0`/`arg1` per
    /// the SysV ABI, on the stack recorded in `tls.sp`. The extension's
    /// syscalls arrive through the same TLS block. Returns `Ok(())` when
    /// the extension hands control back through the syscall layer and
    /// `Err` when it returns without doing so or faults.
    fn call_ext(
        &self,
        tls: &mut Tls,
        ip: u64,
        arg0: u64,
        arg1: u64,
    ) -> Result<(), IntrinsicError>;

    /// Merges `state` back into this PP and resumes the host OS at the
    /// loader's return point. Never returns on hardware; the signature
    /// stays non-diverging so a mock can observe it.
    fn promote(&self, state: &StateSave);
}
