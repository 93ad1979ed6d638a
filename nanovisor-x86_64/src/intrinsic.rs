//! Bare-metal implementation of the `Intrinsic` trait
//!
//! Inline assembly for the instruction wrappers and a handful of
//! `global_asm!` shims for the paths that juggle whole register files: the
//! guest world switch, the jump into the extension and the promote back to
//! the host OS. Host builds compile the mock in `nanovisor-core`'s tests
//! instead; this module only exists on `target_os = "none"`.
#![cfg(target_os = "none")]

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicU64, Ordering};

use nanovisor_hal::arch::x86_64::vmcb::EXITCODE;
use nanovisor_hal::arch::x86_64::vmcs::VM_INSTRUCTION_ERROR;
use nanovisor_hal::intrinsic::{
    Intrinsic, IntrinsicError, MissingRegisters, Vendor, VmRunError,
};
use nanovisor_hal::state::StateSave;
use nanovisor_hal::tls::Tls;
use raw_cpuid::CpuId;

/// Sentinel the run shim returns when the entry instruction itself failed.
const RUN_FAILED: u64 = u64::MAX;

/// IA32_FS_BASE, the extension thread pointer
const MSR_IA32_FS_BASE: u32 = 0xC000_0100;

// The run shims are defined below; the extension trampolines
// (`nanovisor_call_ext`, `nanovisor_promote`) are provided by the platform
// boot assembly together with the syscall entry and the ring transition,
// which own the GDT selector layout.
extern "C" {
    /// World switch for Intel. `launched` selects VMLAUNCH vs. VMRESUME.
    /// Returns the exit reason, or `RUN_FAILED` if entry was refused.
    fn nanovisor_vmx_run(regs: *mut MissingRegisters, launched: u64) -> u64;

    /// World switch for AMD against the VMCB at `vmcb_phys`. Returns
    /// `RUN_FAILED` if VMRUN was refused; the exit code lives in the VMCB.
    fn nanovisor_svm_run(regs: *mut MissingRegisters, vmcb_phys: u64) -> u64;

    /// Drops to the extension at `ip` on stack `sp` with two SysV args.
    /// Returns 0 when the extension handed control back through the run
    /// path and non-zero when it returned or faulted.
    fn nanovisor_call_ext(ip: u64, sp: u64, arg0: u64, arg1: u64) -> u64;

    /// Restores `state` into this PP and resumes the host OS. Does not
    /// return.
    fn nanovisor_promote(state: *const StateSave) -> !;
}

/// The real CPU. One instance is shared by every PP; the type carries no
/// state beyond the detected vendor.
pub struct HwIntrinsic {
    vendor: Vendor,
    /// direct map offset for turning a VMCB physical address into a
    /// kernel pointer when reading the exit code
    vmcb_virt_offset: AtomicU64,
}

impl HwIntrinsic {
    /// Detects the vendor. Anything that is not AuthenticAMD is driven as
    /// Intel; the VMX path is the common denominator.
    pub fn new() -> Self {
        let vendor = match CpuId::new().get_vendor_info() {
            Some(vi) if vi.as_str() == "AuthenticAMD" => Vendor::Amd,
            _ => Vendor::Intel,
        };

        Self { vendor, vmcb_virt_offset: AtomicU64::new(0) }
    }

    /// Records the phys-to-virt offset of the page pool so the SVM run
    /// path can read the VMCB exit code.
    pub fn set_vmcb_virt_offset(&self, offset: u64) {
        self.vmcb_virt_offset.store(offset, Ordering::Relaxed);
    }

    fn vm_instruction_error(&self) -> u64 {
        self.vmread32(VM_INSTRUCTION_ERROR).map(u64::from).unwrap_or(0)
    }
}

impl Default for HwIntrinsic {
    fn default() -> Self {
        Self::new()
    }
}

impl Intrinsic for HwIntrinsic {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn set_tp(&self, val: u64) {
        let _ = self.wrmsr(MSR_IA32_FS_BASE, val);
    }

    fn set_cr3(&self, phys: u64) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;

        let frame = PhysFrame::containing_address(PhysAddr::new(phys));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    fn halt(&self) -> ! {
        loop {
            unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }

    fn rdmsr(&self, msr: u32) -> Result<u64, IntrinsicError> {
        let (high, low): (u32, u32);
        unsafe {
            asm!(
                "rdmsr",
                in("ecx") msr,
                out("eax") low,
                out("edx") high,
                options(nomem, nostack, preserves_flags),
            );
        }
        Ok(((high as u64) << 32) | (low as u64))
    }

    fn wrmsr(&self, msr: u32, val: u64) -> Result<(), IntrinsicError> {
        let low = val as u32;
        let high = (val >> 32) as u32;
        unsafe {
            asm!(
                "wrmsr",
                in("ecx") msr,
                in("eax") low,
                in("edx") high,
                options(nomem, nostack, preserves_flags),
            );
        }
        Ok(())
    }

    fn invlpg(&self, virt: u64) {
        unsafe {
            asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
        }
    }

    fn invlpga(&self, virt: u64, asid: u64) {
        // operands are implicit: rax carries the address, ecx the ASID
        unsafe {
            asm!(
                "invlpga",
                in("rax") virt,
                in("rcx") asid,
                options(nostack, preserves_flags),
            );
        }
    }

    fn invept(&self, eptp: u64, kind: u64) {
        let descriptor: [u64; 2] = [eptp, 0];
        unsafe {
            asm!(
                "invept {}, [{}]",
                in(reg) kind,
                in(reg) descriptor.as_ptr(),
                options(nostack),
            );
        }
    }

    fn invvpid(&self, virt: u64, vpid: u16, kind: u64) {
        let descriptor: [u64; 2] = [vpid as u64, virt];
        unsafe {
            asm!(
                "invvpid {}, [{}]",
                in(reg) kind,
                in(reg) descriptor.as_ptr(),
                options(nostack),
            );
        }
    }

    fn vmclear(&self, phys: u64) -> Result<(), IntrinsicError> {
        if self.vendor == Vendor::Amd {
            return Ok(());
        }

        unsafe { x86::bits64::vmx::vmclear(phys) }.map_err(|e| match e {
            x86::vmx::VmFail::VmFailValid => {
                IntrinsicError::VmxFailValid(self.vm_instruction_error() as u32)
            }
            x86::vmx::VmFail::VmFailInvalid => IntrinsicError::VmxFailInvalid,
        })
    }

    fn vmload(&self, phys: u64) -> Result<(), IntrinsicError> {
        if self.vendor == Vendor::Amd {
            return Ok(());
        }

        unsafe { x86::bits64::vmx::vmptrld(phys) }.map_err(|e| match e {
            x86::vmx::VmFail::VmFailValid => {
                IntrinsicError::VmxFailValid(self.vm_instruction_error() as u32)
            }
            x86::vmx::VmFail::VmFailInvalid => IntrinsicError::VmxFailInvalid,
        })
    }

    fn vmread16(&self, field: u64) -> Result<u16, IntrinsicError> {
        self.vmread64(field).map(|v| v as u16)
    }

    fn vmread32(&self, field: u64) -> Result<u32, IntrinsicError> {
        self.vmread64(field).map(|v| v as u32)
    }

    fn vmread64(&self, field: u64) -> Result<u64, IntrinsicError> {
        unsafe { x86::bits64::vmx::vmread(field as u32) }
            .map_err(|_| IntrinsicError::VmxFailInvalid)
    }

    fn vmwrite16(&self, field: u64, val: u16) -> Result<(), IntrinsicError> {
        self.vmwrite64(field, val as u64)
    }

    fn vmwrite32(&self, field: u64, val: u32) -> Result<(), IntrinsicError> {
        self.vmwrite64(field, val as u64)
    }

    fn vmwrite64(&self, field: u64, val: u64) -> Result<(), IntrinsicError> {
        unsafe { x86::bits64::vmx::vmwrite(field as u32, val) }.map_err(|e| match e {
            x86::vmx::VmFail::VmFailValid => {
                IntrinsicError::VmxFailValid(self.vm_instruction_error() as u32)
            }
            x86::vmx::VmFail::VmFailInvalid => IntrinsicError::VmxFailInvalid,
        })
    }

    fn vm_run(
        &self,
        regs: &mut MissingRegisters,
        hw_phys: u64,
        launched: bool,
    ) -> Result<u64, VmRunError> {
        match self.vendor {
            Vendor::Intel => {
                let reason = unsafe { nanovisor_vmx_run(regs, launched as u64) };
                if reason == RUN_FAILED {
                    return Err(VmRunError::EntryFailed(self.vm_instruction_error()));
                }

                Ok(reason)
            }
            Vendor::Amd => {
                let ret = unsafe { nanovisor_svm_run(regs, hw_phys) };
                if ret == RUN_FAILED {
                    return Err(VmRunError::InvalidState);
                }

                // exit code lives in the VMCB control area
                let offset = self.vmcb_virt_offset.load(Ordering::Relaxed);
                let exitcode = unsafe {
                    core::ptr::read_volatile(
                        (hw_phys.wrapping_add(offset) as usize + EXITCODE) as *const u64,
                    )
                };

                // -1 is VMEXIT_INVALID
                if exitcode == u64::MAX {
                    return Err(VmRunError::EntryFailed(exitcode));
                }

                Ok(exitcode)
            }
        }
    }

    fn call_ext(
        &self,
        tls: &mut Tls,
        ip: u64,
        arg0: u64,
        arg1: u64,
    ) -> Result<(), IntrinsicError> {
        match unsafe { nanovisor_call_ext(ip, tls.sp, arg0, arg1) } {
            0 => Ok(()),
            _ => Err(IntrinsicError::ExtFault),
        }
    }

    fn promote(&self, state: &StateSave) {
        unsafe { nanovisor_promote(state) }
    }
}

// -------------------------------------------------------------------------
// world-switch shims
// -------------------------------------------------------------------------
//
// MissingRegisters layout (offsets the shims index by):
//   0x00 rax, 0x08 rbx, 0x10 rcx, 0x18 rdx, 0x20 rbp, 0x28 rsi, 0x30 rdi,
//   0x38 r8 ... 0x70 r15

global_asm!(
    // u64 nanovisor_vmx_run(regs: rdi, launched: rsi)
    ".global nanovisor_vmx_run",
    "nanovisor_vmx_run:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    // host resume point and stack
    "mov rax, 0x6C14", // HOST_RSP
    "vmwrite rax, rsp",
    "lea rdx, [rip + 2f]",
    "mov rax, 0x6C16", // HOST_RIP
    "vmwrite rax, rdx",
    // keep the launched flag in rcx until the flags are set, then restore
    // the guest's missing registers, rcx and rdi last
    "mov rcx, rsi",
    "mov rax, [rdi + 0x00]",
    "mov rbx, [rdi + 0x08]",
    "mov rdx, [rdi + 0x18]",
    "mov rbp, [rdi + 0x20]",
    "mov rsi, [rdi + 0x28]",
    "mov r8,  [rdi + 0x38]",
    "mov r9,  [rdi + 0x40]",
    "mov r10, [rdi + 0x48]",
    "mov r11, [rdi + 0x50]",
    "mov r12, [rdi + 0x58]",
    "mov r13, [rdi + 0x60]",
    "mov r14, [rdi + 0x68]",
    "mov r15, [rdi + 0x70]",
    "test rcx, rcx",
    "mov rcx, [rdi + 0x10]",
    "mov rdi, [rdi + 0x30]",
    "jnz 3f",
    "vmlaunch",
    "jmp 4f",
    "3:",
    "vmresume",
    "4:",
    // entry refused: VMLAUNCH/VMRESUME fell through
    "pop rdi",
    "mov rax, -1",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
    // vmexit lands here with rsp == HOST_RSP
    "2:",
    "xchg rdi, [rsp]", // rdi = regs ptr, [rsp] = guest rdi
    "mov [rdi + 0x00], rax",
    "mov [rdi + 0x08], rbx",
    "mov [rdi + 0x10], rcx",
    "mov [rdi + 0x18], rdx",
    "mov [rdi + 0x20], rbp",
    "mov [rdi + 0x28], rsi",
    "mov [rdi + 0x38], r8",
    "mov [rdi + 0x40], r9",
    "mov [rdi + 0x48], r10",
    "mov [rdi + 0x50], r11",
    "mov [rdi + 0x58], r12",
    "mov [rdi + 0x60], r13",
    "mov [rdi + 0x68], r14",
    "mov [rdi + 0x70], r15",
    "pop rax",                // guest rdi
    "mov [rdi + 0x30], rax",
    "mov rdx, 0x4402",        // EXIT_REASON
    "vmread rax, rdx",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
);

global_asm!(
    // u64 nanovisor_svm_run(regs: rdi, vmcb_phys: rsi)
    ".global nanovisor_svm_run",
    "nanovisor_svm_run:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    "mov rax, rsi", // VMRUN takes the VMCB physical address in rax
    // guest rax/rsp live in the VMCB; restore the rest, rdi last
    "mov rbx, [rdi + 0x08]",
    "mov rcx, [rdi + 0x10]",
    "mov rdx, [rdi + 0x18]",
    "mov rbp, [rdi + 0x20]",
    "mov rsi, [rdi + 0x28]",
    "mov r8,  [rdi + 0x38]",
    "mov r9,  [rdi + 0x40]",
    "mov r10, [rdi + 0x48]",
    "mov r11, [rdi + 0x50]",
    "mov r12, [rdi + 0x58]",
    "mov r13, [rdi + 0x60]",
    "mov r14, [rdi + 0x68]",
    "mov r15, [rdi + 0x70]",
    "mov rdi, [rdi + 0x30]",
    "vmload rax",
    "vmrun rax",
    "vmsave rax",
    // store the guest's registers back
    "xchg rdi, [rsp]",
    "mov [rdi + 0x08], rbx",
    "mov [rdi + 0x10], rcx",
    "mov [rdi + 0x18], rdx",
    "mov [rdi + 0x20], rbp",
    "mov [rdi + 0x28], rsi",
    "mov [rdi + 0x38], r8",
    "mov [rdi + 0x40], r9",
    "mov [rdi + 0x48], r10",
    "mov [rdi + 0x50], r11",
    "mov [rdi + 0x58], r12",
    "mov [rdi + 0x60], r13",
    "mov [rdi + 0x68], r14",
    "mov [rdi + 0x70], r15",
    "pop rbx",                // guest rdi
    "mov [rdi + 0x30], rbx",
    "xor rax, rax",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
);
