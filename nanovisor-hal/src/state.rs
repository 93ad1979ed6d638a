//! Loader state-save layout
//!
//! The loader hands the kernel two of these per PP: the microkernel's own
//! entry state (`mk_state`) and the root VP's state (`root_vp_state`). The
//! root VP state seeds `bf_vps_op_init_as_root` and is rewritten by
//! `bf_vps_op_promote` before control returns to the host OS. The layout is
//! bit-exact between the loader and the kernel.

use static_assertions::const_assert_eq;

/// A GDTR/IDTR image
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
    _pad: [u16; 3],
}

impl DescriptorTable {
    pub const fn new(base: u64, limit: u16) -> Self {
        Self { base, limit, _pad: [0; 3] }
    }
}

/// A segment register image: selector, access rights, limit and base
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SegmentRegister {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}

/// The register file the hardware does not move for us. One blob carries
/// everything needed to either seed a VPS from the boot CPU or merge a VPS
/// back into it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct StateSave {
    // general purpose registers
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
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,

    // descriptor tables
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,

    // segment registers
    pub es: SegmentRegister,
    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub fs: SegmentRegister,
    pub gs: SegmentRegister,
    pub ldtr: SegmentRegister,
    pub tr: SegmentRegister,

    // control and debug registers
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr6: u64,
    pub dr7: u64,

    // MSRs the kernel tracks per VP
    pub ia32_efer: u64,
    pub ia32_star: u64,
    pub ia32_lstar: u64,
    pub ia32_cstar: u64,
    pub ia32_fmask: u64,
    pub ia32_fs_base: u64,
    pub ia32_gs_base: u64,
    pub ia32_kernel_gs_base: u64,
    pub ia32_sysenter_cs: u64,
    pub ia32_sysenter_esp: u64,
    pub ia32_sysenter_eip: u64,
    pub ia32_pat: u64,
    pub ia32_debugctl: u64,
}

const_assert_eq!(core::mem::size_of::<DescriptorTable>(), 16);
const_assert_eq!(core::mem::size_of::<SegmentRegister>(), 16);
const_assert_eq!(core::mem::size_of::<StateSave>(), 456);
