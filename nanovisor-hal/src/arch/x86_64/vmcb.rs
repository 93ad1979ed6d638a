//! AMD VMCB layout
//!
//! On AMD the VPS's hardware structure is a VMCB: one 4 KiB page split into
//! a control area (offsets 0x000..0x400) and a state-save area (0x400..).
//! Field access is a structured memory access by byte offset, so the
//! constants below are plain offsets into the page. Extensions address any
//! offset they like; the kernel itself only touches the ones named here.

#![allow(missing_docs)]

use static_assertions::const_assert_eq;

/// Size of the VMCB, one page
pub const VMCB_SIZE: usize = 4096;

// control area
pub const INTERCEPT_CR: usize = 0x000;
pub const INTERCEPT_DR: usize = 0x004;
pub const INTERCEPT_EXCEPTION: usize = 0x008;
pub const INTERCEPT_INSTRUCTION1: usize = 0x00C;
pub const INTERCEPT_INSTRUCTION2: usize = 0x010;
pub const GUEST_ASID: usize = 0x058;
pub const TLB_CONTROL: usize = 0x05C;
pub const EXITCODE: usize = 0x070;
pub const EXITINFO1: usize = 0x078;
pub const EXITINFO2: usize = 0x080;
pub const NRIP: usize = 0x0C8;

// state-save area
pub const SAVE_ES_SELECTOR: usize = 0x400;
pub const SAVE_CS_SELECTOR: usize = 0x410;
pub const SAVE_SS_SELECTOR: usize = 0x420;
pub const SAVE_DS_SELECTOR: usize = 0x430;
pub const SAVE_FS_SELECTOR: usize = 0x440;
pub const SAVE_GS_SELECTOR: usize = 0x450;
pub const SAVE_GDTR: usize = 0x460;
pub const SAVE_LDTR: usize = 0x470;
pub const SAVE_IDTR: usize = 0x480;
pub const SAVE_TR: usize = 0x490;
pub const SAVE_EFER: usize = 0x4D0;
pub const SAVE_CR4: usize = 0x548;
pub const SAVE_CR3: usize = 0x550;
pub const SAVE_CR0: usize = 0x558;
pub const SAVE_DR7: usize = 0x560;
pub const SAVE_DR6: usize = 0x568;
pub const SAVE_RFLAGS: usize = 0x570;
pub const SAVE_RIP: usize = 0x578;
pub const SAVE_RSP: usize = 0x5D8;
pub const SAVE_RAX: usize = 0x5F8;
pub const SAVE_STAR: usize = 0x600;
pub const SAVE_LSTAR: usize = 0x608;
pub const SAVE_CSTAR: usize = 0x610;
pub const SAVE_SFMASK: usize = 0x618;
pub const SAVE_KERNEL_GS_BASE: usize = 0x620;
pub const SAVE_SYSENTER_CS: usize = 0x628;
pub const SAVE_SYSENTER_ESP: usize = 0x630;
pub const SAVE_SYSENTER_EIP: usize = 0x638;
pub const SAVE_CR2: usize = 0x640;
pub const SAVE_PAT: usize = 0x668;
pub const SAVE_DBGCTL: usize = 0x670;

/// Each segment slot in the save area: selector, attrib, limit, base
pub const SEG_SELECTOR_OFF: usize = 0x0;
pub const SEG_ATTRIB_OFF: usize = 0x2;
pub const SEG_LIMIT_OFF: usize = 0x4;
pub const SEG_BASE_OFF: usize = 0x8;

/// The VMCB page as the kernel sees it
#[repr(C, align(4096))]
pub struct Vmcb {
    pub bytes: [u8; VMCB_SIZE],
}

const_assert_eq!(core::mem::size_of::<Vmcb>(), VMCB_SIZE);
