//! Intel VMCS field encodings
//!
//! The architectural field encodings the kernel reads and writes. Only the
//! subset the kernel itself touches is named here; extensions address any
//! field they like by its raw encoding.

#![allow(missing_docs)]

// 16-bit control fields
pub const VIRTUAL_PROCESSOR_ID: u64 = 0x0000;

// 16-bit guest state fields
pub const GUEST_ES_SELECTOR: u64 = 0x0800;
pub const GUEST_CS_SELECTOR: u64 = 0x0802;
pub const GUEST_SS_SELECTOR: u64 = 0x0804;
pub const GUEST_DS_SELECTOR: u64 = 0x0806;
pub const GUEST_FS_SELECTOR: u64 = 0x0808;
pub const GUEST_GS_SELECTOR: u64 = 0x080A;
pub const GUEST_LDTR_SELECTOR: u64 = 0x080C;
pub const GUEST_TR_SELECTOR: u64 = 0x080E;

// 64-bit guest state fields
pub const VMCS_LINK_POINTER: u64 = 0x2800;
pub const GUEST_IA32_DEBUGCTL: u64 = 0x2802;
pub const GUEST_IA32_PAT: u64 = 0x2804;
pub const GUEST_IA32_EFER: u64 = 0x2806;

// 32-bit read-only data fields
pub const VM_INSTRUCTION_ERROR: u64 = 0x4400;
pub const EXIT_REASON: u64 = 0x4402;
pub const VM_EXIT_INSTRUCTION_LEN: u64 = 0x440C;

// 32-bit guest state fields
pub const GUEST_ES_LIMIT: u64 = 0x4800;
pub const GUEST_CS_LIMIT: u64 = 0x4802;
pub const GUEST_SS_LIMIT: u64 = 0x4804;
pub const GUEST_DS_LIMIT: u64 = 0x4806;
pub const GUEST_FS_LIMIT: u64 = 0x4808;
pub const GUEST_GS_LIMIT: u64 = 0x480A;
pub const GUEST_LDTR_LIMIT: u64 = 0x480C;
pub const GUEST_TR_LIMIT: u64 = 0x480E;
pub const GUEST_GDTR_LIMIT: u64 = 0x4810;
pub const GUEST_IDTR_LIMIT: u64 = 0x4812;
pub const GUEST_ES_AR_BYTES: u64 = 0x4814;
pub const GUEST_CS_AR_BYTES: u64 = 0x4816;
pub const GUEST_SS_AR_BYTES: u64 = 0x4818;
pub const GUEST_DS_AR_BYTES: u64 = 0x481A;
pub const GUEST_FS_AR_BYTES: u64 = 0x481C;
pub const GUEST_GS_AR_BYTES: u64 = 0x481E;
pub const GUEST_LDTR_AR_BYTES: u64 = 0x4820;
pub const GUEST_TR_AR_BYTES: u64 = 0x4822;
pub const GUEST_IA32_SYSENTER_CS: u64 = 0x482A;

// natural-width guest state fields
pub const GUEST_CR0: u64 = 0x6800;
pub const GUEST_CR3: u64 = 0x6802;
pub const GUEST_CR4: u64 = 0x6804;
pub const GUEST_ES_BASE: u64 = 0x6806;
pub const GUEST_CS_BASE: u64 = 0x6808;
pub const GUEST_SS_BASE: u64 = 0x680A;
pub const GUEST_DS_BASE: u64 = 0x680C;
pub const GUEST_FS_BASE: u64 = 0x680E;
pub const GUEST_GS_BASE: u64 = 0x6810;
pub const GUEST_LDTR_BASE: u64 = 0x6812;
pub const GUEST_TR_BASE: u64 = 0x6814;
pub const GUEST_GDTR_BASE: u64 = 0x6816;
pub const GUEST_IDTR_BASE: u64 = 0x6818;
pub const GUEST_DR7: u64 = 0x681A;
pub const GUEST_RSP: u64 = 0x681C;
pub const GUEST_RIP: u64 = 0x681E;
pub const GUEST_RFLAGS: u64 = 0x6820;
pub const GUEST_IA32_SYSENTER_ESP: u64 = 0x6824;
pub const GUEST_IA32_SYSENTER_EIP: u64 = 0x6826;

// host state fields the run shim maintains
pub const HOST_RSP: u64 = 0x6C14;
pub const HOST_RIP: u64 = 0x6C16;

/// IA32_VMX_BASIC: bits [30:0] are the VMCS revision identifier
pub const IA32_VMX_BASIC: u32 = 0x480;

/// The revision-id mask of IA32_VMX_BASIC
pub const VMX_BASIC_REVISION_MASK: u64 = 0x7FFF_FFFF;
