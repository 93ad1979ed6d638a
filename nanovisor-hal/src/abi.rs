//! Syscall ABI constants
//!
//! Extensions reach the kernel through a fast syscall instruction carrying a
//! 64-bit opcode plus four argument registers. The opcode word decomposes
//! into four 16-bit lanes: signature [63:48], flags [47:32], opcode [31:16]
//! and index [15:0]. Everything in this module is shared verbatim between
//! the kernel and the extension SDK, so the values here are the ABI.

/// Reserved id meaning "no object"
pub const BF_INVALID_ID: u16 = 0xFFFF;

/// The root VM's id. The root VM can never be destroyed.
pub const BF_ROOT_VMID: u16 = 0;

/// The bootstrap PP's id. Only the BSP runs full initialization.
pub const BF_BS_PPID: u16 = 0;

/// Version token for ABI generation 1
pub const BF_SPEC_ID1_VAL: u32 = 1 << 0;

/// Mask isolating generation 1 from a version word
pub const BF_SPEC_ID1_MASK: u32 = 1 << 0;

/// Everything this kernel implements
pub const BF_ALL_SPECS_SUPPORTED_VAL: u32 = BF_SPEC_ID1_VAL;

/// Returns true if the kernel supports the ABI generations `version` asks
/// for.
#[inline]
pub const fn bf_is_spec_supported(version: u32) -> bool {
    version != 0 && (version & !BF_ALL_SPECS_SUPPORTED_VAL) == 0
}

// -------------------------------------------------------------------------
// opcode word decomposition
// -------------------------------------------------------------------------

/// The signature every opcode word must carry in bits [63:48]
pub const BF_SYSCALL_SIG_VAL: u64 = 0x6642_0000_0000_0000;

const SIG_MASK: u64 = 0xFFFF_0000_0000_0000;
const FLAGS_MASK: u64 = 0x0000_FFFF_0000_0000;
const OPCODE_MASK: u64 = 0xFFFF_0000_FFFF_0000;
const OPCODE_NOSIG_MASK: u64 = 0x0000_0000_FFFF_0000;
const INDEX_MASK: u64 = 0x0000_0000_0000_FFFF;

/// The signature lane of an opcode word
#[inline]
pub const fn bf_syscall_sig(val: u64) -> u64 {
    val & SIG_MASK
}

/// The flags lane of an opcode word
#[inline]
pub const fn bf_syscall_flags(val: u64) -> u64 {
    val & FLAGS_MASK
}

/// The opcode lane including the signature
#[inline]
pub const fn bf_syscall_opcode(val: u64) -> u64 {
    val & OPCODE_MASK
}

/// The opcode lane with the signature stripped
#[inline]
pub const fn bf_syscall_opcode_nosig(val: u64) -> u64 {
    val & OPCODE_NOSIG_MASK
}

/// The index lane of an opcode word
#[inline]
pub const fn bf_syscall_index(val: u64) -> u64 {
    val & INDEX_MASK
}

// -------------------------------------------------------------------------
// sub-system opcodes (bits [31:16], shown with the signature merged in)
// -------------------------------------------------------------------------

pub const BF_HANDLE_OP_VAL: u64 = BF_SYSCALL_SIG_VAL | 0x0000_0000_0001_0000;
pub const BF_CALLBACK_OP_VAL: u64 = BF_SYSCALL_SIG_VAL | 0x0000_0000_0003_0000;
pub const BF_VM_OP_VAL: u64 = BF_SYSCALL_SIG_VAL | 0x0000_0000_0004_0000;
pub const BF_VP_OP_VAL: u64 = BF_SYSCALL_SIG_VAL | 0x0000_0000_0005_0000;
pub const BF_VPS_OP_VAL: u64 = BF_SYSCALL_SIG_VAL | 0x0000_0000_0006_0000;
pub const BF_INTRINSIC_OP_VAL: u64 = BF_SYSCALL_SIG_VAL | 0x0000_0000_0007_0000;
pub const BF_MEM_OP_VAL: u64 = BF_SYSCALL_SIG_VAL | 0x0000_0000_0008_0000;

// -------------------------------------------------------------------------
// per-family indices (bits [15:0])
// -------------------------------------------------------------------------

pub const BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL: u64 = 0x0000;
pub const BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL: u64 = 0x0001;

pub const BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL: u64 = 0x0000;
pub const BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL: u64 = 0x0001;
pub const BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL: u64 = 0x0002;

pub const BF_VM_OP_CREATE_VM_IDX_VAL: u64 = 0x0000;
pub const BF_VM_OP_DESTROY_VM_IDX_VAL: u64 = 0x0001;

pub const BF_VP_OP_CREATE_VP_IDX_VAL: u64 = 0x0000;
pub const BF_VP_OP_DESTROY_VP_IDX_VAL: u64 = 0x0001;
pub const BF_VP_OP_MIGRATE_IDX_VAL: u64 = 0x0002;

pub const BF_VPS_OP_CREATE_VPS_IDX_VAL: u64 = 0x0000;
pub const BF_VPS_OP_DESTROY_VPS_IDX_VAL: u64 = 0x0001;
pub const BF_VPS_OP_INIT_AS_ROOT_IDX_VAL: u64 = 0x0002;
pub const BF_VPS_OP_READ8_IDX_VAL: u64 = 0x0003;
pub const BF_VPS_OP_READ16_IDX_VAL: u64 = 0x0004;
pub const BF_VPS_OP_READ32_IDX_VAL: u64 = 0x0005;
pub const BF_VPS_OP_READ64_IDX_VAL: u64 = 0x0006;
pub const BF_VPS_OP_WRITE8_IDX_VAL: u64 = 0x0007;
pub const BF_VPS_OP_WRITE16_IDX_VAL: u64 = 0x0008;
pub const BF_VPS_OP_WRITE32_IDX_VAL: u64 = 0x0009;
pub const BF_VPS_OP_WRITE64_IDX_VAL: u64 = 0x000A;
pub const BF_VPS_OP_READ_REG_IDX_VAL: u64 = 0x000B;
pub const BF_VPS_OP_WRITE_REG_IDX_VAL: u64 = 0x000C;
pub const BF_VPS_OP_RUN_IDX_VAL: u64 = 0x000D;
pub const BF_VPS_OP_RUN_CURRENT_IDX_VAL: u64 = 0x000E;
pub const BF_VPS_OP_ADVANCE_IP_IDX_VAL: u64 = 0x000F;
pub const BF_VPS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL: u64 = 0x0010;
pub const BF_VPS_OP_PROMOTE_IDX_VAL: u64 = 0x0011;
pub const BF_VPS_OP_CLEAR_VPS_IDX_VAL: u64 = 0x0012;

pub const BF_INTRINSIC_OP_RDMSR_IDX_VAL: u64 = 0x0000;
pub const BF_INTRINSIC_OP_WRMSR_IDX_VAL: u64 = 0x0001;
pub const BF_INTRINSIC_OP_INVLPGA_IDX_VAL: u64 = 0x0002;
pub const BF_INTRINSIC_OP_INVEPT_IDX_VAL: u64 = 0x0003;
pub const BF_INTRINSIC_OP_INVVPID_IDX_VAL: u64 = 0x0004;

pub const BF_MEM_OP_ALLOC_PAGE_IDX_VAL: u64 = 0x0000;
pub const BF_MEM_OP_FREE_PAGE_IDX_VAL: u64 = 0x0001;
pub const BF_MEM_OP_ALLOC_HUGE_IDX_VAL: u64 = 0x0002;
pub const BF_MEM_OP_FREE_HUGE_IDX_VAL: u64 = 0x0003;
pub const BF_MEM_OP_ALLOC_HEAP_IDX_VAL: u64 = 0x0004;

// -------------------------------------------------------------------------
// status words
// -------------------------------------------------------------------------

/// A 64-bit syscall status. Zero is success; everything else encodes a
/// category in the low 16 bits and a one-hot member above it.
pub type BfStatus = u64;

pub const BF_STATUS_SUCCESS: BfStatus = 0x0000_0000_0000_0000;

pub const BF_STATUS_FAILURE_UNKNOWN: BfStatus = 0xDEAD_0000_0001_0001;
pub const BF_STATUS_FAILURE_INVALID_HANDLE: BfStatus = 0xDEAD_0000_0002_0001;
pub const BF_STATUS_FAILURE_UNSUPPORTED: BfStatus = 0xDEAD_0000_0004_0001;
pub const BF_STATUS_FAILURE_OUT_OF_MEMORY: BfStatus = 0xDEAD_0000_0008_0001;

pub const BF_STATUS_INVALID_PARAMS1: BfStatus = 0xDEAD_0000_0001_0003;
pub const BF_STATUS_INVALID_PARAMS2: BfStatus = 0xDEAD_0000_0002_0003;
pub const BF_STATUS_INVALID_PARAMS3: BfStatus = 0xDEAD_0000_0004_0003;
pub const BF_STATUS_INVALID_PARAMS4: BfStatus = 0xDEAD_0000_0008_0003;
pub const BF_STATUS_INVALID_PARAMS5: BfStatus = 0xDEAD_0000_0010_0003;

// -------------------------------------------------------------------------
// abstract register enumeration
// -------------------------------------------------------------------------

/// Registers addressable through `bf_vps_op_read_reg`/`write_reg`,
/// independent of whether the backing store is a VMCS field, a VMCB field
/// or the missing-registers block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BfReg {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rbp = 4,
    Rsi = 5,
    Rdi = 6,
    R8 = 7,
    R9 = 8,
    R10 = 9,
    R11 = 10,
    R12 = 11,
    R13 = 12,
    R14 = 13,
    R15 = 14,
    Rsp = 15,
    Rip = 16,
    Rflags = 17,
    GdtrBase = 18,
    GdtrLimit = 19,
    IdtrBase = 20,
    IdtrLimit = 21,
    EsSelector = 22,
    EsAttrib = 23,
    EsLimit = 24,
    EsBase = 25,
    CsSelector = 26,
    CsAttrib = 27,
    CsLimit = 28,
    CsBase = 29,
    SsSelector = 30,
    SsAttrib = 31,
    SsLimit = 32,
    SsBase = 33,
    DsSelector = 34,
    DsAttrib = 35,
    DsLimit = 36,
    DsBase = 37,
    FsSelector = 38,
    FsAttrib = 39,
    FsLimit = 40,
    FsBase = 41,
    GsSelector = 42,
    GsAttrib = 43,
    GsLimit = 44,
    GsBase = 45,
    LdtrSelector = 46,
    LdtrAttrib = 47,
    LdtrLimit = 48,
    LdtrBase = 49,
    TrSelector = 50,
    TrAttrib = 51,
    TrLimit = 52,
    TrBase = 53,
    Cr0 = 54,
    Cr2 = 55,
    Cr3 = 56,
    Cr4 = 57,
    Dr6 = 58,
    Dr7 = 59,
    Ia32Efer = 60,
    Ia32Star = 61,
    Ia32Lstar = 62,
    Ia32Cstar = 63,
    Ia32Fmask = 64,
    Ia32FsBase = 65,
    Ia32GsBase = 66,
    Ia32KernelGsBase = 67,
    Ia32SysenterCs = 68,
    Ia32SysenterEsp = 69,
    Ia32SysenterEip = 70,
    Ia32Pat = 71,
    Ia32Debugctl = 72,
}

impl BfReg {
    /// Decodes the raw register index an extension passed in `ext_reg2`.
    pub const fn from_u64(val: u64) -> Option<Self> {
        if val > Self::Ia32Debugctl as u64 {
            return None;
        }
        // values are dense from 0, checked above
        Some(unsafe { core::mem::transmute::<u64, Self>(val) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_partition_the_word() {
        let x = 0x4242_4242_4242_4242u64;
        assert_eq!(bf_syscall_sig(x), 0x4242_0000_0000_0000);
        assert_eq!(bf_syscall_flags(x), 0x0000_4242_0000_0000);
        assert_eq!(bf_syscall_opcode(x), 0x4242_0000_4242_0000);
        assert_eq!(bf_syscall_opcode_nosig(x), 0x0000_0000_4242_0000);
        assert_eq!(bf_syscall_index(x), 0x0000_0000_0000_4242);
    }

    #[test]
    fn version_gate() {
        assert!(bf_is_spec_supported(BF_ALL_SPECS_SUPPORTED_VAL));
        assert!(!bf_is_spec_supported(0));
        assert!(!bf_is_spec_supported(!BF_SPEC_ID1_MASK));
    }

    #[test]
    fn reg_decode_bounds() {
        assert_eq!(BfReg::from_u64(0), Some(BfReg::Rax));
        assert_eq!(BfReg::from_u64(72), Some(BfReg::Ia32Debugctl));
        assert_eq!(BfReg::from_u64(73), None);
    }
}
