//! bf_intrinsic_op syscalls
//!
//! Privileged instructions the extension cannot execute from user mode,
//! forwarded through the intrinsic layer.

use crate::error;
use crate::ext::Extension;
use crate::syscall::SyscallExit;
use crate::tls::Tls;
use crate::Kernel;
use nanovisor_hal::abi::{
    bf_syscall_index, BfStatus, BF_INTRINSIC_OP_INVEPT_IDX_VAL, BF_INTRINSIC_OP_INVLPGA_IDX_VAL,
    BF_INTRINSIC_OP_INVVPID_IDX_VAL, BF_INTRINSIC_OP_RDMSR_IDX_VAL, BF_INTRINSIC_OP_WRMSR_IDX_VAL,
    BF_STATUS_FAILURE_INVALID_HANDLE, BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_SUCCESS,
};

/// Implements bf_intrinsic_op_rdmsr
fn rdmsr(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    match k.intrinsic.rdmsr(tls.ext_reg1 as u32) {
        Ok(val) => {
            tls.ext_reg0 = val;
            BF_STATUS_SUCCESS
        }
        Err(_) => {
            error!("rdmsr of {:#x} failed", tls.ext_reg1);
            BF_STATUS_FAILURE_UNKNOWN
        }
    }
}

/// Implements bf_intrinsic_op_wrmsr
fn wrmsr(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    match k.intrinsic.wrmsr(tls.ext_reg1 as u32, tls.ext_reg2) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(_) => {
            error!("wrmsr of {:#x} failed", tls.ext_reg1);
            BF_STATUS_FAILURE_UNKNOWN
        }
    }
}

/// Implements bf_intrinsic_op_invlpga
fn invlpga(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    k.intrinsic.invlpga(tls.ext_reg1, tls.ext_reg2);
    BF_STATUS_SUCCESS
}

/// Implements bf_intrinsic_op_invept
fn invept(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    k.intrinsic.invept(tls.ext_reg1, tls.ext_reg2);
    BF_STATUS_SUCCESS
}

/// Implements bf_intrinsic_op_invvpid
fn invvpid(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    k.intrinsic.invvpid(tls.ext_reg1, tls.ext_reg2 as u16, tls.ext_reg3);
    BF_STATUS_SUCCESS
}

/// Dispatches the bf_intrinsic_op syscalls
pub fn dispatch(k: &Kernel<'_>, tls: &mut Tls, ext: &Extension) -> SyscallExit {
    if !ext.is_handle_valid(tls.ext_reg0) {
        error!("invalid handle: {:#x}", tls.ext_reg0);
        return SyscallExit::Return(BF_STATUS_FAILURE_INVALID_HANDLE);
    }

    let status = match bf_syscall_index(tls.ext_syscall) {
        BF_INTRINSIC_OP_RDMSR_IDX_VAL => rdmsr(k, tls),
        BF_INTRINSIC_OP_WRMSR_IDX_VAL => wrmsr(k, tls),
        BF_INTRINSIC_OP_INVLPGA_IDX_VAL => invlpga(k, tls),
        BF_INTRINSIC_OP_INVEPT_IDX_VAL => invept(k, tls),
        BF_INTRINSIC_OP_INVVPID_IDX_VAL => invvpid(k, tls),
        _ => {
            error!("unknown syscall index: {:#x}", tls.ext_syscall);
            BF_STATUS_FAILURE_UNKNOWN
        }
    };

    SyscallExit::Return(status)
}
