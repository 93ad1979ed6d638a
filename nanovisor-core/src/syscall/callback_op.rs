//! bf_callback_op syscalls
//!
//! The extension registers its bootstrap, VMExit and fail entry points
//! here during its `_start`. Registering the VMExit handler is what
//! unlocks the VPS family.

use crate::error;
use crate::ext::Extension;
use crate::syscall::SyscallExit;
use crate::tls::Tls;
use nanovisor_hal::abi::{
    bf_syscall_index, BfStatus, BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL,
    BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL, BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL,
    BF_STATUS_FAILURE_INVALID_HANDLE, BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_INVALID_PARAMS1,
    BF_STATUS_SUCCESS,
};

/// Implements bf_callback_op_register_bootstrap
fn register_bootstrap(tls: &mut Tls, ext: &Extension) -> BfStatus {
    if tls.ext_reg1 == 0 {
        error!("invalid bootstrap ip");
        return BF_STATUS_INVALID_PARAMS1;
    }

    ext.set_bootstrap_ip(tls.ext_reg1);
    BF_STATUS_SUCCESS
}

/// Implements bf_callback_op_register_vmexit
fn register_vmexit(tls: &mut Tls, ext: &Extension) -> BfStatus {
    if tls.ext_reg1 == 0 {
        error!("invalid vmexit ip");
        return BF_STATUS_INVALID_PARAMS1;
    }

    ext.set_vmexit_ip(tls.ext_reg1);
    tls.ext_vmexit = ext.id();
    BF_STATUS_SUCCESS
}

/// Implements bf_callback_op_register_fail
fn register_fail(tls: &mut Tls, ext: &Extension) -> BfStatus {
    if tls.ext_reg1 == 0 {
        error!("invalid fail ip");
        return BF_STATUS_INVALID_PARAMS1;
    }

    ext.set_fail_ip(tls.ext_reg1);
    tls.ext_fail = ext.id();
    BF_STATUS_SUCCESS
}

/// Dispatches the bf_callback_op syscalls
pub fn dispatch(tls: &mut Tls, ext: &Extension) -> SyscallExit {
    if !ext.is_handle_valid(tls.ext_reg0) {
        error!("invalid handle: {:#x}", tls.ext_reg0);
        return SyscallExit::Return(BF_STATUS_FAILURE_INVALID_HANDLE);
    }

    let status = match bf_syscall_index(tls.ext_syscall) {
        BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL => register_bootstrap(tls, ext),
        BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL => register_vmexit(tls, ext),
        BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL => register_fail(tls, ext),
        _ => {
            error!("unknown syscall index: {:#x}", tls.ext_syscall);
            BF_STATUS_FAILURE_UNKNOWN
        }
    };

    SyscallExit::Return(status)
}
