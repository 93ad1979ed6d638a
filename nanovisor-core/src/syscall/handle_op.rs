//! bf_handle_op syscalls

use crate::error;
use crate::ext::Extension;
use crate::syscall::SyscallExit;
use crate::tls::Tls;
use nanovisor_hal::abi::{
    bf_syscall_index, BfStatus, BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL, BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL,
    BF_STATUS_FAILURE_INVALID_HANDLE, BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_SUCCESS,
};

/// Implements bf_handle_op_open_handle
fn open_handle(tls: &mut Tls, ext: &Extension) -> BfStatus {
    match ext.open_handle(tls.ext_reg1 as u32) {
        Ok(handle) => {
            tls.ext_reg0 = handle;
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Implements bf_handle_op_close_handle
fn close_handle(tls: &mut Tls, ext: &Extension) -> BfStatus {
    if !ext.is_handle_valid(tls.ext_reg0) {
        error!("invalid handle: {:#x}", tls.ext_reg0);
        return BF_STATUS_FAILURE_INVALID_HANDLE;
    }

    ext.close_handle();
    BF_STATUS_SUCCESS
}

/// Dispatches the bf_handle_op syscalls
pub fn dispatch(tls: &mut Tls, ext: &Extension) -> SyscallExit {
    let status = match bf_syscall_index(tls.ext_syscall) {
        BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL => open_handle(tls, ext),
        BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL => close_handle(tls, ext),
        _ => {
            error!("unknown syscall index: {:#x}", tls.ext_syscall);
            BF_STATUS_FAILURE_UNKNOWN
        }
    };

    SyscallExit::Return(status)
}
