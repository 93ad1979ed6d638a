//! bf_vm_op syscalls

use crate::error;
use crate::ext::Extension;
use crate::syscall::{merge_reg0, SyscallExit};
use crate::tls::Tls;
use crate::Kernel;
use nanovisor_hal::abi::{
    bf_syscall_index, BfStatus, BF_STATUS_FAILURE_INVALID_HANDLE, BF_STATUS_FAILURE_UNKNOWN,
    BF_STATUS_SUCCESS, BF_VM_OP_CREATE_VM_IDX_VAL, BF_VM_OP_DESTROY_VM_IDX_VAL,
};

/// Implements bf_vm_op_create_vm
fn create_vm(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    tls.state_reversal_required = true;

    let vmid = match k.vm_pool.allocate() {
        Ok(vmid) => vmid,
        Err(e) => return e.to_status(),
    };

    tls.reversal_vmid = vmid;

    if let Err(e) = k.ext_pool.signal_vm_created(k.page_pool, vmid) {
        return e.to_status();
    }

    merge_reg0(tls, u64::from(vmid), 0xFFFF_FFFF_FFFF_0000);
    BF_STATUS_SUCCESS
}

/// Implements bf_vm_op_destroy_vm
fn destroy_vm(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vmid = tls.ext_reg1 as u16;

    if tls.active_vmid == vmid {
        error!("cannot destroy vm {:#x} as it is active on this pp", vmid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if !k.vm_pool.is_allocated(vmid) {
        error!("vm {:#x} was never created", vmid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if k.vm_pool.is_active(vmid) {
        error!("cannot destroy vm {:#x} as it is currently active", vmid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if k.vp_pool.any_assigned_to_vm(vmid) {
        error!("cannot destroy vm {:#x} as it still has vps assigned to it", vmid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if let Err(e) = k.ext_pool.signal_vm_destroyed(k.page_pool, k.huge_pool, vmid) {
        return e.to_status();
    }

    if let Err(e) = k.vm_pool.deallocate(vmid) {
        return e.to_status();
    }

    BF_STATUS_SUCCESS
}

/// Dispatches the bf_vm_op syscalls
pub fn dispatch(k: &Kernel<'_>, tls: &mut Tls, ext: &Extension) -> SyscallExit {
    if !ext.is_handle_valid(tls.ext_reg0) {
        error!("invalid handle: {:#x}", tls.ext_reg0);
        return SyscallExit::Return(BF_STATUS_FAILURE_INVALID_HANDLE);
    }

    let status = match bf_syscall_index(tls.ext_syscall) {
        BF_VM_OP_CREATE_VM_IDX_VAL => create_vm(k, tls),
        BF_VM_OP_DESTROY_VM_IDX_VAL => destroy_vm(k, tls),
        _ => {
            error!("unknown syscall index: {:#x}", tls.ext_syscall);
            BF_STATUS_FAILURE_UNKNOWN
        }
    };

    SyscallExit::Return(status)
}
