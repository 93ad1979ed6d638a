//! bf_vp_op syscalls

use crate::error;
use crate::ext::Extension;
use crate::syscall::{merge_reg0, SyscallExit};
use crate::tls::Tls;
use crate::Kernel;
use nanovisor_hal::abi::{
    bf_syscall_index, BfStatus, BF_STATUS_FAILURE_INVALID_HANDLE, BF_STATUS_FAILURE_UNKNOWN,
    BF_STATUS_INVALID_PARAMS2, BF_STATUS_SUCCESS, BF_VP_OP_CREATE_VP_IDX_VAL,
    BF_VP_OP_DESTROY_VP_IDX_VAL, BF_VP_OP_MIGRATE_IDX_VAL,
};

/// Implements bf_vp_op_create_vp
fn create_vp(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vmid = tls.ext_reg1 as u16;
    let ppid = tls.ext_reg2 as u16;

    if !k.vm_pool.is_allocated(vmid) {
        error!("vm {:#x} was never created", vmid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if ppid >= tls.online_pps {
        error!("pp {:#x} is out of range", ppid);
        return BF_STATUS_INVALID_PARAMS2;
    }

    tls.state_reversal_required = true;

    let vpid = match k.vp_pool.allocate(vmid, ppid) {
        Ok(vpid) => vpid,
        Err(e) => return e.to_status(),
    };

    tls.reversal_vpid = vpid;

    merge_reg0(tls, u64::from(vpid), 0xFFFF_FFFF_FFFF_0000);
    BF_STATUS_SUCCESS
}

/// Implements bf_vp_op_destroy_vp
fn destroy_vp(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpid = tls.ext_reg1 as u16;

    if tls.active_vpid == vpid {
        error!("cannot destroy vp {:#x} as it is active on this pp", vpid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if k.vps_pool.any_assigned_to_vp(vpid) {
        error!("cannot destroy vp {:#x} as it still has vpss assigned to it", vpid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if let Err(e) = k.vp_pool.deallocate(vpid) {
        return e.to_status();
    }

    BF_STATUS_SUCCESS
}

/// Implements bf_vp_op_migrate
fn migrate(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpid = tls.ext_reg1 as u16;
    let ppid = tls.ext_reg2 as u16;

    match k.vp_pool.migrate(tls, vpid, ppid) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Dispatches the bf_vp_op syscalls
pub fn dispatch(k: &Kernel<'_>, tls: &mut Tls, ext: &Extension) -> SyscallExit {
    if !ext.is_handle_valid(tls.ext_reg0) {
        error!("invalid handle: {:#x}", tls.ext_reg0);
        return SyscallExit::Return(BF_STATUS_FAILURE_INVALID_HANDLE);
    }

    let status = match bf_syscall_index(tls.ext_syscall) {
        BF_VP_OP_CREATE_VP_IDX_VAL => create_vp(k, tls),
        BF_VP_OP_DESTROY_VP_IDX_VAL => destroy_vp(k, tls),
        BF_VP_OP_MIGRATE_IDX_VAL => migrate(k, tls),
        _ => {
            error!("unknown syscall index: {:#x}", tls.ext_syscall);
            BF_STATUS_FAILURE_UNKNOWN
        }
    };

    SyscallExit::Return(status)
}
