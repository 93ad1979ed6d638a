//! bf_vps_op syscalls
//!
//! The run syscalls do not return to the caller on success: they produce
//! the `Run` disposition and the next thing the extension sees is its
//! VMExit handler. `promote` likewise leaves through the `Promote`
//! disposition after rewriting the root VP state.

use crate::error;
use crate::ext::Extension;
use crate::syscall::{merge_reg0, SyscallExit};
use crate::tls::Tls;
use crate::Kernel;
use nanovisor_hal::abi::{
    bf_syscall_index, BfReg, BfStatus, BF_INVALID_ID, BF_STATUS_FAILURE_INVALID_HANDLE,
    BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_INVALID_PARAMS2, BF_STATUS_SUCCESS,
    BF_VPS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL, BF_VPS_OP_ADVANCE_IP_IDX_VAL,
    BF_VPS_OP_CLEAR_VPS_IDX_VAL, BF_VPS_OP_CREATE_VPS_IDX_VAL, BF_VPS_OP_DESTROY_VPS_IDX_VAL,
    BF_VPS_OP_INIT_AS_ROOT_IDX_VAL, BF_VPS_OP_PROMOTE_IDX_VAL, BF_VPS_OP_READ16_IDX_VAL,
    BF_VPS_OP_READ32_IDX_VAL, BF_VPS_OP_READ64_IDX_VAL, BF_VPS_OP_READ8_IDX_VAL,
    BF_VPS_OP_READ_REG_IDX_VAL, BF_VPS_OP_RUN_CURRENT_IDX_VAL, BF_VPS_OP_RUN_IDX_VAL,
    BF_VPS_OP_WRITE16_IDX_VAL, BF_VPS_OP_WRITE32_IDX_VAL, BF_VPS_OP_WRITE64_IDX_VAL,
    BF_VPS_OP_WRITE8_IDX_VAL, BF_VPS_OP_WRITE_REG_IDX_VAL,
};

/// Implements bf_vps_op_create_vps
fn create_vps(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpid = tls.ext_reg1 as u16;
    let ppid = tls.ext_reg2 as u16;

    if !k.vp_pool.is_allocated(vpid) {
        error!("vp {:#x} was never created", vpid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if ppid >= tls.online_pps {
        error!("pp {:#x} is out of range", ppid);
        return BF_STATUS_INVALID_PARAMS2;
    }

    tls.state_reversal_required = true;

    let vpsid = match k.vps_pool.allocate(k.intrinsic, k.page_pool, vpid, ppid) {
        Ok(vpsid) => vpsid,
        Err(e) => return e.to_status(),
    };

    tls.reversal_vpsid = vpsid;

    merge_reg0(tls, u64::from(vpsid), 0xFFFF_FFFF_FFFF_0000);
    BF_STATUS_SUCCESS
}

/// Implements bf_vps_op_destroy_vps
fn destroy_vps(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;

    if tls.active_vpsid == vpsid {
        error!("cannot destroy vps {:#x} as it is active on this pp", vpsid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if k.vps_pool.is_active(vpsid) {
        error!("cannot destroy vps {:#x} as it is currently active", vpsid);
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    if let Err(e) = k.vps_pool.deallocate(tls, k.intrinsic, k.page_pool, vpsid) {
        return e.to_status();
    }

    BF_STATUS_SUCCESS
}

/// Implements bf_vps_op_init_as_root
fn init_as_root(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;

    if tls.root_vp_state.is_null() {
        error!("no root vp state was provided by the loader");
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    let state = unsafe { *tls.root_vp_state };
    match k.vps_pool.state_save_to_vps(tls, k.intrinsic, vpsid, &state) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_read8
fn read8(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let index = tls.ext_reg2;

    match k.vps_pool.read8(tls, k.intrinsic, vpsid, index) {
        Ok(val) => {
            merge_reg0(tls, u64::from(val), 0xFFFF_FFFF_FFFF_FF00);
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_read16
fn read16(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let index = tls.ext_reg2;

    match k.vps_pool.read16(tls, k.intrinsic, vpsid, index) {
        Ok(val) => {
            merge_reg0(tls, u64::from(val), 0xFFFF_FFFF_FFFF_0000);
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_read32
fn read32(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let index = tls.ext_reg2;

    match k.vps_pool.read32(tls, k.intrinsic, vpsid, index) {
        Ok(val) => {
            merge_reg0(tls, u64::from(val), 0xFFFF_FFFF_0000_0000);
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_read64
fn read64(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let index = tls.ext_reg2;

    match k.vps_pool.read64(tls, k.intrinsic, vpsid, index) {
        Ok(val) => {
            tls.ext_reg0 = val;
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_write8
fn write8(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let index = tls.ext_reg2;
    let val = tls.ext_reg3 as u8;

    match k.vps_pool.write8(tls, k.intrinsic, vpsid, index, val) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_write16
fn write16(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let index = tls.ext_reg2;
    let val = tls.ext_reg3 as u16;

    match k.vps_pool.write16(tls, k.intrinsic, vpsid, index, val) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_write32
fn write32(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let index = tls.ext_reg2;
    let val = tls.ext_reg3 as u32;

    match k.vps_pool.write32(tls, k.intrinsic, vpsid, index, val) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_write64
fn write64(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let index = tls.ext_reg2;
    let val = tls.ext_reg3;

    match k.vps_pool.write64(tls, k.intrinsic, vpsid, index, val) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_read_reg
fn read_reg(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let Some(reg) = BfReg::from_u64(tls.ext_reg2) else {
        error!("invalid bf_reg: {:#x}", tls.ext_reg2);
        return BF_STATUS_INVALID_PARAMS2;
    };

    match k.vps_pool.read_reg(tls, k.intrinsic, vpsid, reg) {
        Ok(val) => {
            tls.ext_reg0 = val;
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_write_reg
fn write_reg(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;
    let Some(reg) = BfReg::from_u64(tls.ext_reg2) else {
        error!("invalid bf_reg: {:#x}", tls.ext_reg2);
        return BF_STATUS_INVALID_PARAMS2;
    };
    let val = tls.ext_reg3;

    match k.vps_pool.write_reg(tls, k.intrinsic, vpsid, reg, val) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_run
///
/// Validates the triple, enforces the permanent-assignment rules (a VP
/// never changes VM; PP changes only through the migrate ABIs; a VPS never
/// changes VP), lazily migrates a VPS whose VP was migrated, then swaps
/// the active VM/VP/VPS on this PP and enters the VMExit loop.
fn run(k: &Kernel<'_>, tls: &mut Tls) -> Result<(), BfStatus> {
    let vpsid = tls.ext_reg1 as u16;
    let vpid = tls.ext_reg2 as u16;
    let vmid = tls.ext_reg3 as u16;

    if !k.vm_pool.is_allocated(vmid) {
        error!("vm {:#x} was never created", vmid);
        return Err(BF_STATUS_FAILURE_UNKNOWN);
    }

    if !k.vp_pool.is_allocated(vpid) {
        error!("vp {:#x} was never created", vpid);
        return Err(BF_STATUS_FAILURE_UNKNOWN);
    }

    if !k.vps_pool.is_allocated(vpsid) {
        error!("vps {:#x} was never created", vpsid);
        return Err(BF_STATUS_FAILURE_UNKNOWN);
    }

    let vp_vmid = k.vp_pool.assigned_vm(vpid);
    if vp_vmid != vmid {
        error!(
            "attempt to run vp {:#x} on vm {:#x} that was already assigned to vm {:#x} was denied",
            vpid, vmid, vp_vmid
        );
        return Err(BF_STATUS_FAILURE_UNKNOWN);
    }

    let vp_ppid = k.vp_pool.assigned_pp(vpid);
    if vp_ppid != tls.ppid {
        error!(
            "attempt to run vp {:#x} on pp {:#x} that was already assigned to pp {:#x} was denied (use migrate to do this)",
            vpid, tls.ppid, vp_ppid
        );
        return Err(BF_STATUS_FAILURE_UNKNOWN);
    }

    let vps_vpid = k.vps_pool.assigned_vp(vpsid);
    if vps_vpid != vpid {
        error!(
            "attempt to run vps {:#x} on vp {:#x} that was already assigned to vp {:#x} was denied",
            vpsid, vpid, vps_vpid
        );
        return Err(BF_STATUS_FAILURE_UNKNOWN);
    }

    // the VP may have been migrated here; if so the VPS follows lazily,
    // which requires it to have been cleared
    let ppid = tls.ppid;
    if k.vps_pool.assigned_pp(vpsid) != ppid {
        k.vps_pool.migrate(tls, vpsid, ppid).map_err(|e| e.to_status())?;
    }

    let previous_vmid = tls.active_vmid;
    if previous_vmid != vmid {
        if previous_vmid != BF_INVALID_ID {
            k.vm_pool.set_inactive(tls, previous_vmid).map_err(|e| e.to_status())?;
        }
        k.vm_pool.set_active(tls, vmid).map_err(|e| e.to_status())?;
    }

    let previous_vpid = tls.active_vpid;
    if previous_vpid != vpid {
        if previous_vpid != BF_INVALID_ID {
            k.vp_pool.set_inactive(tls, previous_vpid).map_err(|e| e.to_status())?;
        }
        k.vp_pool.set_active(tls, vpid).map_err(|e| e.to_status())?;
    }

    let previous_vpsid = tls.active_vpsid;
    if previous_vpsid != vpsid {
        if previous_vpsid != BF_INVALID_ID {
            k.vps_pool.set_inactive(tls, previous_vpsid).map_err(|e| e.to_status())?;
        }
        k.vps_pool.set_active(tls, vpsid).map_err(|e| e.to_status())?;
    }

    Ok(())
}

/// Implements bf_vps_op_run_current
fn run_current(tls: &Tls) -> Result<(), BfStatus> {
    if tls.active_vpsid == BF_INVALID_ID {
        error!("no vps is active on pp {:#x}", tls.ppid);
        return Err(BF_STATUS_FAILURE_UNKNOWN);
    }

    Ok(())
}

/// Implements bf_vps_op_advance_ip
fn advance_ip(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;

    match k.vps_pool.advance_ip(tls, k.intrinsic, vpsid) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_vps_op_advance_ip_and_run_current
fn advance_ip_and_run_current(k: &Kernel<'_>, tls: &mut Tls) -> Result<(), BfStatus> {
    run_current(tls)?;

    let vpsid = tls.active_vpsid;
    k.vps_pool.advance_ip(tls, k.intrinsic, vpsid).map_err(|e| e.to_status())?;

    Ok(())
}

/// Implements bf_vps_op_promote
fn promote(k: &Kernel<'_>, tls: &mut Tls) -> Result<(), BfStatus> {
    let vpsid = tls.ext_reg1 as u16;

    if tls.root_vp_state.is_null() {
        error!("no root vp state was provided by the loader");
        return Err(BF_STATUS_FAILURE_UNKNOWN);
    }

    let mut state = unsafe { *tls.root_vp_state };
    k.vps_pool
        .vps_to_state_save(tls, k.intrinsic, vpsid, &mut state)
        .map_err(|e| e.to_status())?;
    unsafe { *tls.root_vp_state = state };

    k.intrinsic.promote(unsafe { &*tls.root_vp_state });
    Ok(())
}

/// Implements bf_vps_op_clear_vps
fn clear_vps(k: &Kernel<'_>, tls: &mut Tls) -> BfStatus {
    let vpsid = tls.ext_reg1 as u16;

    match k.vps_pool.clear(tls, k.intrinsic, vpsid) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Dispatches the bf_vps_op syscalls
pub fn dispatch(k: &Kernel<'_>, tls: &mut Tls, ext: &Extension) -> SyscallExit {
    if !ext.is_handle_valid(tls.ext_reg0) {
        error!("invalid handle: {:#x}", tls.ext_reg0);
        return SyscallExit::Return(BF_STATUS_FAILURE_INVALID_HANDLE);
    }

    if tls.ext_vmexit != ext.id() {
        error!(
            "vps_ops not allowed by ext {:#x} as it didn't register for vmexits",
            ext.id()
        );
        return SyscallExit::Return(BF_STATUS_FAILURE_UNKNOWN);
    }

    let status = match bf_syscall_index(tls.ext_syscall) {
        BF_VPS_OP_CREATE_VPS_IDX_VAL => create_vps(k, tls),
        BF_VPS_OP_DESTROY_VPS_IDX_VAL => destroy_vps(k, tls),
        BF_VPS_OP_INIT_AS_ROOT_IDX_VAL => init_as_root(k, tls),
        BF_VPS_OP_READ8_IDX_VAL => read8(k, tls),
        BF_VPS_OP_READ16_IDX_VAL => read16(k, tls),
        BF_VPS_OP_READ32_IDX_VAL => read32(k, tls),
        BF_VPS_OP_READ64_IDX_VAL => read64(k, tls),
        BF_VPS_OP_WRITE8_IDX_VAL => write8(k, tls),
        BF_VPS_OP_WRITE16_IDX_VAL => write16(k, tls),
        BF_VPS_OP_WRITE32_IDX_VAL => write32(k, tls),
        BF_VPS_OP_WRITE64_IDX_VAL => write64(k, tls),
        BF_VPS_OP_READ_REG_IDX_VAL => read_reg(k, tls),
        BF_VPS_OP_WRITE_REG_IDX_VAL => write_reg(k, tls),
        BF_VPS_OP_RUN_IDX_VAL => {
            return match run(k, tls) {
                Ok(()) => SyscallExit::Run,
                Err(status) => SyscallExit::Return(status),
            };
        }
        BF_VPS_OP_RUN_CURRENT_IDX_VAL => {
            return match run_current(tls) {
                Ok(()) => SyscallExit::Run,
                Err(status) => SyscallExit::Return(status),
            };
        }
        BF_VPS_OP_ADVANCE_IP_IDX_VAL => advance_ip(k, tls),
        BF_VPS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL => {
            return match advance_ip_and_run_current(k, tls) {
                Ok(()) => SyscallExit::Run,
                Err(status) => SyscallExit::Return(status),
            };
        }
        BF_VPS_OP_PROMOTE_IDX_VAL => {
            return match promote(k, tls) {
                Ok(()) => SyscallExit::Promote,
                Err(status) => SyscallExit::Return(status),
            };
        }
        BF_VPS_OP_CLEAR_VPS_IDX_VAL => clear_vps(k, tls),
        _ => {
            error!("unknown syscall index: {:#x}", tls.ext_syscall);
            BF_STATUS_FAILURE_UNKNOWN
        }
    };

    SyscallExit::Return(status)
}
