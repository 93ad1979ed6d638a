//! Failure reversal for the create syscalls
//!
//! A create that fails partway must not leave a half-built object behind.
//! The handlers record their progress in the TLS reversal fields as they
//! go; when the dispatcher sees a non-success status with
//! `state_reversal_required` set, this pass undoes whatever was recorded.
//! Reversal is best effort: an object whose rollback itself fails
//! zombifies, which is the deliberate correctness-over-capacity trade.
//!
//! Read/write/run paths carry no reversal. They either complete fully or
//! leave the VPS unchanged, so the status code alone is enough.

use crate::tls::Tls;
use crate::Kernel;
use nanovisor_hal::abi::BF_INVALID_ID;

/// Reverts whatever progress the failed syscall recorded.
pub fn revert(k: &Kernel<'_>, tls: &mut Tls) {
    let vpsid = tls.reversal_vpsid;
    if vpsid != BF_INVALID_ID {
        let _ = k.vps_pool.deallocate(tls, k.intrinsic, k.page_pool, vpsid);
        tls.reversal_vpsid = BF_INVALID_ID;
    }

    let vpid = tls.reversal_vpid;
    if vpid != BF_INVALID_ID {
        let _ = k.vp_pool.deallocate(vpid);
        tls.reversal_vpid = BF_INVALID_ID;
    }

    let vmid = tls.reversal_vmid;
    if vmid != BF_INVALID_ID {
        let _ = k.ext_pool.signal_vm_destroyed(k.page_pool, k.huge_pool, vmid);
        let _ = k.vm_pool.deallocate(vmid);
        tls.reversal_vmid = BF_INVALID_ID;
    }

    tls.state_reversal_required = false;
}
