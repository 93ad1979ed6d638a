//! The syscall dispatcher
//!
//! One entry point, reached from the platform syscall stub with the opcode
//! word and arguments already spilled into the TLS block. The opcode word
//! is four 16-bit lanes: signature, flags, opcode (sub-system), index.
//! Dispatch validates the signature, routes on the opcode to a family
//! module, and hands the platform a disposition: return the status to the
//! extension, enter the VMExit loop, or promote out of the hypervisor.
//!
//! Every family except `handle_op` validates the presented handle. The
//! VPS family additionally requires the caller to be the extension that
//! registered a VMExit handler: nobody gets to run guests without
//! committing to handle their exits.
//!
//! Create/destroy syscalls that fail partway are reverted before the
//! status reaches the extension; the `state_reversal_required` protocol in
//! the TLS block carries what progress was made.

pub mod callback_op;
pub mod failure;
pub mod handle_op;
pub mod intrinsic_op;
pub mod mem_op;
pub mod vm_op;
pub mod vp_op;
pub mod vps_op;

use crate::error;
use crate::tls::Tls;
use crate::Kernel;
use nanovisor_hal::abi::{
    bf_syscall_opcode, bf_syscall_sig, BfStatus, BF_CALLBACK_OP_VAL, BF_HANDLE_OP_VAL,
    BF_INTRINSIC_OP_VAL, BF_INVALID_ID, BF_MEM_OP_VAL, BF_STATUS_FAILURE_UNKNOWN,
    BF_STATUS_SUCCESS, BF_SYSCALL_SIG_VAL, BF_VM_OP_VAL, BF_VPS_OP_VAL, BF_VP_OP_VAL,
};

/// What the platform does after a syscall was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallExit {
    /// Hand the status back to the extension and resume it.
    Return(BfStatus),
    /// Do not return to the caller: enter the VMExit loop and run the
    /// active VPS.
    Run,
    /// Do not return to the caller: the root VP state has been rewritten,
    /// resume the host OS.
    Promote,
}

/// Dispatches the syscall described by `tls.ext_syscall`/`ext_reg0..3`.
pub fn dispatch_syscall(k: &Kernel<'_>, tls: &mut Tls) -> SyscallExit {
    let syscall = tls.ext_syscall;

    if bf_syscall_sig(syscall) != BF_SYSCALL_SIG_VAL {
        error!("invalid syscall signature: {:#x}", syscall);
        return SyscallExit::Return(BF_STATUS_FAILURE_UNKNOWN);
    }

    tls.state_reversal_required = false;
    tls.reversal_vmid = BF_INVALID_ID;
    tls.reversal_vpid = BF_INVALID_ID;
    tls.reversal_vpsid = BF_INVALID_ID;

    let ext = match k.ext_pool.get(tls.active_extid) {
        Ok(ext) => ext,
        Err(e) => return SyscallExit::Return(e.to_status()),
    };

    let exit = match bf_syscall_opcode(syscall) {
        BF_HANDLE_OP_VAL => handle_op::dispatch(tls, ext),
        BF_CALLBACK_OP_VAL => callback_op::dispatch(tls, ext),
        BF_VM_OP_VAL => vm_op::dispatch(k, tls, ext),
        BF_VP_OP_VAL => vp_op::dispatch(k, tls, ext),
        BF_VPS_OP_VAL => vps_op::dispatch(k, tls, ext),
        BF_INTRINSIC_OP_VAL => intrinsic_op::dispatch(k, tls, ext),
        BF_MEM_OP_VAL => mem_op::dispatch(k, tls, ext),
        _ => {
            error!("unknown syscall opcode: {:#x}", syscall);
            SyscallExit::Return(BF_STATUS_FAILURE_UNKNOWN)
        }
    };

    if let SyscallExit::Return(status) = exit {
        if status != BF_STATUS_SUCCESS && tls.state_reversal_required {
            failure::revert(k, tls);
        }
    }

    exit
}

/// Merges a narrow return value into `ext_reg0`, preserving the upper
/// bits the operation does not own.
pub(crate) fn merge_reg0(tls: &mut Tls, val: u64, keep_mask: u64) {
    tls.ext_reg0 = (tls.ext_reg0 & keep_mask) | val;
}
