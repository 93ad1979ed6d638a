//! The VMExit loop
//!
//! Runs the active VPS, hands the exit reason to the extension's VMExit
//! entry, and keeps going when the extension re-enters through one of the
//! run syscalls. An extension handler that returns instead of running is a
//! fatal fault: the fail entry gets one chance to recover (promote, run
//! something else, or halt); if that also returns, the loop gives up and
//! the caller halts the PP.

use crate::error;
use crate::status::{MkError, MkResult};
use crate::tls::Tls;
use crate::Kernel;
use nanovisor_hal::abi::{BF_INVALID_ID, BF_STATUS_FAILURE_UNKNOWN};

/// Runs guests on this PP until promote or a double fault in the
/// extension.
pub fn vmexit_loop_entry(k: &Kernel<'_>, tls: &mut Tls) -> MkResult<()> {
    loop {
        let vpsid = tls.active_vpsid;
        if vpsid == BF_INVALID_ID {
            error!("no vps is active on pp {:#x}", tls.ppid);
            return Err(MkError::Unknown);
        }

        let exit_reason = match k.vps_pool.run(tls, k.intrinsic, vpsid) {
            Ok(exit_reason) => exit_reason,
            Err(_) => {
                // the VM-instruction error was already surfaced by run
                fail(k, tls)?;
                continue;
            }
        };

        let ext = k.ext_pool.get(tls.active_extid)?;
        match ext.vmexit(tls, k.intrinsic, exit_reason) {
            Ok(()) => continue,
            Err(_) => {
                error!(
                    "the vmexit handler returned on pp {:#x} instead of running a vps",
                    tls.ppid
                );
                fail(k, tls)?;
            }
        }
    }
}

/// Enters the registered fail handler. Success means the handler issued a
/// run syscall and the loop may continue.
fn fail(k: &Kernel<'_>, tls: &mut Tls) -> MkResult<()> {
    if tls.ext_fail == BF_INVALID_ID {
        error!("a fail handler was never registered");
        return Err(MkError::Unknown);
    }

    let ext = k.ext_pool.get(tls.ext_fail)?;
    ext.fail(tls, k.intrinsic, BF_STATUS_FAILURE_UNKNOWN)
}
