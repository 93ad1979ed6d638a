//! The per-PP TLS block
//!
//! One of these exists per physical processor and is passed by reference
//! down the whole call tree; cross-subsystem state sharing goes through it,
//! never through globals. The first half is the syscall ABI surface the
//! platform entry fills in, the second half is kernel bookkeeping.

use crate::abi::BF_INVALID_ID;
use crate::state::StateSave;

/// The per-PP TLS block
pub struct Tls {
    // ------------------------------------------------------------------
    // identity, fixed at entry
    // ------------------------------------------------------------------
    /// the id of this PP
    pub ppid: u16,
    /// the number of online PPs
    pub online_pps: u16,

    // ------------------------------------------------------------------
    // extension execution environment
    // ------------------------------------------------------------------
    /// stack pointer the extension runs on (per PP)
    pub sp: u64,
    /// thread pointer the extension runs with (per PP)
    pub tp: u64,

    // ------------------------------------------------------------------
    // syscall ABI registers, spilled here by the syscall entry
    // ------------------------------------------------------------------
    /// the opcode word of the pending syscall
    pub ext_syscall: u64,
    /// argument/return register 0 (carries the handle on the way in)
    pub ext_reg0: u64,
    /// argument register 1
    pub ext_reg1: u64,
    /// argument register 2
    pub ext_reg2: u64,
    /// argument register 3
    pub ext_reg3: u64,

    // ------------------------------------------------------------------
    // what is active on this PP
    // ------------------------------------------------------------------
    pub active_vmid: u16,
    pub active_vpid: u16,
    pub active_vpsid: u16,
    pub active_extid: u16,
    /// PML4T physical address currently in CR3, to elide redundant loads
    pub active_rpt_phys: u64,
    /// the VPS whose VMCS/VMCB is current on this PP
    pub loaded_vpsid: u16,

    // ------------------------------------------------------------------
    // registered extension callbacks (by extension id)
    // ------------------------------------------------------------------
    /// the extension that registered a VMExit handler
    pub ext_vmexit: u16,
    /// the extension that registered a fail handler
    pub ext_fail: u16,

    // ------------------------------------------------------------------
    // loader state
    // ------------------------------------------------------------------
    /// the root VP state image used by init_as_root and promote
    pub root_vp_state: *mut StateSave,

    // ------------------------------------------------------------------
    // failure-reversal scratch for the dispatcher
    // ------------------------------------------------------------------
    pub state_reversal_required: bool,
    pub reversal_vmid: u16,
    pub reversal_vpid: u16,
    pub reversal_vpsid: u16,
}

// root_vp_state points at loader memory that lives as long as the kernel.
unsafe impl Send for Tls {}

impl Tls {
    /// A TLS block for the given PP with nothing active yet.
    pub fn new(ppid: u16, online_pps: u16) -> Self {
        Self {
            ppid,
            online_pps,
            sp: 0,
            tp: 0,
            ext_syscall: 0,
            ext_reg0: 0,
            ext_reg1: 0,
            ext_reg2: 0,
            ext_reg3: 0,
            active_vmid: BF_INVALID_ID,
            active_vpid: BF_INVALID_ID,
            active_vpsid: BF_INVALID_ID,
            active_extid: BF_INVALID_ID,
            active_rpt_phys: 0,
            loaded_vpsid: BF_INVALID_ID,
            ext_vmexit: BF_INVALID_ID,
            ext_fail: BF_INVALID_ID,
            root_vp_state: core::ptr::null_mut(),
            state_reversal_required: false,
            reversal_vmid: BF_INVALID_ID,
            reversal_vpid: BF_INVALID_ID,
            reversal_vpsid: BF_INVALID_ID,
        }
    }
}
