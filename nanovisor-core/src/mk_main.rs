//! The microkernel's main entry logic
//!
//! The platform `_start` runs once per PP, builds the per-PP TLS block and
//! calls `MkMain::process`. The BSP does the heavy lifting (pools, system
//! RPT, extension load, root VM) and the APs adopt what the BSP set up.
//! Every PP then runs the extension's bootstrap callback, verifies the
//! extension actually dispatched a guest, and falls into the VMExit loop,
//! never to return except through promote.

use crate::config::{EXT_STACK_ADDR, EXT_STACK_SIZE, EXT_TLS_ADDR, EXT_TLS_SIZE, MAX_PPS};
use crate::error;
use crate::log;
use crate::status::{MkError, MkResult};
use crate::tls::Tls;
use crate::vmexit::vmexit_loop_entry;
use crate::Kernel;
use nanovisor_hal::abi::{BF_BS_PPID, BF_INVALID_ID, BF_ROOT_VMID};
use nanovisor_hal::memory::PAGE_SIZE;
use nanovisor_hal::mk_args::MkArgs;
use spin::Mutex;

/// Cross-PP state `process` hands from the BSP to the APs.
pub struct MkMain {
    root_vmid: Mutex<u16>,
    /// the (vmexit, fail) handler registrations made during the BSP's
    /// extension start, adopted verbatim by every AP
    handlers: Mutex<(u16, u16)>,
}

impl MkMain {
    pub const fn new() -> Self {
        Self {
            root_vmid: Mutex::new(BF_INVALID_ID),
            handlers: Mutex::new((BF_INVALID_ID, BF_INVALID_ID)),
        }
    }

    /// Sanity checks on the loader handoff. The trampoline fills in a lot
    /// of the TLS block before Rust runs, so cross-check what it can.
    fn verify_args(&self, args: &MkArgs, tls: &Tls) -> MkResult<()> {
        if args.ppid == BF_BS_PPID {
            if *self.root_vmid.lock() != BF_INVALID_ID {
                error!("cannot initialize the BSP more than once");
                return Err(MkError::Unknown);
            }
        } else if *self.root_vmid.lock() == BF_INVALID_ID {
            error!("cannot initialize an AP due to previous failure");
            return Err(MkError::Unknown);
        }

        if tls.ppid != args.ppid || tls.ppid == BF_INVALID_ID {
            error!("tls.ppid [{:#x}] doesn't match the args ppid [{:#x}]", tls.ppid, args.ppid);
            return Err(MkError::InvalidParams1);
        }

        if tls.online_pps != args.online_pps {
            error!(
                "tls.online_pps [{:#x}] doesn't match the args online_pps [{:#x}]",
                tls.online_pps, args.online_pps
            );
            return Err(MkError::InvalidParams1);
        }

        if args.online_pps as usize > MAX_PPS || args.ppid >= args.online_pps {
            error!("the args ppid [{:#x}] or online_pps is out of range", args.ppid);
            return Err(MkError::InvalidParams1);
        }

        if args.mk_state.is_null() || args.root_vp_state.is_null() {
            error!("the args state saves are null");
            return Err(MkError::InvalidParams1);
        }

        if args.debug_ring.is_null() {
            error!("the args debug_ring is null");
            return Err(MkError::InvalidParams1);
        }

        if args.mk_elf_file.is_empty() {
            error!("the args mk_elf_file is empty");
            return Err(MkError::InvalidParams1);
        }

        if args.ext_elf_files[0].is_empty() {
            error!("the args ext_elf_files are empty");
            return Err(MkError::InvalidParams1);
        }

        if args.rpt.is_null() || args.rpt_phys == 0 {
            error!("the args rpt is invalid");
            return Err(MkError::InvalidParams1);
        }

        if args.page_pool.is_empty() || args.page_pool.size < PAGE_SIZE {
            error!("the args page_pool is too small");
            return Err(MkError::InvalidParams1);
        }

        if args.huge_pool.is_empty() || args.huge_pool.size < PAGE_SIZE {
            error!("the args huge_pool is too small");
            return Err(MkError::InvalidParams1);
        }

        Ok(())
    }

    /// The extension stack for this PP: stacks are laid out at a stride of
    /// stack size plus one guard page, and the SP starts at the top.
    fn set_extension_sp(&self, tls: &mut Tls) {
        let offs = (EXT_STACK_SIZE + PAGE_SIZE as u64) * u64::from(tls.ppid);
        tls.sp = EXT_STACK_ADDR + offs + EXT_STACK_SIZE;
    }

    /// The extension thread pointer for this PP: the ABI page, whose first
    /// qword is its own address.
    fn set_extension_tp(&self, k: &Kernel<'_>, tls: &mut Tls) {
        let offs = (EXT_TLS_SIZE + PAGE_SIZE as u64) * u64::from(tls.ppid);
        tls.tp = EXT_TLS_ADDR + offs + PAGE_SIZE as u64;

        k.intrinsic.set_tp(tls.tp);
    }

    /// BSP-only: bring up every global resource.
    fn initialize(&self, k: &Kernel<'_>, args: &MkArgs, tls: &mut Tls) -> MkResult<()> {
        crate::log!("nanovisor microkernel starting on pp {:#x}", tls.ppid);

        unsafe {
            k.page_pool.initialize(args.page_pool.addr, args.page_pool_phys, args.page_pool.size)?;
            k.huge_pool.initialize(args.huge_pool.addr, args.huge_pool_phys, args.huge_pool.size)?;
        }

        k.system_rpt.initialize(k.page_pool)?;
        unsafe { k.system_rpt.add_tables_from(args.rpt)? };

        let mut files: [&[u8]; nanovisor_hal::mk_args::MAX_ELF_FILES] =
            [&[]; nanovisor_hal::mk_args::MAX_ELF_FILES];
        let mut count = 0;
        for span in args.ext_elf_files.iter() {
            if !span.is_empty() {
                files[count] = unsafe { span.as_slice() };
                count += 1;
            }
        }

        k.ext_pool.initialize(tls, k.page_pool, k.huge_pool, k.system_rpt, &files[..count])?;

        let root_vmid = k.vm_pool.allocate()?;
        if root_vmid != BF_ROOT_VMID {
            error!("the root vm was allocated as {:#x} instead of {:#x}", root_vmid, BF_ROOT_VMID);
            return Err(MkError::Unknown);
        }

        k.vm_pool.set_active(tls, root_vmid)?;
        *self.root_vmid.lock() = root_vmid;

        k.ext_pool.start(tls, k.intrinsic)?;

        Ok(())
    }

    /// Processes the loader handoff for this PP. On success this never
    /// returns: control ends up in the VMExit loop. Every return is a
    /// boot failure the platform answers with a halt.
    pub fn process(&self, k: &Kernel<'_>, args: &MkArgs, tls: &mut Tls) -> MkResult<()> {
        self.verify_args(args, tls)?;

        tls.root_vp_state = args.root_vp_state;
        unsafe { log::set_debug_ring(args.debug_ring) };

        self.set_extension_sp(tls);
        self.set_extension_tp(k, tls);

        if args.ppid == BF_BS_PPID {
            self.initialize(k, args, tls)?;

            if tls.ext_vmexit == BF_INVALID_ID {
                error!("a vmexit handler has not been registered");
                *self.root_vmid.lock() = BF_INVALID_ID;
                return Err(MkError::Unknown);
            }

            if tls.ext_fail == BF_INVALID_ID {
                error!("a fast fail handler has not been registered");
                *self.root_vmid.lock() = BF_INVALID_ID;
                return Err(MkError::Unknown);
            }

            *self.handlers.lock() = (tls.ext_vmexit, tls.ext_fail);
        } else {
            let root_vmid = *self.root_vmid.lock();
            k.vm_pool.set_active(tls, root_vmid)?;

            let (ext_vmexit, ext_fail) = *self.handlers.lock();
            tls.ext_vmexit = ext_vmexit;
            tls.ext_fail = ext_fail;
        }

        k.ext_pool.bootstrap(tls, k.intrinsic)?;

        if tls.active_extid == BF_INVALID_ID
            || tls.active_vmid == BF_INVALID_ID
            || tls.active_vpid == BF_INVALID_ID
            || tls.active_vpsid == BF_INVALID_ID
            || tls.active_rpt_phys == 0
        {
            error!("bf_vps_op_run was never executed by an extension");
            return Err(MkError::Unknown);
        }

        vmexit_loop_entry(k, tls)
    }
}

impl Default for MkMain {
    fn default() -> Self {
        Self::new()
    }
}
