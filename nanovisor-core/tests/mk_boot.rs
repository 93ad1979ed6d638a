//! Boot path tests: loader handoff verification and the BSP/AP split.

extern crate std;

mod common;

use common::{syscall, ElfBuilder, TestEnv, TEST_ONLINE_PPS};
use nanovisor_core::config::{EXT_CODE_ADDR, EXT_STACK_ADDR, EXT_STACK_SIZE};
use nanovisor_core::mk_main::MkMain;
use nanovisor_core::syscall::SyscallExit;
use nanovisor_hal::abi::{
    BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL, BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL,
    BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL, BF_CALLBACK_OP_VAL,
    BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, BF_HANDLE_OP_VAL, BF_INVALID_ID, BF_STATUS_SUCCESS,
    BF_VPS_OP_CREATE_VPS_IDX_VAL, BF_VPS_OP_RUN_CURRENT_IDX_VAL, BF_VPS_OP_RUN_IDX_VAL,
    BF_VPS_OP_VAL, BF_VP_OP_CREATE_VP_IDX_VAL, BF_VP_OP_VAL,
};
use nanovisor_hal::debug_ring::DebugRing;
use nanovisor_hal::intrinsic::IntrinsicError;
use nanovisor_hal::mk_args::{ByteSpan, MkArgs, MAX_ELF_FILES};
use nanovisor_hal::paging::{Pml4t, Pml4te, PT_ENTRIES};
use nanovisor_hal::state::StateSave;

fn leak_bytes(bytes: &[u8]) -> ByteSpan {
    let boxed: &'static mut [u8] = Box::leak(bytes.to_vec().into_boxed_slice());
    ByteSpan { addr: boxed.as_mut_ptr(), size: boxed.len() }
}

fn leak_debug_ring() -> *mut DebugRing {
    let layout = std::alloc::Layout::new::<DebugRing>();
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    ptr as *mut DebugRing
}

fn loader_args(ppid: u16) -> MkArgs {
    // a fresh donation per args set, separate from the TestEnv pools
    let page_pool = {
        let layout = std::alloc::Layout::from_size_align(4 * 1024 * 1024, 4096).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) }
    };
    let huge_pool = {
        let layout = std::alloc::Layout::from_size_align(256 * 1024, 4096).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) }
    };
    let rpt = Box::leak(Box::new(Pml4t { entries: [Pml4te::zero(); PT_ENTRIES] }));

    let mut ext_elf_files = [ByteSpan::empty(); MAX_ELF_FILES];
    ext_elf_files[0] = leak_bytes(&ElfBuilder::new().build());

    MkArgs {
        ppid,
        online_pps: TEST_ONLINE_PPS,
        mk_state: Box::leak(Box::new(StateSave::default())),
        root_vp_state: Box::leak(Box::new(StateSave::default())),
        debug_ring: leak_debug_ring(),
        mk_elf_file: leak_bytes(&[0x7F; 64]),
        ext_elf_files,
        rpt,
        rpt_phys: 0x9000,
        page_pool: ByteSpan { addr: page_pool, size: 4 * 1024 * 1024 },
        page_pool_phys: 0x5000_0000,
        huge_pool: ByteSpan { addr: huge_pool, size: 256 * 1024 },
        huge_pool_phys: 0x7000_0000,
    }
}

#[test]
fn an_ap_cannot_come_up_before_the_bsp() {
    let env = TestEnv::bare();
    let mk_main = MkMain::new();
    let args = loader_args(1);

    let mut tls = env.tls(1);
    assert!(mk_main.process(&env.kernel(), &args, &mut tls).is_err());
}

#[test]
fn a_mismatched_tls_block_is_rejected() {
    let env = TestEnv::bare();
    let mk_main = MkMain::new();
    let args = loader_args(0);

    // tls says PP 1, args say PP 0
    let mut tls = env.tls(1);
    assert!(mk_main.process(&env.kernel(), &args, &mut tls).is_err());
}

#[test]
fn a_truncated_handoff_is_rejected() {
    let env = TestEnv::bare();
    let mk_main = MkMain::new();

    let mut args = loader_args(0);
    args.page_pool = ByteSpan::empty();

    let mut tls = env.tls(0);
    assert!(mk_main.process(&env.kernel(), &args, &mut tls).is_err());
}

#[test]
fn the_bsp_boot_fails_cleanly_when_no_vmexit_handler_is_registered() {
    // the mock extension's _start registers nothing, so process must come
    // back with an error after a full initialization pass
    let env = TestEnv::bare();
    let mk_main = MkMain::new();
    let args = loader_args(0);

    let mut tls = env.tls(0);
    let result = mk_main.process(&env.kernel(), &args, &mut tls);
    assert!(result.is_err());

    // initialization did happen: extension loaded, root VM active, the
    // extension's _start was entered with the version token
    assert!(env.ext_pool.get(0).is_ok());
    assert!(env.vm_pool.is_allocated(0));
    assert_eq!(tls.active_vmid, 0);

    let log = env.intrinsic.log.lock().unwrap();
    assert_eq!(log.ext_calls.len(), 1);
    assert_eq!(log.ext_calls[0].arg0, 1); // BF_ALL_SPECS_SUPPORTED_VAL

    // the extension stack pointer sits at the top of this PP's stack
    assert_ne!(tls.sp, 0);
    assert_ne!(tls.tp, 0);
}

#[test]
fn a_full_bsp_and_ap_boot_reaches_the_vmexit_loop() {
    let env: &'static TestEnv = Box::leak(Box::new(TestEnv::bare()));
    let mk_main = MkMain::new();

    let entry_ip = EXT_CODE_ADDR + 0x10;
    let bootstrap_ip = EXT_CODE_ADDR + 0x100;
    let vmexit_ip = EXT_CODE_ADDR + 0x200;
    let fail_ip = EXT_CODE_ADDR + 0x300;

    // the scripted extension: _start opens the handle and registers the
    // callbacks, every per-PP bootstrap builds a VP + VPS and dispatches
    // them, the VMExit handler re-runs the current VPS, and the fail
    // handler gives up, which is how this scripted boot ends
    let mut handle = 0u64;
    env.intrinsic.set_ext_program(move |tls, call| {
        let k = env.kernel();

        if call.ip == entry_ip {
            let exit =
                syscall(&k, tls, BF_HANDLE_OP_VAL | BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, 1, 0, 0);
            assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
            handle = tls.ext_reg0;

            for (idx, ip) in [
                (BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL, bootstrap_ip),
                (BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL, vmexit_ip),
                (BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL, fail_ip),
            ] {
                tls.ext_reg0 = handle;
                let exit = syscall(&k, tls, BF_CALLBACK_OP_VAL | idx, ip, 0, 0);
                assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
            }

            return Ok(());
        }

        if call.ip == bootstrap_ip {
            let ppid = u64::from(tls.ppid);

            tls.ext_reg0 = handle;
            let exit = syscall(&k, tls, BF_VP_OP_VAL | BF_VP_OP_CREATE_VP_IDX_VAL, 0, ppid, 0);
            assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
            let vpid = tls.ext_reg0 & 0xFFFF;

            tls.ext_reg0 = handle;
            let exit =
                syscall(&k, tls, BF_VPS_OP_VAL | BF_VPS_OP_CREATE_VPS_IDX_VAL, vpid, ppid, 0);
            assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
            let vpsid = tls.ext_reg0 & 0xFFFF;

            tls.ext_reg0 = handle;
            let exit = syscall(&k, tls, BF_VPS_OP_VAL | BF_VPS_OP_RUN_IDX_VAL, vpsid, vpid, 0);
            assert_eq!(exit, SyscallExit::Run);

            return Ok(());
        }

        if call.ip == vmexit_ip {
            tls.ext_reg0 = handle;
            let exit = syscall(&k, tls, BF_VPS_OP_VAL | BF_VPS_OP_RUN_CURRENT_IDX_VAL, 0, 0, 0);
            assert_eq!(exit, SyscallExit::Run);
            return Ok(());
        }

        assert_eq!(call.ip, fail_ip);
        Err(IntrinsicError::ExtFault)
    });

    // BSP: one guest entry, then the second entry is refused and the
    // fail handler ends the run
    env.intrinsic.push_run_result(Ok(0x2C));
    let args = loader_args(0);
    let mut tls0 = env.tls(0);
    assert!(mk_main.process(&env.kernel(), &args, &mut tls0).is_err());

    assert_eq!(tls0.active_vmid, 0);
    assert_ne!(tls0.active_vpid, BF_INVALID_ID);
    assert_ne!(tls0.active_vpsid, BF_INVALID_ID);
    assert!(env.vm_pool.is_active_on(0, 0));
    assert!(env.ext_pool.get(0).unwrap().is_started());

    {
        let log = env.intrinsic.log.lock().unwrap();
        let ips: Vec<u64> = log.ext_calls.iter().map(|c| c.ip).collect();
        assert_eq!(ips, vec![entry_ip, bootstrap_ip, vmexit_ip, fail_ip]);
        assert_eq!(log.ext_calls[0].arg0, 1); // the version token
        assert_eq!(log.ext_calls[0].sp, EXT_STACK_ADDR + EXT_STACK_SIZE);
        assert_eq!(log.ext_calls[1].arg0, 0); // the bootstrap PP id
        assert_eq!(log.ext_calls[2].arg1, 0x2C); // the exit reason
        assert_eq!(log.runs.len(), 2);
        assert!(!log.runs[0].1); // the first entry is a launch
    }

    // AP: adopts the BSP's root VM and handlers and reaches the loop the
    // same way, on its own VP and VPS
    env.intrinsic.push_run_result(Ok(0x2C));
    let args = loader_args(1);
    let mut tls1 = env.tls(1);
    assert!(mk_main.process(&env.kernel(), &args, &mut tls1).is_err());

    assert_eq!(tls1.active_vmid, 0);
    assert_ne!(tls1.active_vpsid, BF_INVALID_ID);
    assert_ne!(tls1.active_vpsid, tls0.active_vpsid);
    assert!(env.vm_pool.is_active_on(0, 1));
    assert_eq!(tls1.ext_vmexit, tls0.ext_vmexit);
    assert_eq!(tls1.ext_fail, tls0.ext_fail);

    let log = env.intrinsic.log.lock().unwrap();
    assert_eq!(log.runs.len(), 4);
}
