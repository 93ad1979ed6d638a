//! Syscall ABI tests: signature and handle enforcement, register width
//! discipline, state-save round trips and the VMExit loop.

extern crate std;

mod common;

use common::{syscall, TestEnv};
use nanovisor_core::syscall::SyscallExit;
use nanovisor_core::vmexit::vmexit_loop_entry;
use nanovisor_hal::abi::{
    BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL, BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, BF_HANDLE_OP_VAL,
    BF_INTRINSIC_OP_RDMSR_IDX_VAL, BF_INTRINSIC_OP_VAL, BF_INTRINSIC_OP_WRMSR_IDX_VAL,
    BF_STATUS_FAILURE_INVALID_HANDLE, BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_FAILURE_UNSUPPORTED,
    BF_STATUS_SUCCESS, BF_VM_OP_CREATE_VM_IDX_VAL, BF_VM_OP_VAL,
    BF_VPS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL, BF_VPS_OP_ADVANCE_IP_IDX_VAL,
    BF_VPS_OP_CREATE_VPS_IDX_VAL, BF_VPS_OP_INIT_AS_ROOT_IDX_VAL, BF_VPS_OP_PROMOTE_IDX_VAL,
    BF_VPS_OP_READ16_IDX_VAL, BF_VPS_OP_READ_REG_IDX_VAL, BF_VPS_OP_RUN_CURRENT_IDX_VAL,
    BF_VPS_OP_RUN_IDX_VAL, BF_VPS_OP_VAL, BF_VP_OP_CREATE_VP_IDX_VAL, BF_VP_OP_VAL,
};
use nanovisor_hal::intrinsic::{Intrinsic, IntrinsicError, VmRunError};
use nanovisor_hal::state::StateSave;

#[test]
fn a_bad_signature_is_rejected() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();

    let exit = syscall(&k, &mut tls, 0x1234_0000_0004_0000, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_UNKNOWN));
}

#[test]
fn an_unknown_index_is_rejected() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();

    let exit = syscall(&k, &mut tls, BF_VM_OP_VAL | 0x00FF, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_UNKNOWN));
}

#[test]
fn every_family_but_handle_requires_the_handle() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();

    tls.ext_reg0 = 0xBAD;
    let exit = syscall(&k, &mut tls, BF_VM_OP_VAL | BF_VM_OP_CREATE_VM_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_INVALID_HANDLE));

    tls.ext_reg0 = 0xBAD;
    let exit = syscall(&k, &mut tls, BF_VP_OP_VAL | BF_VP_OP_CREATE_VP_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_INVALID_HANDLE));
}

#[test]
fn handle_lifecycle_is_idempotent_to_within_already_open() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();
    let handle = tls.ext_reg0;
    assert_eq!(handle, 1); // extid 0 + 1

    // a second open fails
    let exit = syscall(&k, &mut tls, BF_HANDLE_OP_VAL | BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, 1, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_UNKNOWN));

    // close; reopen yields the same value
    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_HANDLE_OP_VAL | BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));

    let exit = syscall(&k, &mut tls, BF_HANDLE_OP_VAL | BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, 1, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    assert_eq!(tls.ext_reg0, handle);
}

#[test]
fn an_unsupported_abi_generation_is_refused() {
    let env = TestEnv::new();
    let elf = common::ElfBuilder::new().build();
    let mut tls = env.tls(0);
    env.ext_pool
        .initialize(&tls, &env.page_pool, &env.huge_pool, &env.system_rpt, &[&elf])
        .unwrap();
    env.vm_pool.allocate().unwrap();
    env.vm_pool.set_active(&mut tls, 0).unwrap();
    tls.active_extid = 0;

    let k = env.kernel();
    let exit = syscall(&k, &mut tls, BF_HANDLE_OP_VAL | BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_UNSUPPORTED));

    let exit =
        syscall(&k, &mut tls, BF_HANDLE_OP_VAL | BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, 0xF0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_UNSUPPORTED));
}

#[test]
fn vps_ops_require_a_registered_vmexit_handler() {
    let env = TestEnv::new();
    let elf = common::ElfBuilder::new().build();
    let mut tls = env.tls(0);
    env.ext_pool
        .initialize(&tls, &env.page_pool, &env.huge_pool, &env.system_rpt, &[&elf])
        .unwrap();
    env.vm_pool.allocate().unwrap();
    env.vm_pool.set_active(&mut tls, 0).unwrap();
    tls.active_extid = 0;

    let k = env.kernel();
    let exit = syscall(&k, &mut tls, BF_HANDLE_OP_VAL | BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, 1, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));

    // handle is valid, but no vmexit handler registered yet
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_CREATE_VPS_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_UNKNOWN));
}

#[test]
fn narrow_returns_preserve_the_upper_register_bits() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();
    let handle = tls.ext_reg0;

    // 64-bit return: rdmsr passes the whole register through
    env.intrinsic.set_msr(0xC000_0080, 0xAABB_CCDD_EEFF_0011);
    tls.ext_reg0 = handle;
    let exit =
        syscall(&k, &mut tls, BF_INTRINSIC_OP_VAL | BF_INTRINSIC_OP_RDMSR_IDX_VAL, 0xC000_0080, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    assert_eq!(tls.ext_reg0, 0xAABB_CCDD_EEFF_0011);

    // 16-bit return: create_vp merges into the low lane and keeps the
    // upper bits of the incoming register (the handle's upper bits)
    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VP_OP_VAL | BF_VP_OP_CREATE_VP_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    assert_eq!(tls.ext_reg0 >> 16, handle >> 16);

    // 16-bit vps field read merges the same way
    let vpid = tls.ext_reg0 & 0xFFFF;
    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_CREATE_VPS_IDX_VAL, vpid, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    let vpsid = tls.ext_reg0 & 0xFFFF;

    tls.ext_reg0 = handle;
    let exit =
        syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_READ16_IDX_VAL, vpsid, 0x0800, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    assert_eq!(tls.ext_reg0 >> 16, handle >> 16);
}

#[test]
fn wrmsr_reaches_the_hardware() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();

    let exit = syscall(
        &k,
        &mut tls,
        BF_INTRINSIC_OP_VAL | BF_INTRINSIC_OP_WRMSR_IDX_VAL,
        0xC000_0080,
        0x500,
        0,
    );
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    assert_eq!(env.intrinsic.rdmsr(0xC000_0080).unwrap(), 0x500);
}

#[test]
fn init_as_root_then_promote_round_trips_the_state_save() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();
    let handle = tls.ext_reg0;

    // a recognizable root VP state
    let mut state = StateSave::default();
    state.rip = 0xFFFF_8000_1234_5678;
    state.rsp = 0xFFFF_8000_0000_F000;
    state.rax = 0x1111;
    state.rbx = 0x2222;
    state.r15 = 0xFFFF;
    state.cr3 = 0xA000;
    state.rflags = 0x202;
    state.ia32_lstar = 0xFFFF_8000_0BAD_F00D;
    state.cs.selector = 0x8;
    state.cs.attrib = 0xA9B;
    state.gdtr.base = 0xFFFF_8000_0000_1000;
    state.gdtr.limit = 0x7F;
    unsafe { *tls.root_vp_state = state };

    let exit = syscall(&k, &mut tls, BF_VP_OP_VAL | BF_VP_OP_CREATE_VP_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    let vpid = tls.ext_reg0 & 0xFFFF;

    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_CREATE_VPS_IDX_VAL, vpid, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    let vpsid = tls.ext_reg0 & 0xFFFF;

    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_INIT_AS_ROOT_IDX_VAL, vpsid, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));

    // scribble over the loader image to prove promote rewrites it
    unsafe { *tls.root_vp_state = StateSave::default() };

    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_PROMOTE_IDX_VAL, vpsid, 0, 0);
    assert_eq!(exit, SyscallExit::Promote);

    let promoted = env.intrinsic.log.lock().unwrap().promotes[0];
    assert_eq!(promoted, state);
    assert_eq!(unsafe { *tls.root_vp_state }, state);
}

#[test]
fn run_current_and_advance_ip_drive_the_active_vps() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();
    let handle = tls.ext_reg0;

    // nothing active yet
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_RUN_CURRENT_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_FAILURE_UNKNOWN));

    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VP_OP_VAL | BF_VP_OP_CREATE_VP_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    let vpid = tls.ext_reg0 & 0xFFFF;

    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_CREATE_VPS_IDX_VAL, vpid, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    let vpsid = tls.ext_reg0 & 0xFFFF;

    tls.ext_reg0 = handle;
    assert_eq!(
        syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_RUN_IDX_VAL, vpsid, vpid, 0),
        SyscallExit::Run
    );

    tls.ext_reg0 = handle;
    assert_eq!(
        syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_RUN_CURRENT_IDX_VAL, 0, 0, 0),
        SyscallExit::Run
    );

    // load the VPS by touching it, then seed the exit state and advance
    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_READ16_IDX_VAL, vpsid, 0x0800, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));

    let hw_phys = env.intrinsic.log.lock().unwrap().current_vmcs.unwrap();
    env.intrinsic.seed_vmcs(hw_phys, 0x681E, 10); // GUEST_RIP
    env.intrinsic.seed_vmcs(hw_phys, 0x440C, 4); // VM_EXIT_INSTRUCTION_LEN

    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_ADVANCE_IP_IDX_VAL, vpsid, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));

    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_READ_REG_IDX_VAL, vpsid, 16, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    assert_eq!(tls.ext_reg0, 14);

    tls.ext_reg0 = handle;
    assert_eq!(
        syscall(
            &k,
            &mut tls,
            BF_VPS_OP_VAL | BF_VPS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL,
            0,
            0,
            0
        ),
        SyscallExit::Run
    );
}

#[test]
fn the_vmexit_loop_trampolines_exits_into_the_extension() {
    let (env, mut tls) = TestEnv::booted();
    let k = env.kernel();
    let handle = tls.ext_reg0;

    let exit = syscall(&k, &mut tls, BF_VP_OP_VAL | BF_VP_OP_CREATE_VP_IDX_VAL, 0, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    let vpid = tls.ext_reg0 & 0xFFFF;

    tls.ext_reg0 = handle;
    let exit = syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_CREATE_VPS_IDX_VAL, vpid, 0, 0);
    assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
    let vpsid = tls.ext_reg0 & 0xFFFF;

    tls.ext_reg0 = handle;
    assert_eq!(
        syscall(&k, &mut tls, BF_VPS_OP_VAL | BF_VPS_OP_RUN_IDX_VAL, vpsid, vpid, 0),
        SyscallExit::Run
    );

    // exit 0x2C (vmcall-ish), handler runs again, second entry refused,
    // fail handler refuses too: the loop must give up
    env.intrinsic.push_run_result(Ok(0x2C));
    env.intrinsic.push_ext_call_result(Ok(())); // vmexit handler
    env.intrinsic.push_run_result(Err(VmRunError::EntryFailed(7)));
    env.intrinsic.push_ext_call_result(Err(IntrinsicError::ExtFault)); // fail handler

    assert!(vmexit_loop_entry(&k, &mut tls).is_err());

    let log = env.intrinsic.log.lock().unwrap();
    // two guest entries, first as a launch
    assert_eq!(log.runs.len(), 2);
    assert!(!log.runs[0].1);

    // the vmexit handler saw the exit reason and the active vps, then the
    // fail handler saw a status
    let calls = &log.ext_calls;
    let vmexit_call = calls[calls.len() - 2];
    assert_eq!(vmexit_call.arg0, u64::from(tls.active_vpsid));
    assert_eq!(vmexit_call.arg1, 0x2C);
}
