//! VPS backend tests: the same object drives a VMCS through the intrinsic
//! layer on Intel and a VMCB through structured memory access on AMD.

extern crate std;

mod common;

use common::TestEnv;
use nanovisor_core::MkError;
use nanovisor_hal::abi::BfReg;
use nanovisor_hal::intrinsic::Vendor;

#[test]
fn amd_field_access_is_a_structured_vmcb_access() {
    let env = TestEnv::with_vendor(Vendor::Amd);
    let mut tls = env.tls(0);

    let vpsid = env.vps_pool.allocate(&env.intrinsic, &env.page_pool, 0, 0).unwrap();

    // guest ASID lives at VMCB offset 0x58
    env.vps_pool.write32(&mut tls, &env.intrinsic, vpsid, 0x58, 1).unwrap();
    assert_eq!(env.vps_pool.read32(&mut tls, &env.intrinsic, vpsid, 0x58).unwrap(), 1);

    // all four widths work against the VMCB
    env.vps_pool.write8(&mut tls, &env.intrinsic, vpsid, 0x5C, 0x3).unwrap();
    assert_eq!(env.vps_pool.read8(&mut tls, &env.intrinsic, vpsid, 0x5C).unwrap(), 0x3);

    // out-of-range and misaligned offsets are refused
    assert_eq!(
        env.vps_pool.read64(&mut tls, &env.intrinsic, vpsid, 0x1000),
        Err(MkError::InvalidParams2)
    );
    assert_eq!(
        env.vps_pool.read64(&mut tls, &env.intrinsic, vpsid, 0x59),
        Err(MkError::InvalidParams2)
    );

    // rax is authoritative in the VMCB save area (offset 0x5F8)
    env.vps_pool.write_reg(&mut tls, &env.intrinsic, vpsid, BfReg::Rax, 0x1234).unwrap();
    assert_eq!(
        env.vps_pool.read64(&mut tls, &env.intrinsic, vpsid, 0x5F8).unwrap(),
        0x1234
    );
}

#[test]
fn intel_has_no_8_bit_vmcs_fields() {
    let env = TestEnv::new();
    let mut tls = env.tls(0);

    let vpsid = env.vps_pool.allocate(&env.intrinsic, &env.page_pool, 0, 0).unwrap();

    assert_eq!(
        env.vps_pool.read8(&mut tls, &env.intrinsic, vpsid, 0x0800),
        Err(MkError::Unsupported)
    );
    assert_eq!(
        env.vps_pool.write8(&mut tls, &env.intrinsic, vpsid, 0x0800, 1),
        Err(MkError::Unsupported)
    );

    // 16/32/64-bit access goes through VMREAD/VMWRITE on the loaded VMCS
    env.vps_pool.write16(&mut tls, &env.intrinsic, vpsid, 0x0800, 0x10).unwrap();
    assert_eq!(env.vps_pool.read16(&mut tls, &env.intrinsic, vpsid, 0x0800).unwrap(), 0x10);
}

#[test]
fn a_cleared_vps_resumes_with_a_fresh_launch() {
    let env = TestEnv::new();
    let mut tls = env.tls(0);

    let vpsid = env.vps_pool.allocate(&env.intrinsic, &env.page_pool, 0, 0).unwrap();

    env.intrinsic.push_run_result(Ok(0x1));
    env.intrinsic.push_run_result(Ok(0x1));
    env.intrinsic.push_run_result(Ok(0x1));

    env.vps_pool.run(&mut tls, &env.intrinsic, vpsid).unwrap();
    env.vps_pool.run(&mut tls, &env.intrinsic, vpsid).unwrap();

    {
        let log = env.intrinsic.log.lock().unwrap();
        assert!(!log.runs[0].1); // launch
        assert!(log.runs[1].1); // resume
    }

    // clear detaches the hardware state; the next run launches again
    env.vps_pool.clear(&mut tls, &env.intrinsic, vpsid).unwrap();
    env.vps_pool.run(&mut tls, &env.intrinsic, vpsid).unwrap();

    let log = env.intrinsic.log.lock().unwrap();
    assert!(!log.runs[2].1);
}

#[test]
fn migration_needs_a_clear_and_invalidates_on_the_next_load() {
    let env = TestEnv::new();
    let mut tls0 = env.tls(0);
    let mut tls1 = env.tls(1);

    let vpsid = env.vps_pool.allocate(&env.intrinsic, &env.page_pool, 0, 0).unwrap();

    // load on PP 0 by touching a field
    env.vps_pool.write64(&mut tls0, &env.intrinsic, vpsid, 0x6820, 0x2).unwrap();
    assert_eq!(env.vps_pool.loaded_on(vpsid), 0);

    // loaded: migration refused; access from PP 1 refused
    assert!(env.vps_pool.migrate(&tls0, vpsid, 1).is_err());
    assert!(env.vps_pool.read64(&mut tls1, &env.intrinsic, vpsid, 0x6820).is_err());

    // clear, migrate, then the first access on PP 1 invalidates the VPID
    env.vps_pool.clear(&mut tls0, &env.intrinsic, vpsid).unwrap();
    env.vps_pool.migrate(&tls0, vpsid, 1).unwrap();
    assert_eq!(env.vps_pool.assigned_pp(vpsid), 1);

    env.vps_pool.read64(&mut tls1, &env.intrinsic, vpsid, 0x6820).unwrap();
    let log = env.intrinsic.log.lock().unwrap();
    assert_eq!(log.invvpids.len(), 1);
    assert_eq!(log.invvpids[0].1, vpsid + 1);
}
