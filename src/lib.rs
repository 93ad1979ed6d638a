#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Nanovisor: a bare-metal type-1 hypervisor microkernel
//!
//! This crate is the thin façade the platform boot assembly links against:
//! it owns the global kernel resources, the per-PP entry point and the
//! panic plumbing. All the actual kernel logic lives in `nanovisor-core`,
//! hardware definitions in `nanovisor-hal`, and the instruction bodies in
//! `nanovisor-x86_64`.

pub use nanovisor_core as kernel;
pub use nanovisor_hal as hal;

#[cfg(feature = "x86_64")]
pub use nanovisor_x86_64 as arch;

#[cfg(all(target_os = "none", feature = "x86_64"))]
mod entry {
    use nanovisor_core::ext::ExtPool;
    use nanovisor_core::huge_pool::HugePool;
    use nanovisor_core::mk_main::MkMain;
    use nanovisor_core::page_pool::PagePool;
    use nanovisor_core::root_page_table::RootPageTable;
    use nanovisor_core::vm::VmPool;
    use nanovisor_core::vp::VpPool;
    use nanovisor_core::vps::VpsPool;
    use nanovisor_core::{Kernel, Tls};
    use nanovisor_hal::mk_args::MkArgs;
    use nanovisor_hal::Intrinsic;
    use nanovisor_x86_64::HwIntrinsic;
    use spin::Lazy;

    static PAGE_POOL: PagePool = PagePool::new();
    static HUGE_POOL: HugePool = HugePool::new();
    static SYSTEM_RPT: RootPageTable = RootPageTable::new();
    static MK_MAIN: MkMain = MkMain::new();

    static INTRINSIC: Lazy<HwIntrinsic> = Lazy::new(HwIntrinsic::new);
    static VM_POOL: Lazy<VmPool> = Lazy::new(VmPool::new);
    static VP_POOL: Lazy<VpPool> = Lazy::new(VpPool::new);
    static VPS_POOL: Lazy<VpsPool> = Lazy::new(VpsPool::new);
    static EXT_POOL: Lazy<ExtPool> = Lazy::new(ExtPool::new);

    /// The per-PP entry, called by the platform `_start` after it has set
    /// up the stack and spilled the loader handoff.
    ///
    /// # Safety
    ///
    /// `args` must point at a valid, PP-unique `MkArgs` from the loader.
    #[no_mangle]
    pub unsafe extern "C" fn nanovisor_entry(args: *const MkArgs) -> i64 {
        let args = unsafe { &*args };
        let mut tls = Tls::new(args.ppid, args.online_pps);

        let k = Kernel {
            intrinsic: &*INTRINSIC,
            page_pool: &PAGE_POOL,
            huge_pool: &HUGE_POOL,
            system_rpt: &SYSTEM_RPT,
            vm_pool: &VM_POOL,
            vp_pool: &VP_POOL,
            vps_pool: &VPS_POOL,
            ext_pool: &EXT_POOL,
        };

        match MK_MAIN.process(&k, args, &mut tls) {
            Ok(()) => 0,
            Err(_) => INTRINSIC.halt(),
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
        nanovisor_core::log!("[panic] {}", info);
        INTRINSIC.halt()
    }
}
