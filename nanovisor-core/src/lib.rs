#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Nanovisor core microkernel functionality
//!
//! The kernel proper: object pools, the root page table manager, the VM, VP
//! and VPS objects, the extension object and ELF loader, the syscall
//! dispatcher and the VMExit loop. Everything here is hardware-independent
//! modulo the `Intrinsic` trait, which is how the whole crate runs under
//! host tests with a mock CPU.

pub mod config;
pub mod elf;
pub mod ext;
pub mod huge_pool;
pub mod log;
pub mod mk_main;
pub mod page_pool;
pub mod pool;
pub mod root_page_table;
pub mod status;
pub mod syscall;
pub mod vm;
pub mod vmexit;
pub mod vp;
pub mod vps;

use nanovisor_hal::Intrinsic;

pub use nanovisor_hal::tls;
pub use nanovisor_hal::tls::Tls;
pub use status::{MkError, MkResult};

/// Every global resource the kernel wires together, bundled so the
/// dispatcher, the VMExit loop and `mk_main` share one signature. The
/// platform entry builds one of these per boot; tests build one per case.
pub struct Kernel<'k> {
    pub intrinsic: &'k dyn Intrinsic,
    pub page_pool: &'k page_pool::PagePool,
    pub huge_pool: &'k huge_pool::HugePool,
    pub system_rpt: &'k root_page_table::RootPageTable,
    pub vm_pool: &'k vm::VmPool,
    pub vp_pool: &'k vp::VpPool,
    pub vps_pool: &'k vps::VpsPool,
    pub ext_pool: &'k ext::ExtPool,
}
