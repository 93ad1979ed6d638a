#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hardware Abstraction Layer for the Nanovisor microkernel
//!
//! This crate defines everything the microkernel shares with the platform
//! layer and with the loader: address and page-table entry types, the
//! `Intrinsic` trait that wraps the CPU instructions the kernel executes,
//! the architectural VMCS/VMCB field encodings, the state-save layout, the
//! per-PP TLS block, the loader handoff struct and the syscall ABI
//! constants. None of this performs hardware access itself; the real
//! instruction bodies live in `nanovisor-x86_64`, and host tests supply a
//! mock.

pub mod abi;
pub mod arch;
pub mod debug_ring;
pub mod intrinsic;
pub mod memory;
pub mod mk_args;
pub mod paging;
pub mod state;
pub mod tls;

// Re-export core types
pub use intrinsic::{Intrinsic, IntrinsicError, MissingRegisters, Vendor, VmRunError};
pub use memory::{MapFlags, PhysicalAddress, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};
pub use state::StateSave;
pub use tls::Tls;
