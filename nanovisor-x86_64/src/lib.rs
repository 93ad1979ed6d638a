#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! x86_64 architecture support for Nanovisor
//!
//! The bare-metal implementation of the HAL's `Intrinsic` trait: inline
//! assembly instruction wrappers, the guest world-switch shims and CPU
//! vendor detection. The architectural definitions it consumes (VMCS field
//! encodings, VMCB layout) live in `nanovisor-hal`'s arch subtree and are
//! re-exported here for platform code. Nothing outside this crate touches
//! an instruction.

pub mod intrinsic;

pub use nanovisor_hal::arch::x86_64::{vmcb, vmcs};

#[cfg(target_os = "none")]
pub use intrinsic::HwIntrinsic;
