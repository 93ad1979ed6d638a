//! Architecture-specific hardware definitions
//!
//! Field encodings and structure layouts that are fixed by the
//! architecture rather than by this kernel. Only definitions live here;
//! the instruction bodies that consume them are `nanovisor-x86_64`'s
//! concern.

pub mod x86_64;
