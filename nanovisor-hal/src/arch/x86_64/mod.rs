//! x86_64 hardware definitions: Intel VMCS field encodings and the AMD
//! VMCB layout

pub mod vmcb;
pub mod vmcs;
