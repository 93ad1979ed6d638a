//! Compile-time kernel configuration
//!
//! Pool sizes and the extension address-space geometry. The geometry is
//! PML4-slot granular: every purpose owns whole 512 GiB slots, so aliasing
//! a slot between root page tables never exposes an unrelated region.

/// Max number of physical processors the kernel supports
pub const MAX_PPS: usize = 64;

/// Max number of VMs the VM pool holds
pub const MAX_VMS: usize = 16;

/// Max number of VPs the VP pool holds
pub const MAX_VPS: usize = 64;

/// Max number of VPSs the VPS pool holds
pub const MAX_VPSS: usize = 64;

/// Max number of extensions the kernel hosts
pub const MAX_EXTS: usize = 1;

/// Where extension images are linked to live
pub const EXT_CODE_ADDR: u64 = 0x0000_0080_0000_0000;

/// Upper bound on an extension image's in-memory size
pub const EXT_CODE_SIZE: u64 = 128 * 1024 * 1024;

/// Base of the per-PP extension stacks
pub const EXT_STACK_ADDR: u64 = 0x0000_0100_0000_0000;

/// Usable bytes per extension stack. Stacks are laid out at a stride of
/// `EXT_STACK_SIZE + PAGE_SIZE`; the unmapped page is the guard.
pub const EXT_STACK_SIZE: u64 = 0x8000;

/// Base of the per-PP extension TLS blocks
pub const EXT_TLS_ADDR: u64 = 0x0000_0180_0000_0000;

/// Bytes per TLS block: the user TLS page plus the ABI page. Blocks are
/// laid out at a stride of `EXT_TLS_SIZE + PAGE_SIZE`.
pub const EXT_TLS_SIZE: u64 = 0x2000;

/// Base of the extension heap window
pub const EXT_HEAP_POOL_ADDR: u64 = 0x0000_0200_0000_0000;

/// Size of the extension heap window
pub const EXT_HEAP_POOL_SIZE: u64 = 64 * 1024 * 1024;

/// Base of the extension's per-VM direct map
pub const EXT_DIRECT_MAP_ADDR: u64 = 0x0000_0600_0000_0000;

/// Size of the direct map window
pub const EXT_DIRECT_MAP_SIZE: u64 = 1 << 40;

/// Where `bf_mem_op_alloc_page`/`alloc_huge` memory appears: the direct
/// map, offset by the allocation's physical address.
pub const EXT_PAGE_POOL_ADDR: u64 = EXT_DIRECT_MAP_ADDR;
