//! bf_mem_op syscalls
//!
//! Page, huge and heap allocation on behalf of the extension. Page and
//! huge memory lands in VM 0's direct map; heap memory grows the main RPT.
//! The free ops are accepted as well-formed and refused: direct-map pages
//! are reclaimed at teardown through auto-release, never early.

use crate::error;
use crate::ext::Extension;
use crate::syscall::SyscallExit;
use crate::tls::Tls;
use crate::Kernel;
use nanovisor_hal::abi::{
    bf_syscall_index, BfStatus, BF_MEM_OP_ALLOC_HEAP_IDX_VAL, BF_MEM_OP_ALLOC_HUGE_IDX_VAL,
    BF_MEM_OP_ALLOC_PAGE_IDX_VAL, BF_MEM_OP_FREE_HUGE_IDX_VAL, BF_MEM_OP_FREE_PAGE_IDX_VAL,
    BF_STATUS_FAILURE_INVALID_HANDLE, BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_SUCCESS,
};

/// Implements bf_mem_op_alloc_page
fn alloc_page(k: &Kernel<'_>, tls: &mut Tls, ext: &Extension) -> BfStatus {
    match ext.alloc_page(k.page_pool) {
        Ok((virt, phys)) => {
            tls.ext_reg0 = virt;
            tls.ext_reg1 = phys;
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Implements bf_mem_op_free_page
fn free_page(tls: &Tls, ext: &Extension) -> BfStatus {
    match ext.free_page(tls.ext_reg1) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_mem_op_alloc_huge
fn alloc_huge(k: &Kernel<'_>, tls: &mut Tls, ext: &Extension) -> BfStatus {
    match ext.alloc_huge(k.page_pool, k.huge_pool, tls.ext_reg1) {
        Ok((virt, phys)) => {
            tls.ext_reg0 = virt;
            tls.ext_reg1 = phys;
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Implements bf_mem_op_free_huge
fn free_huge(tls: &Tls, ext: &Extension) -> BfStatus {
    match ext.free_huge(tls.ext_reg1) {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(e) => e.to_status(),
    }
}

/// Implements bf_mem_op_alloc_heap
fn alloc_heap(k: &Kernel<'_>, tls: &mut Tls, ext: &Extension) -> BfStatus {
    match ext.alloc_heap(k.page_pool, tls.ext_reg1) {
        Ok(previous_heap_virt) => {
            tls.ext_reg0 = previous_heap_virt;
            BF_STATUS_SUCCESS
        }
        Err(e) => e.to_status(),
    }
}

/// Dispatches the bf_mem_op syscalls
pub fn dispatch(k: &Kernel<'_>, tls: &mut Tls, ext: &Extension) -> SyscallExit {
    if !ext.is_handle_valid(tls.ext_reg0) {
        error!("invalid handle: {:#x}", tls.ext_reg0);
        return SyscallExit::Return(BF_STATUS_FAILURE_INVALID_HANDLE);
    }

    let status = match bf_syscall_index(tls.ext_syscall) {
        BF_MEM_OP_ALLOC_PAGE_IDX_VAL => alloc_page(k, tls, ext),
        BF_MEM_OP_FREE_PAGE_IDX_VAL => free_page(tls, ext),
        BF_MEM_OP_ALLOC_HUGE_IDX_VAL => alloc_huge(k, tls, ext),
        BF_MEM_OP_FREE_HUGE_IDX_VAL => free_huge(tls, ext),
        BF_MEM_OP_ALLOC_HEAP_IDX_VAL => alloc_heap(k, tls, ext),
        _ => {
            error!("unknown syscall index: {:#x}", tls.ext_syscall);
            BF_STATUS_FAILURE_UNKNOWN
        }
    };

    SyscallExit::Return(status)
}
