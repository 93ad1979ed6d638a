//! Property tests for the ABI encodings and the pool free lists.

extern crate std;

use proptest::prelude::*;

use nanovisor_core::vm::VmPool;
use nanovisor_hal::abi::{
    bf_syscall_flags, bf_syscall_index, bf_syscall_opcode_nosig, bf_syscall_sig, BfReg,
    BF_STATUS_FAILURE_INVALID_HANDLE, BF_STATUS_FAILURE_OUT_OF_MEMORY,
    BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_FAILURE_UNSUPPORTED, BF_STATUS_INVALID_PARAMS1,
    BF_STATUS_INVALID_PARAMS2, BF_STATUS_INVALID_PARAMS3, BF_STATUS_INVALID_PARAMS4,
    BF_STATUS_INVALID_PARAMS5, BF_STATUS_SUCCESS,
};

proptest! {
    /// The four opcode lanes partition the word: or-ing them back together
    /// reproduces any input exactly.
    #[test]
    fn opcode_lanes_partition_the_word(x in any::<u64>()) {
        let rebuilt = bf_syscall_sig(x)
            | bf_syscall_flags(x)
            | bf_syscall_opcode_nosig(x)
            | bf_syscall_index(x);
        prop_assert_eq!(rebuilt, x);
    }

    /// Register decoding accepts exactly the defined range.
    #[test]
    fn bf_reg_decoding_is_total_over_the_defined_range(x in any::<u64>()) {
        match BfReg::from_u64(x) {
            Some(reg) => prop_assert_eq!(reg as u64, x),
            None => prop_assert!(x > BfReg::Ia32Debugctl as u64),
        }
    }

    /// Allocate/deallocate churn never hands out an id twice and never
    /// loses one.
    #[test]
    fn vm_pool_free_list_never_duplicates_ids(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
        let pool = VmPool::new();
        let mut live: std::vec::Vec<u16> = std::vec::Vec::new();

        for op in ops {
            if op || live.is_empty() {
                match pool.allocate() {
                    Ok(id) => {
                        prop_assert!(!live.contains(&id));
                        prop_assert!((id as usize) < nanovisor_core::config::MAX_VMS);
                        live.push(id);
                    }
                    Err(_) => prop_assert_eq!(live.len(), nanovisor_core::config::MAX_VMS),
                }
            } else {
                let id = live.swap_remove(live.len() / 2);
                if id == 0 {
                    // the root VM is immortal; its id stays live
                    prop_assert!(pool.deallocate(id).is_err());
                    live.push(id);
                } else {
                    prop_assert!(pool.deallocate(id).is_ok());
                }
            }
        }

        for id in &live {
            prop_assert!(pool.is_allocated(*id));
        }
    }
}

#[test]
fn status_words_are_pairwise_distinct() {
    let statuses = [
        BF_STATUS_SUCCESS,
        BF_STATUS_FAILURE_UNKNOWN,
        BF_STATUS_FAILURE_INVALID_HANDLE,
        BF_STATUS_FAILURE_UNSUPPORTED,
        BF_STATUS_FAILURE_OUT_OF_MEMORY,
        BF_STATUS_INVALID_PARAMS1,
        BF_STATUS_INVALID_PARAMS2,
        BF_STATUS_INVALID_PARAMS3,
        BF_STATUS_INVALID_PARAMS4,
        BF_STATUS_INVALID_PARAMS5,
    ];

    for (i, a) in statuses.iter().enumerate() {
        for b in statuses.iter().skip(i + 1) {
            assert_ne!(a, b);
        }
    }
}
