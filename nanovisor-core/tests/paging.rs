//! Root page table manager tests: mapping rules, aliasing, auto-release
//! accounting.

extern crate std;

mod common;

use common::TestEnv;
use nanovisor_core::page_pool::PageTag;
use nanovisor_core::root_page_table::RootPageTable;
use nanovisor_core::MkError;
use nanovisor_hal::memory::MapFlags;
use nanovisor_hal::paging::{AutoRelease, Pml4t, Pml4te, PT_ENTRIES};

const V: u64 = 0x0000_0080_0000_0000;
const P: u64 = 0x1000_0000;

#[test]
fn map_enforces_alignment_and_wx() {
    let env = TestEnv::new();
    let rpt = &env.system_rpt;

    let rw = MapFlags::READ | MapFlags::WRITE;

    assert_eq!(
        rpt.map_page(&env.page_pool, V + 1, P, rw, AutoRelease::NoAutoRelease),
        Err(MkError::InvalidParams1)
    );
    assert_eq!(
        rpt.map_page(&env.page_pool, V, P + 1, rw, AutoRelease::NoAutoRelease),
        Err(MkError::InvalidParams2)
    );
    assert_eq!(
        rpt.map_page(
            &env.page_pool,
            V,
            P,
            MapFlags::READ | MapFlags::WRITE | MapFlags::EXECUTE,
            AutoRelease::NoAutoRelease
        ),
        Err(MkError::InvalidParams3)
    );
    assert_eq!(
        rpt.map_page(&env.page_pool, V, P, MapFlags::empty(), AutoRelease::NoAutoRelease),
        Err(MkError::InvalidParams3)
    );
}

#[test]
fn remapping_a_mapped_address_reports_already_exists() {
    let env = TestEnv::new();
    let rpt = RootPageTable::new();
    rpt.initialize(&env.page_pool).unwrap();

    let rw = MapFlags::READ | MapFlags::WRITE;

    assert_eq!(rpt.map_page(&env.page_pool, V, P, rw, AutoRelease::NoAutoRelease), Ok(()));
    assert_eq!(
        rpt.map_page(&env.page_pool, V, P, rw, AutoRelease::NoAutoRelease),
        Err(MkError::AlreadyExists)
    );
    assert_eq!(rpt.lookup(&env.page_pool, V), Ok(P));

    // after a release the address is free again, this time read/execute
    rpt.release(&env.page_pool, &env.huge_pool);
    rpt.initialize(&env.page_pool).unwrap();
    assert_eq!(
        rpt.map_page(&env.page_pool, V, P, MapFlags::READ | MapFlags::EXECUTE, AutoRelease::NoAutoRelease),
        Ok(())
    );
    assert_eq!(rpt.lookup(&env.page_pool, V), Ok(P));

    rpt.release(&env.page_pool, &env.huge_pool);
}

#[test]
fn release_returns_every_auto_released_frame_exactly_once() {
    let env = TestEnv::new();
    let baseline = env.page_pool.total_outstanding();

    let rpt = RootPageTable::new();
    rpt.initialize(&env.page_pool).unwrap();

    for i in 0..8u64 {
        rpt.allocate_page_rw(&env.page_pool, V + i * 0x1000, AutoRelease::Stack).unwrap();
    }

    assert_eq!(env.page_pool.outstanding(PageTag::ExtStack), 8);

    rpt.release(&env.page_pool, &env.huge_pool);

    // the stack pages, the interior tables and the PML4T all came back
    assert_eq!(env.page_pool.outstanding(PageTag::ExtStack), 0);
    assert_eq!(env.page_pool.total_outstanding(), baseline);
}

#[test]
fn aliased_entries_are_never_walked_for_teardown() {
    let env = TestEnv::new();

    let owner = RootPageTable::new();
    owner.initialize(&env.page_pool).unwrap();
    owner.allocate_page_rw(&env.page_pool, V, AutoRelease::Stack).unwrap();

    let borrower = RootPageTable::new();
    borrower.initialize(&env.page_pool).unwrap();
    borrower.add_tables(&owner).unwrap();

    // the alias sees the mapping
    assert_eq!(borrower.lookup(&env.page_pool, V), owner.lookup(&env.page_pool, V));

    // releasing the borrower frees only its own PML4T
    borrower.release(&env.page_pool, &env.huge_pool);
    assert_eq!(env.page_pool.outstanding(PageTag::ExtStack), 1);
    assert_eq!(owner.lookup(&env.page_pool, V).is_ok(), true);

    // the owner's release returns the frame exactly once
    owner.release(&env.page_pool, &env.huge_pool);
    assert_eq!(env.page_pool.outstanding(PageTag::ExtStack), 0);
}

#[test]
fn kernel_owned_pml4_slots_cannot_be_mapped_from_userspace() {
    let env = TestEnv::new();

    // a loader-style source hierarchy with a supervisor-only slot
    let mut src = Box::new(Pml4t { entries: [Pml4te::zero(); PT_ENTRIES] });
    let mut kernel_slot = Pml4te::zero();
    kernel_slot.set_present(true);
    kernel_slot.set_phys(0x5000);
    // us stays 0: this slot belongs to the kernel
    src.entries[1] = kernel_slot;

    let rpt = RootPageTable::new();
    rpt.initialize(&env.page_pool).unwrap();
    unsafe { rpt.add_tables_from(&*src).unwrap() };

    // V sits in slot 1, which the kernel owns
    let rw = MapFlags::READ | MapFlags::WRITE;
    assert_eq!(
        rpt.map_page(&env.page_pool, V, P, rw, AutoRelease::NoAutoRelease),
        Err(MkError::Unknown)
    );

    rpt.release(&env.page_pool, &env.huge_pool);
}

#[test]
fn unaligned_mapping_rounds_to_the_page() {
    let env = TestEnv::new();
    let rpt = RootPageTable::new();
    rpt.initialize(&env.page_pool).unwrap();

    rpt.map_page_unaligned(
        &env.page_pool,
        V + 0x123,
        P + 0x456,
        MapFlags::READ | MapFlags::WRITE,
        AutoRelease::NoAutoRelease,
    )
    .unwrap();

    assert_eq!(rpt.lookup(&env.page_pool, V), Ok(P));
    rpt.release(&env.page_pool, &env.huge_pool);
}
