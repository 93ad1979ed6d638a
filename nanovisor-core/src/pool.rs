//! Fixed-size object pools
//!
//! Each pool is an array of N objects linked through a `u16` index free
//! list with `BF_INVALID_ID` (0xFFFF) as the sentinel. The free list lives
//! under its own spinlock; every object has one too, which is the per-VM /
//! per-VP / per-VPS lock the concurrency model names. A deallocate that
//! fails leaves the object zombified: its id is never relinked, the object
//! is unreachable from the allocator forever, and its resources stay
//! leaked on purpose.

use crate::error;
use crate::status::{MkError, MkResult};
use nanovisor_hal::abi::BF_INVALID_ID;
use spin::Mutex;

/// Lifecycle state of a pooled object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocatedStatus {
    #[default]
    Unallocated,
    Allocated,
    /// terminal: cleanup failed, resources deliberately leaked
    Zombie,
}

struct FreeList<const N: usize> {
    head: u16,
    next: [u16; N],
}

/// A fixed arena of `N` objects with an index-based free list.
pub struct ObjectPool<T, const N: usize> {
    free: Mutex<FreeList<N>>,
    objects: [Mutex<T>; N],
}

impl<T, const N: usize> ObjectPool<T, N> {
    /// Builds the pool; `make` receives each object's id, which equals its
    /// index.
    pub fn new(make: impl Fn(u16) -> T) -> Self {
        let mut next = [BF_INVALID_ID; N];
        for (i, slot) in next.iter_mut().enumerate().take(N.saturating_sub(1)) {
            *slot = (i + 1) as u16;
        }

        Self {
            free: Mutex::new(FreeList { head: if N == 0 { BF_INVALID_ID } else { 0 }, next }),
            objects: core::array::from_fn(|i| Mutex::new(make(i as u16))),
        }
    }

    /// Unlinks the head of the free list and runs `f` on that object to
    /// bring it to life. If `f` fails the id is relinked and the error
    /// propagated.
    pub fn allocate_with(&self, f: impl FnOnce(&mut T) -> MkResult<()>) -> MkResult<u16> {
        let id = {
            let mut free = self.free.lock();
            if free.head == BF_INVALID_ID {
                error!("pool out of objects");
                return Err(MkError::OutOfMemory);
            }

            let id = free.head;
            free.head = free.next[id as usize];
            id
        };

        let result = f(&mut self.objects[id as usize].lock());
        match result {
            Ok(()) => Ok(id),
            Err(e) => {
                let mut free = self.free.lock();
                free.next[id as usize] = free.head;
                free.head = id;
                Err(e)
            }
        }
    }

    /// Runs `f` (the object's own deallocate) and relinks the id on
    /// success. On failure the id is NOT relinked: the object is expected
    /// to have zombified itself and stays leaked.
    pub fn deallocate_with(&self, id: u16, f: impl FnOnce(&mut T) -> MkResult<()>) -> MkResult<()> {
        if id as usize >= N {
            error!("id {:#x} is greater than the pool size {:#x}", id, N);
            return Err(MkError::InvalidParams1);
        }

        f(&mut self.objects[id as usize].lock())?;

        let mut free = self.free.lock();
        free.next[id as usize] = free.head;
        free.head = id;

        Ok(())
    }

    /// Locks the object with the given id and runs `f` on it.
    pub fn with<R>(&self, id: u16, f: impl FnOnce(&mut T) -> R) -> MkResult<R> {
        if id as usize >= N {
            error!("id {:#x} is greater than the pool size {:#x}", id, N);
            return Err(MkError::InvalidParams1);
        }

        Ok(f(&mut self.objects[id as usize].lock()))
    }

    /// Visits every object in id order. Lock is per object, not global.
    pub fn for_each(&self, mut f: impl FnMut(u16, &mut T)) {
        for (i, obj) in self.objects.iter().enumerate() {
            f(i as u16, &mut obj.lock());
        }
    }
}
