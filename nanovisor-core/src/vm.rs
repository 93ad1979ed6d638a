//! The kernel's notion of a VM
//!
//! A VM is a namespace of VPs plus per-PP activity tracking. It may be
//! active on many PPs at once, which is why its activity state is a bit
//! per PP rather than a single id. The root VM (id 0) is created at boot
//! and can never be destroyed or zombified.

use crate::config::MAX_PPS;
use crate::config::MAX_VMS;
use crate::error;
use crate::pool::{AllocatedStatus, ObjectPool};
use crate::status::{MkError, MkResult};
use crate::tls::Tls;
use nanovisor_hal::abi::{BF_INVALID_ID, BF_ROOT_VMID};

/// One VM
pub struct Vm {
    id: u16,
    status: AllocatedStatus,
    active: [bool; MAX_PPS],
}

impl Vm {
    fn new(id: u16) -> Self {
        Self { id, status: AllocatedStatus::Unallocated, active: [false; MAX_PPS] }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_allocated(&self) -> bool {
        self.status == AllocatedStatus::Allocated
    }

    pub fn is_zombie(&self) -> bool {
        self.status == AllocatedStatus::Zombie
    }

    fn allocate(&mut self) -> MkResult<()> {
        match self.status {
            AllocatedStatus::Unallocated => {
                self.status = AllocatedStatus::Allocated;
                Ok(())
            }
            AllocatedStatus::Allocated => {
                error!("vm {:#x} was already allocated", self.id);
                Err(MkError::Unknown)
            }
            AllocatedStatus::Zombie => {
                error!("vm {:#x} is a zombie", self.id);
                Err(MkError::Unknown)
            }
        }
    }

    fn deallocate(&mut self) -> MkResult<()> {
        if self.status != AllocatedStatus::Allocated {
            error!("vm {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.is_active() {
            error!("vm {:#x} is still active and cannot be deallocated", self.id);
            self.status = AllocatedStatus::Zombie;
            return Err(MkError::Unknown);
        }

        self.status = AllocatedStatus::Unallocated;
        Ok(())
    }

    /// Marks this VM active on the caller's PP and records it in the TLS
    /// block. Fails if another VM is active there or this one already is.
    pub fn set_active(&mut self, tls: &mut Tls) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vm {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if tls.active_vmid != BF_INVALID_ID {
            error!("vm {:#x} is still active on pp {:#x}", tls.active_vmid, tls.ppid);
            return Err(MkError::Unknown);
        }

        let pp = tls.ppid as usize;
        if pp >= MAX_PPS || self.active[pp] {
            error!("vm {:#x} is already active on pp {:#x}", self.id, tls.ppid);
            return Err(MkError::Unknown);
        }

        self.active[pp] = true;
        tls.active_vmid = self.id;

        Ok(())
    }

    /// Clears this VM's activity on the caller's PP.
    pub fn set_inactive(&mut self, tls: &mut Tls) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vm {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if tls.active_vmid != self.id {
            error!("vm {:#x} is not active on pp {:#x}", self.id, tls.ppid);
            return Err(MkError::Unknown);
        }

        let pp = tls.ppid as usize;
        if pp >= MAX_PPS || !self.active[pp] {
            error!("vm {:#x} is not active on pp {:#x}", self.id, tls.ppid);
            return Err(MkError::Unknown);
        }

        self.active[pp] = false;
        tls.active_vmid = BF_INVALID_ID;

        Ok(())
    }

    /// True if this VM is active on any PP.
    pub fn is_active(&self) -> bool {
        self.active.iter().any(|&a| a)
    }

    /// True if this VM is active on the given PP.
    pub fn is_active_on(&self, ppid: u16) -> bool {
        (ppid as usize) < MAX_PPS && self.active[ppid as usize]
    }
}

/// The VM pool
pub struct VmPool {
    pool: ObjectPool<Vm, MAX_VMS>,
}

impl VmPool {
    pub fn new() -> Self {
        Self { pool: ObjectPool::new(Vm::new) }
    }

    /// Allocates a VM and returns its id. The first allocation after boot
    /// yields the root VM, id 0.
    pub fn allocate(&self) -> MkResult<u16> {
        self.pool.allocate_with(|vm| vm.allocate())
    }

    /// Destroys a VM. Never the root VM, never one that is active. A VM
    /// that turns out to be active zombifies instead of coming back.
    pub fn deallocate(&self, vmid: u16) -> MkResult<()> {
        if vmid == BF_ROOT_VMID {
            error!("the root vm cannot be destroyed");
            return Err(MkError::Unknown);
        }

        self.pool.deallocate_with(vmid, |vm| vm.deallocate())
    }

    pub fn is_allocated(&self, vmid: u16) -> bool {
        self.pool.with(vmid, |vm| vm.is_allocated()).unwrap_or(false)
    }

    pub fn is_zombie(&self, vmid: u16) -> bool {
        self.pool.with(vmid, |vm| vm.is_zombie()).unwrap_or(false)
    }

    pub fn set_active(&self, tls: &mut Tls, vmid: u16) -> MkResult<()> {
        self.pool.with(vmid, |vm| vm.set_active(tls))?
    }

    pub fn set_inactive(&self, tls: &mut Tls, vmid: u16) -> MkResult<()> {
        self.pool.with(vmid, |vm| vm.set_inactive(tls))?
    }

    pub fn is_active(&self, vmid: u16) -> bool {
        self.pool.with(vmid, |vm| vm.is_active()).unwrap_or(false)
    }

    pub fn is_active_on(&self, vmid: u16, ppid: u16) -> bool {
        self.pool.with(vmid, |vm| vm.is_active_on(ppid)).unwrap_or(false)
    }
}

impl Default for VmPool {
    fn default() -> Self {
        Self::new()
    }
}
