//! The kernel's notion of a VP
//!
//! A VP binds a VM to a PP. Its VM assignment is permanent until the VP
//! is destroyed; its PP assignment is permanent except through
//! `migrate`, which is only legal while the VP is inactive everywhere.

use crate::config::{MAX_PPS, MAX_VPS};
use crate::error;
use crate::pool::{AllocatedStatus, ObjectPool};
use crate::status::{MkError, MkResult};
use crate::tls::Tls;
use nanovisor_hal::abi::BF_INVALID_ID;

/// One VP
pub struct Vp {
    id: u16,
    status: AllocatedStatus,
    assigned_vmid: u16,
    assigned_ppid: u16,
    active_ppid: u16,
}

impl Vp {
    fn new(id: u16) -> Self {
        Self {
            id,
            status: AllocatedStatus::Unallocated,
            assigned_vmid: BF_INVALID_ID,
            assigned_ppid: BF_INVALID_ID,
            active_ppid: BF_INVALID_ID,
        }
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

    fn allocate(&mut self, vmid: u16, ppid: u16) -> MkResult<()> {
        match self.status {
            AllocatedStatus::Unallocated => {
                self.status = AllocatedStatus::Allocated;
                self.assigned_vmid = vmid;
                self.assigned_ppid = ppid;
                self.active_ppid = BF_INVALID_ID;
                Ok(())
            }
            AllocatedStatus::Allocated => {
                error!("vp {:#x} was already allocated", self.id);
                Err(MkError::Unknown)
            }
            AllocatedStatus::Zombie => {
                error!("vp {:#x} is a zombie", self.id);
                Err(MkError::Unknown)
            }
        }
    }

    fn deallocate(&mut self) -> MkResult<()> {
        if self.status != AllocatedStatus::Allocated {
            error!("vp {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.active_ppid != BF_INVALID_ID {
            error!("vp {:#x} is still active and cannot be deallocated", self.id);
            self.status = AllocatedStatus::Zombie;
            return Err(MkError::Unknown);
        }

        self.assigned_vmid = BF_INVALID_ID;
        self.assigned_ppid = BF_INVALID_ID;
        self.status = AllocatedStatus::Unallocated;

        Ok(())
    }

    pub fn set_active(&mut self, tls: &mut Tls) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vp {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if tls.active_vpid != BF_INVALID_ID {
            error!("vp {:#x} is still active on pp {:#x}", tls.active_vpid, tls.ppid);
            return Err(MkError::Unknown);
        }

        if self.active_ppid != BF_INVALID_ID {
            error!("vp {:#x} is already active", self.id);
            return Err(MkError::Unknown);
        }

        self.active_ppid = tls.ppid;
        tls.active_vpid = self.id;

        Ok(())
    }

    pub fn set_inactive(&mut self, tls: &mut Tls) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vp {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if tls.active_vpid != self.id || self.active_ppid == BF_INVALID_ID {
            error!("vp {:#x} is not active", self.id);
            return Err(MkError::Unknown);
        }

        self.active_ppid = BF_INVALID_ID;
        tls.active_vpid = BF_INVALID_ID;

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active_ppid != BF_INVALID_ID
    }

    pub fn active_pp(&self) -> u16 {
        self.active_ppid
    }

    pub fn assigned_vm(&self) -> u16 {
        self.assigned_vmid
    }

    pub fn assigned_pp(&self) -> u16 {
        self.assigned_ppid
    }

    /// Rebinds this VP to another PP. Only legal while the VP is inactive
    /// everywhere; VPSs assigned to this VP then migrate lazily through
    /// the run path.
    pub fn migrate(&mut self, tls: &Tls, ppid: u16) -> MkResult<()> {
        if !self.is_allocated() {
            error!("vp {:#x} was never allocated", self.id);
            return Err(MkError::Unknown);
        }

        if self.active_ppid != BF_INVALID_ID {
            error!("vp {:#x} is currently active and cannot be migrated", self.id);
            return Err(MkError::Unknown);
        }

        if ppid >= tls.online_pps || ppid as usize >= MAX_PPS {
            error!("pp {:#x} is out of range", ppid);
            return Err(MkError::InvalidParams2);
        }

        self.assigned_ppid = ppid;
        Ok(())
    }
}

/// The VP pool
pub struct VpPool {
    pool: ObjectPool<Vp, MAX_VPS>,
}

impl VpPool {
    pub fn new() -> Self {
        Self { pool: ObjectPool::new(Vp::new) }
    }

    /// Allocates a VP assigned to the given VM and PP.
    pub fn allocate(&self, vmid: u16, ppid: u16) -> MkResult<u16> {
        self.pool.allocate_with(|vp| vp.allocate(vmid, ppid))
    }

    /// Destroys a VP. A VP that turns out to be active zombifies instead
    /// of coming back.
    pub fn deallocate(&self, vpid: u16) -> MkResult<()> {
        self.pool.deallocate_with(vpid, |vp| vp.deallocate())
    }

    pub fn is_allocated(&self, vpid: u16) -> bool {
        self.pool.with(vpid, |vp| vp.is_allocated()).unwrap_or(false)
    }

    pub fn is_zombie(&self, vpid: u16) -> bool {
        self.pool.with(vpid, |vp| vp.is_zombie()).unwrap_or(false)
    }

    pub fn set_active(&self, tls: &mut Tls, vpid: u16) -> MkResult<()> {
        self.pool.with(vpid, |vp| vp.set_active(tls))?
    }

    pub fn set_inactive(&self, tls: &mut Tls, vpid: u16) -> MkResult<()> {
        self.pool.with(vpid, |vp| vp.set_inactive(tls))?
    }

    pub fn is_active(&self, vpid: u16) -> bool {
        self.pool.with(vpid, |vp| vp.is_active()).unwrap_or(false)
    }

    pub fn assigned_vm(&self, vpid: u16) -> u16 {
        self.pool.with(vpid, |vp| vp.assigned_vm()).unwrap_or(nanovisor_hal::abi::BF_INVALID_ID)
    }

    pub fn assigned_pp(&self, vpid: u16) -> u16 {
        self.pool.with(vpid, |vp| vp.assigned_pp()).unwrap_or(nanovisor_hal::abi::BF_INVALID_ID)
    }

    pub fn migrate(&self, tls: &Tls, vpid: u16, ppid: u16) -> MkResult<()> {
        self.pool.with(vpid, |vp| vp.migrate(tls, ppid))?
    }

    /// True if any allocated VP is assigned to the given VM. Destroying a
    /// VM is refused while this holds.
    pub fn any_assigned_to_vm(&self, vmid: u16) -> bool {
        let mut found = false;
        self.pool.for_each(|_, vp| {
            if vp.is_allocated() && vp.assigned_vm() == vmid {
                found = true;
            }
        });
        found
    }
}

impl Default for VpPool {
    fn default() -> Self {
        Self::new()
    }
}
