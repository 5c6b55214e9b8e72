// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory-core root object tying collaborators, pools and handle tables together
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Machine, Vmm{new,kernel_space,current_space,space,switch_space}
//! DEPENDS_ON: hal traits, object::HandleTable, mm::pool::StaticPool
//! INVARIANTS: The kernel domain space is always registered and never destroyed

extern crate alloc;

use alloc::sync::Arc;

use static_assertions::assert_impl_all;

use crate::config::{MachineLayout, SyncPolicy};
use crate::error::VmResult;
use crate::hal::{CoreMesh, FrameAllocator, Mmu};
use crate::mm::address_space::{AddressSpace, SpaceFlags};
use crate::mm::pool::StaticPool;
use crate::object::HandleTable;
use crate::shm::ShmBuffer;
use crate::types::{ShmId, SpaceId};

/// Collaborators and layout the memory core runs against.
#[derive(Clone)]
pub struct Machine {
    pub mmu: Arc<dyn Mmu>,
    pub frames: Arc<dyn FrameAllocator>,
    pub cores: Arc<dyn CoreMesh>,
    pub layout: MachineLayout,
    pub sync: SyncPolicy,
}

impl Machine {
    pub fn new(
        mmu: Arc<dyn Mmu>,
        frames: Arc<dyn FrameAllocator>,
        cores: Arc<dyn CoreMesh>,
        layout: MachineLayout,
    ) -> Self {
        Self { mmu, frames, cores, layout, sync: SyncPolicy::default() }
    }

    pub fn with_sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }
}

/// Virtual-memory manager instance.
pub struct Vmm {
    pub(crate) machine: Machine,
    pub(crate) global: spin::Mutex<StaticPool>,
    pub(crate) spaces: HandleTable<SpaceId, AddressSpace>,
    pub(crate) shm: HandleTable<ShmId, ShmBuffer>,
    pub(crate) kernel: Arc<AddressSpace>,
}

assert_impl_all!(Vmm: Send, Sync);
assert_impl_all!(AddressSpace: Send, Sync);
assert_impl_all!(ShmBuffer: Send, Sync);

impl Vmm {
    /// Validates the layout and registers the kernel domain space.
    pub fn new(machine: Machine) -> VmResult<Self> {
        machine.layout.validate()?;
        let spaces = HandleTable::new();
        let id = spaces.reserve()?;
        let kernel = Arc::new(AddressSpace::new(
            id,
            SpaceFlags::empty(),
            None,
            None,
            machine.mmu.kernel_space(),
            &machine.layout,
        ));
        spaces.install(id, kernel.clone())?;
        let global = StaticPool::new(machine.layout.global_access, machine.layout.granularity);
        log_info!(
            target: "mm",
            "vmm online global=0x{:x}+0x{:x}",
            machine.layout.global_access.base,
            machine.layout.global_access.length
        );
        Ok(Self {
            machine,
            global: spin::Mutex::new(global),
            spaces,
            shm: HandleTable::new(),
            kernel,
        })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// The kernel domain space.
    pub fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// Space of the thread running on this core; the kernel space when none is.
    pub fn current_space(&self) -> Arc<AddressSpace> {
        self.machine
            .cores
            .current_space()
            .and_then(|id| self.spaces.lookup(id))
            .unwrap_or_else(|| self.kernel.clone())
    }

    pub fn current_space_id(&self) -> SpaceId {
        self.current_space().id()
    }

    pub fn space(&self, id: SpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces.lookup(id)
    }

    /// Loads `space` into the MMU of the calling core.
    pub fn switch_space(&self, space: &AddressSpace) -> VmResult<()> {
        self.machine.mmu.switch_space(&space.platform())
    }
}
