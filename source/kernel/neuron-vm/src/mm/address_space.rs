// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space objects and their lifecycle (root, inheriting child, kernel clone)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, SpaceFlags, Vmm::{create_address_space,destroy_address_space}
//! DEPENDS_ON: mm::ledger::AddressSpaceContext, hal::Mmu, object::HandleTable
//! INVARIANTS: Children point at the topmost application ancestor; only roots own a Context

extern crate alloc;

use alloc::sync::Arc;

use bitflags::bitflags;

use super::flags::MappingFlags;
use super::ledger::{AddressSpaceContext, AllocId};
use super::pool::DynamicPool;
use crate::config::MachineLayout;
use crate::error::{VmError, VmResult};
use crate::hal::PlatformBlock;
use crate::types::{ShmId, SpaceId, VirtAddr};
use crate::vmm::Vmm;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct SpaceFlags: u32 {
        /// Share the creator's layout (and Context, for applications).
        const INHERIT = 1 << 0;
        /// User process space; carries a Context and a thread-local pool in use.
        const APPLICATION = 1 << 1;
    }
}

/// One page-table root plus the allocation tracking attached to it.
pub struct AddressSpace {
    id: SpaceId,
    flags: SpaceFlags,
    parent: Option<SpaceId>,
    context: Option<Arc<AddressSpaceContext>>,
    thread_local: spin::Mutex<DynamicPool>,
    platform: spin::Mutex<PlatformBlock>,
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("parent", &self.parent)
            .field("tracked", &self.context.is_some())
            .finish()
    }
}

impl AddressSpace {
    pub(crate) fn new(
        id: SpaceId,
        flags: SpaceFlags,
        parent: Option<SpaceId>,
        context: Option<Arc<AddressSpaceContext>>,
        platform: PlatformBlock,
        layout: &MachineLayout,
    ) -> Self {
        Self {
            id,
            flags,
            parent,
            context,
            thread_local: spin::Mutex::new(DynamicPool::new(layout.thread_local, layout.granularity)),
            platform: spin::Mutex::new(platform),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn flags(&self) -> SpaceFlags {
        self.flags
    }

    pub fn parent(&self) -> Option<SpaceId> {
        self.parent
    }

    pub fn context(&self) -> Option<&Arc<AddressSpaceContext>> {
        self.context.as_ref()
    }

    pub fn is_application(&self) -> bool {
        self.flags.contains(SpaceFlags::APPLICATION)
    }

    /// Root spaces own their Context; children only borrow the root's.
    pub fn owns_context(&self) -> bool {
        self.context.is_some() && self.parent.is_none()
    }

    /// Copy of the platform page-table block.
    pub fn platform(&self) -> PlatformBlock {
        *self.platform.lock()
    }

    /// Two spaces are related when they share a Context, or when neither is tracked.
    pub fn are_related(&self, other: &AddressSpace) -> bool {
        match (&self.context, &other.context) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    pub(crate) fn thread_local(&self) -> spin::MutexGuard<'_, DynamicPool> {
        self.thread_local.lock()
    }

    /// Tracks a region in the Context; untracked spaces succeed without recording anything.
    pub fn register_allocation(
        &self,
        base: VirtAddr,
        length: usize,
        flags: MappingFlags,
        shm_tag: Option<ShmId>,
    ) -> VmResult<Option<AllocId>> {
        match &self.context {
            Some(context) => context.create(self.id, base, length, flags, shm_tag).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_signal_handler(&self, handler: VirtAddr) -> VmResult<()> {
        let context = self.context.as_ref().ok_or(VmError::InvalidParams)?;
        context.set_signal_handler(handler);
        Ok(())
    }

    pub fn signal_handler(&self) -> Option<VirtAddr> {
        self.context.as_ref().and_then(|context| context.signal_handler())
    }
}

impl Vmm {
    /// Creates an address space according to `flags`.
    ///
    /// `INHERIT` alone clones the current kernel space and returns the current handle.
    /// `APPLICATION | INHERIT` shares the Context of the topmost application ancestor.
    /// `APPLICATION` builds a root with a fresh Context.
    ///
    /// # Panics
    ///
    /// Any other flag combination is a contract breach and halts.
    pub fn create_address_space(&self, flags: SpaceFlags) -> VmResult<(SpaceId, Arc<AddressSpace>)> {
        let current = self.current_space();
        if flags == SpaceFlags::INHERIT {
            let parent = current.platform();
            let mut block = parent;
            self.machine.mmu.clone_space(&parent, &mut block, true)?;
            let space = AddressSpace::new(
                current.id,
                current.flags,
                current.parent,
                None,
                block,
                &self.machine.layout,
            );
            log_debug!(target: "as", "kernel clone of space {}", current.id.to_raw());
            return Ok((current.id, Arc::new(space)));
        }
        if flags != SpaceFlags::APPLICATION && flags != SpaceFlags::APPLICATION | SpaceFlags::INHERIT {
            panic!("create_address_space: unsupported flags 0x{:x}", flags.bits());
        }
        if flags.contains(SpaceFlags::INHERIT) && current.is_application() {
            return self.create_child(&current);
        }
        self.create_root()
    }

    fn create_child(&self, current: &AddressSpace) -> VmResult<(SpaceId, Arc<AddressSpace>)> {
        let ancestor_id = current.parent.unwrap_or(current.id);
        let ancestor = self.spaces.acquire(ancestor_id).ok_or(VmError::NotFound)?;
        let seed = ancestor.platform();
        let mut block = seed;
        if let Err(error) = self.machine.mmu.clone_space(&seed, &mut block, true) {
            self.release_space(ancestor_id);
            return Err(error);
        }
        let id = match self.spaces.reserve() {
            Ok(id) => id,
            Err(error) => {
                self.machine.mmu.destroy_space(&block);
                self.release_space(ancestor_id);
                return Err(error);
            }
        };
        let space = Arc::new(AddressSpace::new(
            id,
            SpaceFlags::APPLICATION | SpaceFlags::INHERIT,
            Some(ancestor_id),
            ancestor.context.clone(),
            block,
            &self.machine.layout,
        ));
        if let Err(error) = self.spaces.install(id, space.clone()) {
            self.spaces.abandon(id);
            self.machine.mmu.destroy_space(&block);
            self.release_space(ancestor_id);
            return Err(error);
        }
        log_info!(target: "as", "space {} inherits {}", id.to_raw(), ancestor_id.to_raw());
        Ok((id, space))
    }

    fn create_root(&self) -> VmResult<(SpaceId, Arc<AddressSpace>)> {
        let id = self.spaces.reserve()?;
        let kernel = self.kernel.platform();
        let mut block = kernel;
        if let Err(error) = self.machine.mmu.clone_space(&kernel, &mut block, false) {
            self.spaces.abandon(id);
            return Err(error);
        }
        let layout = &self.machine.layout;
        let context = Arc::new(AddressSpaceContext::new(layout.user_heap, layout.granularity));
        let space = Arc::new(AddressSpace::new(
            id,
            SpaceFlags::APPLICATION,
            None,
            Some(context),
            block,
            layout,
        ));
        if let Err(error) = self.spaces.install(id, space.clone()) {
            self.spaces.abandon(id);
            self.machine.mmu.destroy_space(&block);
            return Err(error);
        }
        log_info!(target: "as", "space {} created root=0x{:x}", id.to_raw(), block.root());
        Ok((id, space))
    }

    /// Drops one handle reference; the space is deleted with the last one.
    pub fn destroy_address_space(&self, id: SpaceId) -> VmResult<()> {
        if id == self.kernel.id {
            return Err(VmError::Permissions);
        }
        if let Some(space) = self.spaces.release(id)? {
            self.delete_space(&space);
        }
        Ok(())
    }

    fn release_space(&self, id: SpaceId) {
        if let Err(error) = self.destroy_address_space(id) {
            log_warn!(target: "as", "release of space {} failed: {}", id.to_raw(), error);
        }
    }

    fn delete_space(&self, space: &AddressSpace) {
        let block = space.platform();
        if let Some(context) = space.context.as_ref().filter(|_| space.owns_context()) {
            let teardown = context.teardown();
            for (base, length) in teardown.freed {
                self.clear_range(&block, base, length);
            }
            self.retire_sources(teardown.released_sources);
        }
        if space.is_application() {
            space.thread_local().clear();
            self.machine.mmu.destroy_space(&block);
        }
        if let Some(parent) = space.parent {
            self.release_space(parent);
        }
        log_debug!(target: "as", "space {} deleted", space.id.to_raw());
    }
}
