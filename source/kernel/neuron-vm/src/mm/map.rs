// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping engine (map, commit, unmap, clone, protection changes, queries)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vmm::{map,commit,unmap,clone_mapping,change_protection,query,get_mapping,get_attributes}
//! DEPENDS_ON: mm::ledger, mm::pool, hal::{Mmu, FrameAllocator}, mm::sync
//! INVARIANTS: A failed request leaves no virtual range, frame or page-table entry behind
//!
//! Each request moves through placement, virtual reservation and then either commit or
//! reserve-only. Scope guards own the intermediate resources so every early return
//! unwinds exactly what was acquired so far.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::address_space::AddressSpace;
use super::flags::{MapOptions, MappingFlags, PhysicalPlacement, VirtualPlacement};
use super::ledger::{AddressSpaceContext, Allocation, CloneLink, ReleasedSource};
use crate::error::{Progress, VmError, VmResult};
use crate::hal::{FrameAllocator, PlatformBlock};
use crate::types::{page_align_down, page_count, page_offset, span_pages, PhysAddr, ShmId, VirtAddr, PAGE_SIZE};
use crate::vmm::Vmm;

/// What [`Vmm::query`] reports about the allocation covering an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub base: VirtAddr,
    /// `0` when the allocation is live but the queried page is gone.
    pub length: usize,
    pub flags: MappingFlags,
    pub shm_tag: Option<ShmId>,
}

/// Result of [`Vmm::change_protection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectionChange {
    pub previous: MappingFlags,
    pub progress: Progress,
}

enum Reservation {
    Heap(Arc<AddressSpaceContext>),
    Thread,
    Global,
    /// Caller-owned range; nothing to hand back.
    Fixed,
}

/// Returns a reserved virtual range (and its ledger record) on drop unless disarmed.
struct VirtualGuard<'a> {
    vmm: &'a Vmm,
    space: &'a AddressSpace,
    pool_base: VirtAddr,
    reservation: Reservation,
    armed: bool,
}

impl VirtualGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }

    fn tracked(&self) -> Option<&Arc<AddressSpaceContext>> {
        match &self.reservation {
            Reservation::Heap(context) => Some(context),
            _ => None,
        }
    }
}

impl Drop for VirtualGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match &self.reservation {
            Reservation::Heap(context) => context.discard(self.pool_base),
            Reservation::Thread => {
                self.space.thread_local().free(self.pool_base);
            }
            Reservation::Global => {
                self.vmm.global.lock().free(self.pool_base);
            }
            Reservation::Fixed => {}
        }
    }
}

/// Returns freshly allocated frames on drop unless disarmed.
struct FrameGuard<'a> {
    frames: &'a dyn FrameAllocator,
    pages: &'a [PhysAddr],
    armed: bool,
}

impl FrameGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.frames.free(self.pages);
        }
    }
}

struct VirtualRange<'a> {
    guard: VirtualGuard<'a>,
    /// First page that gets an entry (past the guard page for stacks).
    base: VirtAddr,
    count: usize,
}

impl Vmm {
    /// Maps a virtual region and returns its address; stacks return their top.
    pub fn map(&self, space: &AddressSpace, options: MapOptions<'_>) -> VmResult<VirtAddr> {
        let MapOptions {
            length,
            flags,
            mask,
            shm_tag,
            virtual_placement,
            physical_placement,
            mut pages,
        } = options;
        if length == 0 || span_pages(0, length).is_none() {
            return Err(VmError::InvalidParams);
        }

        if let VirtualPlacement::Fixed(address) = virtual_placement {
            if let Some(existing) = space.context().and_then(|context| context.lookup(address)) {
                if !flags.contains(MappingFlags::COMMIT) {
                    return Err(VmError::NotSupported);
                }
                let count = page_count(length);
                self.back_pages(space, existing.base, count, flags, mask, physical_placement, pages.as_deref_mut())?;
                return Ok(existing.base);
            }
        }

        let range = self.reserve_virtual(space, virtual_placement, length, flags, shm_tag)?;
        let block = space.platform();
        let output = if flags.contains(MappingFlags::GUARDPAGE) {
            range.base + range.count * PAGE_SIZE
        } else {
            range.base
        };

        if !flags.contains(MappingFlags::COMMIT) {
            if let Err(fault) = self.machine.mmu.reserve_pages(&block, range.base, range.count, flags) {
                let _ = self.machine.mmu.clear_pages(&block, range.base, fault.completed);
                return Err(fault.error);
            }
            range.guard.disarm();
            return Ok(output);
        }

        self.back_pages(space, range.base, range.count, flags, mask, physical_placement, pages.as_deref_mut())?;
        range.guard.disarm();
        log_trace!(target: "mm", "mapped 0x{:x} pages={}", range.base, range.count);
        Ok(output)
    }

    /// Resolves a placement into a reserved virtual range guarded for rollback.
    fn reserve_virtual<'a>(
        &'a self,
        space: &'a AddressSpace,
        placement: VirtualPlacement,
        length: usize,
        flags: MappingFlags,
        shm_tag: Option<ShmId>,
    ) -> VmResult<VirtualRange<'a>> {
        let stack = flags.contains(MappingFlags::GUARDPAGE);
        let (request, shift, count) = match placement {
            VirtualPlacement::Fixed(_) if stack => {
                // The caller's range already includes the guard page.
                if length <= PAGE_SIZE {
                    return Err(VmError::InvalidParams);
                }
                (length, PAGE_SIZE, page_count(length) - 1)
            }
            _ if stack => (length.checked_add(PAGE_SIZE).ok_or(VmError::InvalidParams)?, PAGE_SIZE, page_count(length)),
            _ => (length, 0, page_count(length)),
        };
        let (pool_base, reservation) = match placement {
            VirtualPlacement::Fixed(0) => return Err(VmError::InvalidParams),
            VirtualPlacement::Fixed(address) => (page_align_down(address), Reservation::Fixed),
            VirtualPlacement::Process => {
                let context = space.context().ok_or(VmError::InvalidParams)?;
                let (base, _) = context.allocate_tracked(space.id(), request, flags, shm_tag)?;
                (base, Reservation::Heap(context.clone()))
            }
            VirtualPlacement::Thread => {
                if !space.is_application() {
                    return Err(VmError::InvalidParams);
                }
                let base = space.thread_local().allocate(request).ok_or(VmError::OutOfMemory)?;
                (base, Reservation::Thread)
            }
            VirtualPlacement::Global => {
                let base = self.global.lock().allocate(request).ok_or(VmError::OutOfMemory)?;
                (base, Reservation::Global)
            }
        };
        let guard = VirtualGuard { vmm: self, space, pool_base, reservation, armed: true };
        Ok(VirtualRange { guard, base: pool_base + shift, count })
    }

    /// Commits physical pages at `base`; rolls back entries and fresh frames on failure.
    #[allow(clippy::too_many_arguments)]
    fn back_pages(
        &self,
        space: &AddressSpace,
        base: VirtAddr,
        count: usize,
        flags: MappingFlags,
        mask: usize,
        placement: PhysicalPlacement,
        pages: Option<&mut [PhysAddr]>,
    ) -> VmResult<()> {
        let mmu = &self.machine.mmu;
        let block = space.platform();
        let committed = flags | MappingFlags::COMMIT;

        if let PhysicalPlacement::Contiguous(physical) = placement {
            if let Err(fault) = mmu.set_contiguous_pages(&block, base, physical, count, committed) {
                let _ = mmu.clear_pages(&block, base, fault.completed);
                return Err(fault.error);
            }
            if let Some(pages) = pages {
                for (index, slot) in pages.iter_mut().take(count).enumerate() {
                    *slot = page_align_down(physical) + index * PAGE_SIZE;
                }
            }
            if flags.contains(MappingFlags::CLEAN) {
                if let Err(error) = mmu.zero_pages(&block, base, count) {
                    let _ = mmu.clear_pages(&block, base, count);
                    return Err(error);
                }
            }
            return Ok(());
        }

        let mut scratch = Vec::new();
        let pages: &mut [PhysAddr] = match pages {
            Some(pages) if pages.len() >= count => &mut pages[..count],
            Some(_) => return Err(VmError::InvalidParams),
            None if placement == PhysicalPlacement::Fixed => return Err(VmError::InvalidParams),
            None => {
                scratch.try_reserve_exact(count).map_err(|_| VmError::OutOfMemory)?;
                scratch.resize(count, 0);
                &mut scratch[..]
            }
        };
        let fresh = placement == PhysicalPlacement::Allocate;
        if fresh {
            self.machine.frames.allocate(mask, pages)?;
        }
        let frames = FrameGuard { frames: self.machine.frames.as_ref(), pages, armed: fresh };
        if let Err(fault) = mmu.set_pages(&block, base, frames.pages, committed) {
            let _ = mmu.clear_pages(&block, base, fault.completed);
            return Err(fault.error);
        }
        if flags.contains(MappingFlags::CLEAN) {
            if let Err(error) = mmu.zero_pages(&block, base, count) {
                let _ = mmu.clear_pages(&block, base, count);
                return Err(error);
            }
        }
        frames.disarm();
        Ok(())
    }

    /// Backs an already-reserved region; fresh frames are returned if the MMU refuses them.
    pub fn commit(
        &self,
        space: &AddressSpace,
        address: VirtAddr,
        pages: &mut [PhysAddr],
        size: usize,
        mask: usize,
        placement: PhysicalPlacement,
    ) -> VmResult<()> {
        if address == 0 || size == 0 {
            return Err(VmError::InvalidParams);
        }
        let count = span_pages(address, size).ok_or(VmError::InvalidParams)?;
        let pages = pages.get_mut(..count).ok_or(VmError::InvalidParams)?;
        match placement {
            PhysicalPlacement::Allocate => self.machine.frames.allocate(mask, pages)?,
            PhysicalPlacement::Contiguous(physical) => {
                for (index, slot) in pages.iter_mut().enumerate() {
                    *slot = page_align_down(physical) + index * PAGE_SIZE;
                }
            }
            PhysicalPlacement::Fixed => {}
        }
        let start = page_align_down(address);
        self.commit_entries(space, start, pages, placement == PhysicalPlacement::Allocate)
    }

    /// Commits `pages` into reserved entries starting at `start`.
    pub(crate) fn commit_entries(
        &self,
        space: &AddressSpace,
        start: VirtAddr,
        pages: &[PhysAddr],
        fresh: bool,
    ) -> VmResult<()> {
        let mmu = &self.machine.mmu;
        let block = space.platform();
        let mut attributes = [MappingFlags::empty()];
        mmu.page_attributes(&block, start, &mut attributes)?;
        if let Err(fault) = mmu.commit_pages(&block, start, pages) {
            log_error!(
                target: "mm",
                "commit failed at 0x{:x} after {} pages: {}",
                start,
                fault.completed,
                fault.error
            );
            if fault.completed > 0 {
                // Put the committed prefix back into its reserved state.
                let reserved = attributes[0] - (MappingFlags::MAPPED | MappingFlags::COMMIT);
                let _ = mmu.clear_pages(&block, start, fault.completed);
                let _ = mmu.reserve_pages(&block, start, fault.completed, reserved);
            }
            if fresh {
                self.machine.frames.free(pages);
            }
            return Err(fault.error);
        }
        Ok(())
    }

    /// Maps the physical backing of `source_address` into `destination`.
    ///
    /// Every source page must already be committed. The destination is linked to the
    /// source allocation so releasing the clone also drops the source reference it holds.
    pub fn clone_mapping(
        &self,
        source: &AddressSpace,
        destination: &AddressSpace,
        source_address: VirtAddr,
        placement: VirtualPlacement,
        length: usize,
        flags: MappingFlags,
    ) -> VmResult<VirtAddr> {
        if source_address == 0 || length == 0 {
            return Err(VmError::InvalidParams);
        }
        let count = span_pages(source_address, length).ok_or(VmError::InvalidParams)?;
        let acquired = source
            .context()
            .and_then(|context| context.acquire(source_address).map(|held| (context.clone(), held)));

        let mut pages = Vec::new();
        let translated = pages
            .try_reserve_exact(count)
            .map_err(|_| VmError::OutOfMemory)
            .and_then(|()| {
                pages.resize(count, 0);
                self.machine.mmu.virtual_to_physical(
                    &source.platform(),
                    page_align_down(source_address),
                    &mut pages,
                )
            });
        let verified = match translated {
            Ok(retrieved) if retrieved == count && pages.iter().all(|&page| page != 0) => Ok(()),
            Ok(_) => Err(VmError::NotSupported),
            Err(error) => Err(error),
        };
        let range = match verified.and_then(|()| {
            self.reserve_virtual(destination, placement, count * PAGE_SIZE, flags, None)
        }) {
            Ok(range) => range,
            Err(error) => {
                self.drop_reference(acquired);
                return Err(error);
            }
        };

        let mut linked = false;
        if let (Some((context, held)), Some(target)) = (&acquired, range.guard.tracked()) {
            let link = CloneLink { context: Arc::downgrade(context), id: held.id, owner: source.id() };
            linked = target.link(range.base, link).is_ok();
        }

        let block = destination.platform();
        let committed = flags | MappingFlags::PERSISTENT | MappingFlags::COMMIT;
        if let Err(fault) = self.machine.mmu.set_pages(&block, range.base, &pages, committed) {
            let _ = self.machine.mmu.clear_pages(&block, range.base, fault.completed);
            match range.guard.tracked().filter(|_| linked) {
                Some(target) => {
                    if let Ok(outcome) = target.reduce_or_free(range.base, count * PAGE_SIZE) {
                        self.retire_sources(outcome.released_sources);
                    }
                }
                None => self.drop_reference(acquired),
            }
            return Err(fault.error);
        }
        range.guard.disarm();
        Ok(range.base + page_offset(source_address))
    }

    /// Gives back a reference taken with `acquire`.
    fn drop_reference(&self, acquired: Option<(Arc<AddressSpaceContext>, Allocation)>) {
        let Some((context, held)) = acquired else {
            return;
        };
        match context.reduce_or_free(held.base, held.length) {
            Ok(outcome) if outcome.progress.is_complete() && outcome.remaining == 0 => {
                let mut released = outcome.released_sources;
                released.push(ReleasedSource {
                    context: context.clone(),
                    owner: held.owner,
                    base: outcome.base,
                    length: outcome.freed,
                    flags: outcome.flags,
                });
                self.retire_sources(released);
            }
            Ok(_) => {}
            Err(error) => log_warn!(target: "mm", "source reference release failed: {}", error),
        }
    }

    /// Releases a mapping; `Incomplete` while other references keep the range alive.
    pub fn unmap(&self, space: &AddressSpace, address: VirtAddr, length: usize) -> VmResult<Progress> {
        if address == 0 || length == 0 {
            return Err(VmError::InvalidParams);
        }
        if let Some(context) = space.context().filter(|context| context.lookup(address).is_some()) {
            let outcome = context.reduce_or_free(address, length)?;
            if !outcome.progress.is_complete() {
                return Ok(Progress::Incomplete);
            }
            if outcome.freed > 0 {
                self.clear_and_sync(space, outcome.freed_base, outcome.freed);
            }
            self.retire_sources(outcome.released_sources);
            self.release_virtual(space, outcome.base, outcome.remaining);
            return Ok(Progress::Complete);
        }
        let start = page_align_down(address);
        let count = span_pages(address, length).ok_or(VmError::InvalidParams)?;
        self.clear_and_sync(space, start, count * PAGE_SIZE);
        self.release_virtual(space, start, 0);
        Ok(Progress::Complete)
    }

    /// Hands a virtual range back to whichever pool contains it, keeping `keep` bytes.
    fn release_virtual(&self, space: &AddressSpace, base: VirtAddr, keep: usize) {
        if let Some(context) = space.context().filter(|context| context.heap_contains(base)) {
            context.heap_shrink(base, keep);
            return;
        }
        {
            let mut global = self.global.lock();
            if global.contains(base) {
                global.shrink(base, keep);
                return;
            }
        }
        let mut thread_local = space.thread_local();
        if thread_local.contains(base) {
            thread_local.shrink(base, keep);
        }
    }

    /// Clears entries, frees what the MMU hands back and returns the number cleared.
    pub(crate) fn clear_range(&self, block: &PlatformBlock, base: VirtAddr, length: usize) -> usize {
        let cleared = self.machine.mmu.clear_pages(block, base, page_count(length));
        if !cleared.freeable.is_empty() {
            self.machine.frames.free(&cleared.freeable);
        }
        cleared.cleared
    }

    pub(crate) fn clear_and_sync(&self, space: &AddressSpace, base: VirtAddr, length: usize) {
        if self.clear_range(&space.platform(), base, length) > 0 {
            let _ = self.sync_mapping_change(space, base, length);
        }
    }

    /// Clears and returns the ranges of clone sources destroyed by propagation.
    pub(crate) fn retire_sources(&self, sources: Vec<ReleasedSource>) {
        for source in sources {
            match self.spaces.lookup(source.owner) {
                Some(owner) => self.clear_and_sync(&owner, source.base, source.length),
                None => log_warn!(
                    target: "mm",
                    "released source 0x{:x} has no owner space {}",
                    source.base,
                    source.owner.to_raw()
                ),
            }
            source.context.heap_free(source.base);
        }
    }

    /// Rewrites page attributes and synchronizes the other cores.
    pub fn change_protection(
        &self,
        space: &AddressSpace,
        address: VirtAddr,
        length: usize,
        flags: MappingFlags,
    ) -> VmResult<ProtectionChange> {
        if address == 0 || length == 0 {
            return Err(VmError::InvalidParams);
        }
        let start = page_align_down(address);
        let count = span_pages(address, length).ok_or(VmError::InvalidParams)?;
        let update = match self.machine.mmu.update_page_attributes(&space.platform(), start, count, flags) {
            Ok(update) => update,
            Err(fault) => {
                if fault.completed > 0 {
                    let _ = self.sync_mapping_change(space, start, fault.completed * PAGE_SIZE);
                }
                return Err(fault.error);
            }
        };
        let _ = self.sync_mapping_change(space, start, update.updated * PAGE_SIZE);
        let progress = if update.updated < count { Progress::Incomplete } else { Progress::Complete };
        Ok(ProtectionChange { previous: update.previous, progress })
    }

    /// Describes the tracked allocation covering `address`.
    pub fn query(&self, space: &AddressSpace, address: VirtAddr) -> VmResult<MemoryDescriptor> {
        let context = space.context().ok_or(VmError::NotFound)?;
        let allocation = context.lookup(address).ok_or(VmError::NotFound)?;
        let (mut base, mut length) = (allocation.base, allocation.length);
        if allocation.flags.contains(MappingFlags::GUARDPAGE) {
            base += PAGE_SIZE;
            length = length.saturating_sub(PAGE_SIZE);
        }
        let mut attributes = [MappingFlags::empty()];
        self.machine.mmu.page_attributes(&space.platform(), page_align_down(address), &mut attributes)?;
        if !attributes[0].contains(MappingFlags::MAPPED) {
            length = 0;
        }
        Ok(MemoryDescriptor { base, length, flags: allocation.flags, shm_tag: allocation.shm_tag })
    }

    /// Raw physical translation of `count` pages starting at `address`.
    pub fn get_mapping(&self, space: &AddressSpace, address: VirtAddr, count: usize) -> VmResult<Vec<PhysAddr>> {
        if count == 0 {
            return Err(VmError::InvalidParams);
        }
        let mut pages = vec![0; count];
        let retrieved = self.machine.mmu.virtual_to_physical(&space.platform(), address, &mut pages)?;
        pages.truncate(retrieved);
        Ok(pages)
    }

    /// Per-page attributes of `[address, address + length)`.
    pub fn get_attributes(
        &self,
        space: &AddressSpace,
        address: VirtAddr,
        length: usize,
    ) -> VmResult<Vec<MappingFlags>> {
        if length == 0 {
            return Err(VmError::InvalidParams);
        }
        let count = span_pages(address, length).ok_or(VmError::InvalidParams)?;
        let mut attributes = vec![MappingFlags::empty(); count];
        let retrieved = self.machine.mmu.page_attributes(
            &space.platform(),
            page_align_down(address),
            &mut attributes,
        )?;
        attributes.truncate(retrieved);
        Ok(attributes)
    }

    pub fn is_page_dirty(&self, space: &AddressSpace, address: VirtAddr) -> VmResult<bool> {
        let attributes = self.page_flags(space, address)?;
        Ok(attributes.contains(MappingFlags::ISDIRTY))
    }

    pub fn is_page_present(&self, space: &AddressSpace, address: VirtAddr) -> VmResult<bool> {
        let attributes = self.page_flags(space, address)?;
        Ok(attributes.contains(MappingFlags::COMMIT))
    }

    fn page_flags(&self, space: &AddressSpace, address: VirtAddr) -> VmResult<MappingFlags> {
        let mut attributes = [MappingFlags::empty()];
        self.machine.mmu.page_attributes(&space.platform(), page_align_down(address), &mut attributes)?;
        if !attributes[0].contains(MappingFlags::MAPPED) {
            return Err(VmError::NotFound);
        }
        Ok(attributes[0])
    }
}
