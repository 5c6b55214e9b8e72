// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Allocation ledger shared by every address space descended from one root
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpaceContext{create,allocate_tracked,lookup,acquire,link,reduce_or_free,teardown}
//! DEPENDS_ON: mm::pool::DynamicPool, types::{SpaceId, ShmId}
//! INVARIANTS: Live ranges never overlap; references >= 1 while linked; clone links never own
//!
//! Allocations live in a generation-checked arena so a [`CloneLink`] that outlives its source
//! resolves to nothing instead of a recycled slot. Reference counts change only under the
//! context lock; clone-chain propagation runs after that lock is dropped.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
#[cfg(feature = "failpoints")]
use core::sync::atomic::AtomicBool;

use super::flags::MappingFlags;
use super::pool::DynamicPool;
use crate::config::Region;
use crate::error::{Progress, VmError, VmResult};
use crate::types::{page_align_up, page_offset, ShmId, SpaceId, VirtAddr, PAGE_SIZE};

/// Stable, generation-checked reference to an allocation slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocId {
    index: u32,
    generation: u32,
}

/// Non-owning reference from a cloned allocation to the allocation it was cloned from.
#[derive(Clone, Debug)]
pub struct CloneLink {
    pub context: Weak<AddressSpaceContext>,
    pub id: AllocId,
    /// Space that owned the source when the link was made.
    pub owner: SpaceId,
}

/// One tracked virtual-region reservation.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub id: AllocId,
    pub owner: SpaceId,
    pub shm_tag: Option<ShmId>,
    pub base: VirtAddr,
    pub length: usize,
    pub flags: MappingFlags,
    pub references: u32,
    pub clone_of: Option<CloneLink>,
}

impl Allocation {
    pub fn end(&self) -> VirtAddr {
        self.base + self.length
    }

    pub fn contains(&self, address: VirtAddr) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Source allocation destroyed while propagating a release up a clone chain.
#[derive(Clone, Debug)]
pub struct ReleasedSource {
    pub context: Arc<AddressSpaceContext>,
    pub owner: SpaceId,
    pub base: VirtAddr,
    pub length: usize,
    pub flags: MappingFlags,
}

/// Result of [`AddressSpaceContext::reduce_or_free`].
#[derive(Debug)]
pub struct ReleaseOutcome {
    pub progress: Progress,
    /// Base of the allocation the request resolved to.
    pub base: VirtAddr,
    /// Length still tracked after the call; `0` once the allocation is gone.
    pub remaining: usize,
    /// Range whose pages the caller should clear; empty while references remain.
    pub freed_base: VirtAddr,
    pub freed: usize,
    pub flags: MappingFlags,
    pub released_sources: Vec<ReleasedSource>,
}

/// Everything [`AddressSpaceContext::teardown`] released.
#[derive(Debug, Default)]
pub struct Teardown {
    /// `(base, length)` of every force-freed allocation.
    pub freed: Vec<(VirtAddr, usize)>,
    pub released_sources: Vec<ReleasedSource>,
}

enum Release {
    /// Drop the tail, keeping `keep` bytes at the base.
    Shrink { keep: usize },
    Full,
}

/// Decides whether a request is a tail shrink or covers the whole allocation.
fn classify(allocation: &Allocation, address: VirtAddr, length: usize) -> Release {
    let (mut start, mut length) = (address, length);
    // The address handed out for a stack sits one guard page above the base.
    if allocation.flags.contains(MappingFlags::GUARDPAGE) && address == allocation.base + PAGE_SIZE {
        start = allocation.base;
        length = length.saturating_add(PAGE_SIZE);
    }
    if start == allocation.base {
        if length < allocation.length {
            let keep = allocation.length.saturating_sub(page_align_up(length));
            return Release::Shrink { keep };
        }
        return Release::Full;
    }
    if page_offset(start) == 0 && start.saturating_add(length) >= allocation.end() {
        return Release::Shrink { keep: start - allocation.base };
    }
    Release::Full
}

struct Slot {
    generation: u32,
    allocation: Option<Allocation>,
}

struct LedgerState {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_base: BTreeMap<VirtAddr, usize>,
    heap: DynamicPool,
}

impl LedgerState {
    fn containing(&self, address: VirtAddr) -> Option<usize> {
        let (_, &index) = self.by_base.range(..=address).next_back()?;
        let allocation = self.slots.get(index)?.allocation.as_ref()?;
        allocation.contains(address).then_some(index)
    }

    fn resolve(&mut self, id: AllocId) -> Option<&mut Allocation> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.allocation.as_mut()
    }

    fn overlaps(&self, base: VirtAddr, length: usize) -> bool {
        let end = base + length;
        self.by_base.range(..end).next_back().is_some_and(|(_, &index)| {
            self.slots[index].allocation.as_ref().is_some_and(|existing| existing.end() > base)
        })
    }

    fn insert(&mut self, mut allocation: Allocation) -> VmResult<AllocId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.try_reserve(1).map_err(|_| VmError::OutOfMemory)?;
                self.slots.push(Slot { generation: 0, allocation: None });
                self.slots.len() - 1
            }
        };
        let id = AllocId { index: index as u32, generation: self.slots[index].generation };
        allocation.id = id;
        self.by_base.insert(allocation.base, index);
        self.slots[index].allocation = Some(allocation);
        Ok(id)
    }

    fn remove(&mut self, index: usize) -> Option<Allocation> {
        let slot = self.slots.get_mut(index)?;
        let allocation = slot.allocation.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.by_base.remove(&allocation.base);
        self.free.push(index);
        Some(allocation)
    }
}

/// Allocation tracking and process heap shared by a root space and the spaces inheriting it.
pub struct AddressSpaceContext {
    state: spin::Mutex<LedgerState>,
    signal_handler: AtomicUsize,
    #[cfg(feature = "failpoints")]
    deny_next_registration: AtomicBool,
}

impl core::fmt::Debug for AddressSpaceContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpaceContext").field("allocations", &self.len()).finish()
    }
}

impl AddressSpaceContext {
    pub fn new(heap: Region, granularity: usize) -> Self {
        Self {
            state: spin::Mutex::new(LedgerState {
                slots: Vec::new(),
                free: Vec::new(),
                by_base: BTreeMap::new(),
                heap: DynamicPool::new(heap, granularity),
            }),
            signal_handler: AtomicUsize::new(0),
            #[cfg(feature = "failpoints")]
            deny_next_registration: AtomicBool::new(false),
        }
    }

    /// Test hook: the next registration fails as if allocation storage ran out.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_registration(&self) {
        self.deny_next_registration.store(true, Ordering::SeqCst);
    }

    fn registration_denied(&self) -> bool {
        #[cfg(feature = "failpoints")]
        if self.deny_next_registration.swap(false, Ordering::SeqCst) {
            return true;
        }
        false
    }

    /// Registers `[base, base + length)` with one reference; the length is rounded to pages.
    pub fn create(
        &self,
        owner: SpaceId,
        base: VirtAddr,
        length: usize,
        flags: MappingFlags,
        shm_tag: Option<ShmId>,
    ) -> VmResult<AllocId> {
        if base == 0 || length == 0 || page_offset(base) != 0 {
            return Err(VmError::InvalidParams);
        }
        let length = base
            .checked_add(length)
            .map(|_| page_align_up(length))
            .ok_or(VmError::InvalidParams)?;
        if self.registration_denied() {
            return Err(VmError::OutOfMemory);
        }
        let mut state = self.state.lock();
        if state.overlaps(base, length) {
            return Err(VmError::InvalidParams);
        }
        state.insert(Self::fresh(owner, base, length, flags, shm_tag))
    }

    /// Draws a range from the heap and registers it under one lock hold.
    ///
    /// Registration failure hands the range back to the heap and reports out-of-memory.
    pub fn allocate_tracked(
        &self,
        owner: SpaceId,
        length: usize,
        flags: MappingFlags,
        shm_tag: Option<ShmId>,
    ) -> VmResult<(VirtAddr, AllocId)> {
        let denied = self.registration_denied();
        let mut state = self.state.lock();
        let base = state.heap.allocate(length).ok_or(VmError::OutOfMemory)?;
        let length = page_align_up(length);
        let registered = if denied {
            Err(VmError::OutOfMemory)
        } else {
            state.insert(Self::fresh(owner, base, length, flags, shm_tag))
        };
        match registered {
            Ok(id) => Ok((base, id)),
            Err(_) => {
                state.heap.free(base);
                log_warn!(target: "mm", "allocation registration failed base=0x{:x}", base);
                Err(VmError::OutOfMemory)
            }
        }
    }

    fn fresh(
        owner: SpaceId,
        base: VirtAddr,
        length: usize,
        flags: MappingFlags,
        shm_tag: Option<ShmId>,
    ) -> Allocation {
        Allocation {
            id: AllocId { index: 0, generation: 0 },
            owner,
            shm_tag,
            base,
            length,
            flags,
            references: 1,
            clone_of: None,
        }
    }

    /// Returns the allocation containing `address`.
    pub fn lookup(&self, address: VirtAddr) -> Option<Allocation> {
        let state = self.state.lock();
        let index = state.containing(address)?;
        state.slots[index].allocation.clone()
    }

    /// Like [`Self::lookup`], adding a reference in the same lock hold.
    pub fn acquire(&self, address: VirtAddr) -> Option<Allocation> {
        let mut state = self.state.lock();
        let index = state.containing(address)?;
        let allocation = state.slots[index].allocation.as_mut()?;
        allocation.references = allocation.references.checked_add(1)?;
        Some(allocation.clone())
    }

    /// Records that the allocation at `address` was cloned from `target`.
    pub fn link(&self, address: VirtAddr, target: CloneLink) -> VmResult<()> {
        if address == 0 {
            return Err(VmError::InvalidParams);
        }
        let mut state = self.state.lock();
        let index = state.containing(address).ok_or(VmError::NotFound)?;
        let allocation = state.slots[index].allocation.as_mut().ok_or(VmError::NotFound)?;
        allocation.clone_of = Some(target);
        Ok(())
    }

    /// Drops one reference on the allocation containing `address` and frees or shrinks it.
    ///
    /// A tail shrink needs the sole reference, otherwise `Permissions` and nothing changes.
    /// While references remain the outcome is `Incomplete`, normalized to the full bounds.
    /// A full free releases one reference of the clone source, recursively.
    pub fn reduce_or_free(&self, address: VirtAddr, length: usize) -> VmResult<ReleaseOutcome> {
        if address == 0 || length == 0 {
            return Err(VmError::InvalidParams);
        }
        let (mut outcome, link) = {
            let mut state = self.state.lock();
            let index = state.containing(address).ok_or(VmError::NotFound)?;
            let allocation = state.slots[index].allocation.as_mut().ok_or(VmError::NotFound)?;
            let release = classify(allocation, address, length);
            if matches!(release, Release::Shrink { .. }) && allocation.references > 1 {
                log_debug!(
                    target: "mm",
                    "partial release refused base=0x{:x} refs={}",
                    allocation.base,
                    allocation.references
                );
                return Err(VmError::Permissions);
            }
            allocation.references -= 1;
            if allocation.references > 0 {
                return Ok(ReleaseOutcome {
                    progress: Progress::Incomplete,
                    base: allocation.base,
                    remaining: allocation.length,
                    freed_base: allocation.base,
                    freed: 0,
                    flags: allocation.flags,
                    released_sources: Vec::new(),
                });
            }
            match release {
                Release::Shrink { keep } if keep > 0 => {
                    let freed = allocation.length - keep;
                    allocation.length = keep;
                    allocation.references = 1;
                    let outcome = ReleaseOutcome {
                        progress: Progress::Complete,
                        base: allocation.base,
                        remaining: keep,
                        freed_base: allocation.base + keep,
                        freed,
                        flags: allocation.flags,
                        released_sources: Vec::new(),
                    };
                    (outcome, None)
                }
                _ => {
                    let removed = state.remove(index).ok_or(VmError::NotFound)?;
                    let outcome = ReleaseOutcome {
                        progress: Progress::Complete,
                        base: removed.base,
                        remaining: 0,
                        freed_base: removed.base,
                        freed: removed.length,
                        flags: removed.flags,
                        released_sources: Vec::new(),
                    };
                    (outcome, removed.clone_of)
                }
            }
        };
        Self::propagate(link, &mut outcome.released_sources);
        Ok(outcome)
    }

    /// Walks a clone chain, releasing one reference per hop until a source survives.
    fn propagate(mut link: Option<CloneLink>, released: &mut Vec<ReleasedSource>) {
        while let Some(current) = link.take() {
            let Some(context) = current.context.upgrade() else {
                log_warn!(target: "mm", "clone source context already destroyed");
                return;
            };
            let mut state = context.state.lock();
            let Some(source) = state.resolve(current.id) else {
                log_warn!(target: "mm", "clone source allocation already released");
                return;
            };
            if source.owner != current.owner {
                log_warn!(
                    target: "mm",
                    "dangerous cross-space free base=0x{:x} owner={} recorded={}",
                    source.base,
                    source.owner.to_raw(),
                    current.owner.to_raw()
                );
            }
            source.references -= 1;
            if source.references > 0 {
                return;
            }
            let index = current.id.index as usize;
            let Some(removed) = state.remove(index) else {
                return;
            };
            drop(state);
            link = removed.clone_of;
            released.push(ReleasedSource {
                context: context.clone(),
                owner: removed.owner,
                base: removed.base,
                length: removed.length,
                flags: removed.flags,
            });
        }
    }

    /// Removes the record at `base` without propagation and returns its range to the heap.
    ///
    /// Used to unwind a mapping that failed before anything else could reference it.
    pub fn discard(&self, base: VirtAddr) {
        let mut state = self.state.lock();
        if let Some(index) = state.containing(base) {
            state.remove(index);
        }
        state.heap.free(base);
    }

    pub fn heap_free(&self, address: VirtAddr) -> Option<usize> {
        self.state.lock().heap.free(address)
    }

    pub fn heap_shrink(&self, address: VirtAddr, keep: usize) -> bool {
        self.state.lock().heap.shrink(address, keep)
    }

    pub fn heap_contains(&self, address: VirtAddr) -> bool {
        self.state.lock().heap.contains(address)
    }

    /// Force-frees every allocation and resets the heap.
    pub fn teardown(&self) -> Teardown {
        let (freed, links) = {
            let mut state = self.state.lock();
            let mut freed = Vec::new();
            let mut links = Vec::new();
            for slot in state.slots.iter_mut() {
                let Some(allocation) = slot.allocation.take() else {
                    continue;
                };
                slot.generation = slot.generation.wrapping_add(1);
                freed.push((allocation.base, allocation.length));
                links.extend(allocation.clone_of);
            }
            let slots = state.slots.len();
            state.free = (0..slots).rev().collect();
            state.by_base.clear();
            state.heap.clear();
            (freed, links)
        };
        let mut released_sources = Vec::new();
        for link in links {
            Self::propagate(Some(link), &mut released_sources);
        }
        Teardown { freed, released_sources }
    }

    pub fn set_signal_handler(&self, handler: VirtAddr) {
        self.signal_handler.store(handler, Ordering::Release);
    }

    pub fn signal_handler(&self) -> Option<VirtAddr> {
        match self.signal_handler.load(Ordering::Acquire) {
            0 => None,
            handler => Some(handler),
        }
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.state.lock().by_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
