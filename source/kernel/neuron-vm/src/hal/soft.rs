// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-side software HAL (page tables, frame allocator, core mesh)
//! OWNERS: @kernel-mm-team
//! STATUS: Test support
//! PUBLIC API: SoftMemory, SoftMmu, SoftFrames, SoftMesh, SoftHal
//! DEPENDS_ON: hal::{Mmu, FrameAllocator, CoreMesh}
//! INVARIANTS: Entries with physical 0 are reserved-only; the global region has one shared table

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::{
    AttributeUpdate, ClearedPages, CoreMesh, CoreMessage, CoreView, FrameAllocator, Mmu, MmuFault,
    PlatformBlock, Tlb,
};
use crate::config::{MachineLayout, Region};
use crate::error::{VmError, VmResult};
use crate::mm::flags::MappingFlags;
use crate::types::{page_align_down, page_offset, PhysAddr, SpaceId, VirtAddr, PAGE_SIZE};
use crate::vmm::Machine;

/// Byte pattern written into freshly allocated frames.
pub const POISON: u8 = 0xA5;

const KERNEL_ROOT: usize = 1;
const NO_FAULT: usize = usize::MAX;

/// Simulated physical memory; pages materialize on first write and read as zero before that.
#[derive(Default)]
pub struct SoftMemory {
    pages: spin::Mutex<BTreeMap<PhysAddr, Box<[u8; PAGE_SIZE]>>>,
}

impl SoftMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, physical: PhysAddr, buf: &mut [u8]) {
        let pages = self.pages.lock();
        let mut done = 0;
        while done < buf.len() {
            let address = physical + done;
            let offset = page_offset(address);
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            match pages.get(&page_align_down(address)) {
                Some(page) => buf[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]),
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
    }

    pub fn write(&self, physical: PhysAddr, data: &[u8]) {
        let mut pages = self.pages.lock();
        let mut done = 0;
        while done < data.len() {
            let address = physical + done;
            let offset = page_offset(address);
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let page = pages
                .entry(page_align_down(address))
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
    }

    pub fn fill(&self, frame: PhysAddr, value: u8) {
        self.write(frame, &[value; PAGE_SIZE]);
    }
}

/// One simulated page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    /// Backing frame; `0` while reserved only.
    pub physical: PhysAddr,
    pub flags: MappingFlags,
}

impl Pte {
    fn reported(&self) -> MappingFlags {
        let mut flags = self.flags | MappingFlags::MAPPED;
        flags.set(MappingFlags::COMMIT, self.physical != 0);
        flags
    }
}

type Table = BTreeMap<VirtAddr, Pte>;

struct Root {
    table: Table,
    users: usize,
}

struct MmuState {
    roots: BTreeMap<usize, Root>,
    global: Table,
    next_root: usize,
    active: usize,
}

/// Page tables kept in ordered maps, one per root plus one for the global region.
pub struct SoftMmu {
    state: spin::Mutex<MmuState>,
    global: Region,
    memory: Arc<SoftMemory>,
    fault_after: AtomicUsize,
}

impl SoftMmu {
    pub fn new(global: Region, memory: Arc<SoftMemory>) -> Self {
        let mut roots = BTreeMap::new();
        roots.insert(KERNEL_ROOT, Root { table: Table::new(), users: 1 });
        Self {
            state: spin::Mutex::new(MmuState {
                roots,
                global: Table::new(),
                next_root: KERNEL_ROOT + 1,
                active: KERNEL_ROOT,
            }),
            global,
            memory,
            fault_after: AtomicUsize::new(NO_FAULT),
        }
    }

    /// Test hook: the next reserve/set/commit call fails with out-of-memory after `pages` pages.
    pub fn fail_next_after(&self, pages: usize) {
        self.fault_after.store(pages, Ordering::SeqCst);
    }

    pub fn entry(&self, space: &PlatformBlock, address: VirtAddr) -> Option<Pte> {
        let mut state = self.state.lock();
        let table = self.table(&mut state, space, address).ok()?;
        table.get(&page_align_down(address)).copied()
    }

    /// Entries present in the root table of `space` (global entries excluded).
    pub fn mapped_pages(&self, space: &PlatformBlock) -> usize {
        let state = self.state.lock();
        state.roots.get(&space.root()).map_or(0, |root| root.table.len())
    }

    pub fn global_pages(&self) -> usize {
        self.state.lock().global.len()
    }

    pub fn live_roots(&self) -> usize {
        self.state.lock().roots.len()
    }

    pub fn active_root(&self) -> usize {
        self.state.lock().active
    }

    fn table<'s>(
        &self,
        state: &'s mut MmuState,
        space: &PlatformBlock,
        address: VirtAddr,
    ) -> VmResult<&'s mut Table> {
        if self.global.contains(address) {
            return Ok(&mut state.global);
        }
        state.roots.get_mut(&space.root()).map(|root| &mut root.table).ok_or(VmError::NotFound)
    }

    fn budget(&self) -> usize {
        self.fault_after.swap(NO_FAULT, Ordering::SeqCst)
    }

    fn install<F>(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        count: usize,
        mut entry: F,
    ) -> Result<usize, MmuFault>
    where
        F: FnMut(usize, Option<Pte>) -> Result<Pte, VmError>,
    {
        let budget = self.budget();
        let mut state = self.state.lock();
        for index in 0..count {
            if index >= budget {
                return Err(MmuFault::new(VmError::OutOfMemory, index));
            }
            let page = page_align_down(address) + index * PAGE_SIZE;
            let table = self.table(&mut state, space, page).map_err(|e| MmuFault::new(e, index))?;
            let pte = entry(index, table.get(&page).copied()).map_err(|e| MmuFault::new(e, index))?;
            table.insert(page, pte);
        }
        Ok(count)
    }

    fn stored(flags: MappingFlags) -> MappingFlags {
        flags - (MappingFlags::COMMIT | MappingFlags::MAPPED)
    }

    fn backed(&self, space: &PlatformBlock, address: VirtAddr) -> VmResult<PhysAddr> {
        match self.entry(space, address) {
            Some(pte) if pte.physical != 0 => Ok(pte.physical + page_offset(address)),
            _ => Err(VmError::NotFound),
        }
    }
}

impl Mmu for SoftMmu {
    fn kernel_space(&self) -> PlatformBlock {
        PlatformBlock { words: [KERNEL_ROOT, 0, 0, 0] }
    }

    fn reserve_pages(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        count: usize,
        flags: MappingFlags,
    ) -> Result<usize, MmuFault> {
        self.install(space, address, count, |_, existing| match existing {
            Some(_) => Err(VmError::InvalidParams),
            None => Ok(Pte { physical: 0, flags: Self::stored(flags) }),
        })
    }

    fn set_pages(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        pages: &[PhysAddr],
        flags: MappingFlags,
    ) -> Result<usize, MmuFault> {
        self.install(space, address, pages.len(), |index, _| {
            Ok(Pte { physical: page_align_down(pages[index]), flags: Self::stored(flags) })
        })
    }

    fn set_contiguous_pages(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        physical: PhysAddr,
        count: usize,
        flags: MappingFlags,
    ) -> Result<usize, MmuFault> {
        let base = page_align_down(physical);
        self.install(space, address, count, |index, _| {
            Ok(Pte { physical: base + index * PAGE_SIZE, flags: Self::stored(flags) })
        })
    }

    fn clear_pages(&self, space: &PlatformBlock, address: VirtAddr, count: usize) -> ClearedPages {
        let mut state = self.state.lock();
        let mut result = ClearedPages::default();
        for index in 0..count {
            let page = page_align_down(address) + index * PAGE_SIZE;
            let Ok(table) = self.table(&mut state, space, page) else {
                continue;
            };
            if let Some(pte) = table.remove(&page) {
                result.cleared += 1;
                if pte.physical != 0 && !pte.flags.contains(MappingFlags::PERSISTENT) {
                    result.freeable.push(pte.physical);
                }
            }
        }
        result
    }

    fn commit_pages(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        pages: &[PhysAddr],
    ) -> Result<usize, MmuFault> {
        self.install(space, address, pages.len(), |index, existing| {
            let wanted = page_align_down(pages[index]);
            match existing {
                None => Err(VmError::NotFound),
                Some(pte) if pte.physical == 0 => Ok(Pte { physical: wanted, ..pte }),
                Some(pte) if pte.physical == wanted => Ok(pte),
                Some(_) => Err(VmError::InvalidParams),
            }
        })
    }

    fn virtual_to_physical(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        out: &mut [PhysAddr],
    ) -> VmResult<usize> {
        let mut state = self.state.lock();
        for (index, slot) in out.iter_mut().enumerate() {
            let page = page_align_down(address) + index * PAGE_SIZE;
            let physical = self
                .table(&mut state, space, page)?
                .get(&page)
                .map_or(0, |pte| pte.physical);
            *slot = if index == 0 && physical != 0 { physical + page_offset(address) } else { physical };
        }
        Ok(out.len())
    }

    fn update_page_attributes(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        count: usize,
        flags: MappingFlags,
    ) -> Result<AttributeUpdate, MmuFault> {
        let mut state = self.state.lock();
        let mut previous = None;
        let mut updated = 0;
        for index in 0..count {
            let page = page_align_down(address) + index * PAGE_SIZE;
            let table = self.table(&mut state, space, page).map_err(|e| MmuFault::new(e, index))?;
            let Some(pte) = table.get_mut(&page) else {
                break;
            };
            if previous.is_none() {
                previous = Some(pte.reported());
            }
            pte.flags = Self::stored(flags) | (pte.flags & MappingFlags::ISDIRTY);
            updated += 1;
        }
        match previous {
            Some(previous) => Ok(AttributeUpdate { previous, updated }),
            None => Err(MmuFault::new(VmError::NotFound, 0)),
        }
    }

    fn page_attributes(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        out: &mut [MappingFlags],
    ) -> VmResult<usize> {
        let mut state = self.state.lock();
        for (index, slot) in out.iter_mut().enumerate() {
            let page = page_align_down(address) + index * PAGE_SIZE;
            *slot = self
                .table(&mut state, space, page)?
                .get(&page)
                .map_or(MappingFlags::empty(), Pte::reported);
        }
        Ok(out.len())
    }

    fn switch_space(&self, space: &PlatformBlock) -> VmResult<()> {
        let mut state = self.state.lock();
        if !state.roots.contains_key(&space.root()) {
            return Err(VmError::NotFound);
        }
        state.active = space.root();
        Ok(())
    }

    fn clone_space(
        &self,
        parent: &PlatformBlock,
        target: &mut PlatformBlock,
        inherit: bool,
    ) -> VmResult<()> {
        let mut state = self.state.lock();
        if inherit {
            let root = state.roots.get_mut(&parent.root()).ok_or(VmError::NotFound)?;
            root.users += 1;
            target.words[0] = parent.root();
        } else {
            let id = state.next_root;
            state.next_root += 1;
            state.roots.insert(id, Root { table: Table::new(), users: 1 });
            target.words = [id, parent.root(), 0, 0];
        }
        Ok(())
    }

    fn destroy_space(&self, space: &PlatformBlock) {
        let mut state = self.state.lock();
        let root = space.root();
        let Some(entry) = state.roots.get_mut(&root) else {
            return;
        };
        entry.users = entry.users.saturating_sub(1);
        if entry.users == 0 && root != KERNEL_ROOT {
            state.roots.remove(&root);
        }
    }

    fn read_bytes(&self, space: &PlatformBlock, address: VirtAddr, buf: &mut [u8]) -> VmResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = address + done;
            let chunk = (PAGE_SIZE - page_offset(at)).min(buf.len() - done);
            let physical = self.backed(space, at)?;
            self.memory.read(physical, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn write_bytes(&self, space: &PlatformBlock, address: VirtAddr, data: &[u8]) -> VmResult<()> {
        let mut done = 0;
        while done < data.len() {
            let at = address + done;
            let chunk = (PAGE_SIZE - page_offset(at)).min(data.len() - done);
            let physical = self.backed(space, at)?;
            self.memory.write(physical, &data[done..done + chunk]);
            let mut state = self.state.lock();
            if let Some(pte) = self.table(&mut state, space, at)?.get_mut(&page_align_down(at)) {
                pte.flags |= MappingFlags::ISDIRTY;
            }
            done += chunk;
        }
        Ok(())
    }

    fn zero_pages(&self, space: &PlatformBlock, address: VirtAddr, count: usize) -> VmResult<()> {
        for index in 0..count {
            let physical = self.backed(space, page_align_down(address) + index * PAGE_SIZE)?;
            self.memory.fill(physical, 0);
        }
        Ok(())
    }
}

struct FrameState {
    /// `(rank, frame)`: lower ranks are handed out first.
    free: BTreeSet<(usize, PhysAddr)>,
    ranks: BTreeMap<PhysAddr, usize>,
    allocated: BTreeSet<PhysAddr>,
    budget: Option<usize>,
    double_frees: usize,
}

/// Frame allocator over fixed physical ranges; later ranges are preferred.
pub struct SoftFrames {
    state: spin::Mutex<FrameState>,
    memory: Arc<SoftMemory>,
}

impl SoftFrames {
    /// `ranges` are `(first frame, frame count)` pairs.
    pub fn new(memory: Arc<SoftMemory>, ranges: &[(PhysAddr, usize)]) -> Self {
        let mut free = BTreeSet::new();
        let mut ranks = BTreeMap::new();
        for (order, &(start, count)) in ranges.iter().rev().enumerate() {
            for index in 0..count {
                let frame = start + index * PAGE_SIZE;
                let rank = (order << 24) + index;
                free.insert((rank, frame));
                ranks.insert(frame, rank);
            }
        }
        Self {
            state: spin::Mutex::new(FrameState {
                free,
                ranks,
                allocated: BTreeSet::new(),
                budget: None,
                double_frees: 0,
            }),
            memory,
        }
    }

    /// Limits how many further frames may be handed out; `None` lifts the limit.
    pub fn set_budget(&self, frames: Option<usize>) {
        self.state.lock().budget = frames;
    }

    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated.len()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn is_allocated(&self, frame: PhysAddr) -> bool {
        self.state.lock().allocated.contains(&frame)
    }

    pub fn double_frees(&self) -> usize {
        self.state.lock().double_frees
    }
}

impl FrameAllocator for SoftFrames {
    fn allocate(&self, mask: usize, out: &mut [PhysAddr]) -> VmResult<()> {
        let mut state = self.state.lock();
        if state.budget.is_some_and(|budget| budget < out.len()) {
            return Err(VmError::OutOfMemory);
        }
        let picked: Vec<(usize, PhysAddr)> = state
            .free
            .iter()
            .filter(|(_, frame)| frame + (PAGE_SIZE - 1) <= mask)
            .take(out.len())
            .copied()
            .collect();
        if picked.len() < out.len() {
            return Err(VmError::OutOfMemory);
        }
        for (slot, entry) in out.iter_mut().zip(picked.iter()) {
            state.free.remove(entry);
            state.allocated.insert(entry.1);
            *slot = entry.1;
        }
        if let Some(budget) = state.budget.as_mut() {
            *budget -= out.len();
        }
        drop(state);
        for &frame in out.iter() {
            self.memory.fill(frame, POISON);
        }
        Ok(())
    }

    fn free(&self, pages: &[PhysAddr]) {
        let mut state = self.state.lock();
        for &frame in pages.iter().filter(|&&frame| frame != 0) {
            let frame = page_align_down(frame);
            if !state.allocated.remove(&frame) {
                state.double_frees += 1;
                continue;
            }
            if let Some(&rank) = state.ranks.get(&frame) {
                state.free.insert((rank, frame));
            }
        }
    }
}

/// Translation cache that records every invalidated range.
#[derive(Default)]
pub struct RecordingTlb {
    ranges: spin::Mutex<Vec<(VirtAddr, usize)>>,
}

impl Tlb for RecordingTlb {
    fn invalidate_range(&self, address: VirtAddr, length: usize) {
        self.ranges.lock().push((address, length));
    }
}

struct SoftCore {
    current: Option<SpaceId>,
    parent: Option<SpaceId>,
    responsive: bool,
    tlb: RecordingTlb,
}

/// Simulated cores; core 0 is the caller. Unresponsive cores queue messages until flushed.
pub struct SoftMesh {
    cores: spin::Mutex<Vec<SoftCore>>,
    pending: spin::Mutex<Vec<(usize, Arc<dyn CoreMessage>)>>,
    broadcasts: AtomicUsize,
    slept_ms: AtomicU32,
    quiet: AtomicBool,
}

impl SoftMesh {
    pub fn new(cores: usize) -> Self {
        let cores = (0..cores.max(1))
            .map(|_| SoftCore {
                current: None,
                parent: None,
                responsive: true,
                tlb: RecordingTlb::default(),
            })
            .collect();
        Self {
            cores: spin::Mutex::new(cores),
            pending: spin::Mutex::new(Vec::new()),
            broadcasts: AtomicUsize::new(0),
            slept_ms: AtomicU32::new(0),
            quiet: AtomicBool::new(false),
        }
    }

    /// Sets the space running on `core`, together with that space's parent.
    pub fn set_core(&self, core: usize, current: Option<SpaceId>, parent: Option<SpaceId>) {
        if let Some(entry) = self.cores.lock().get_mut(core) {
            entry.current = current;
            entry.parent = parent;
        }
    }

    pub fn set_responsive(&self, core: usize, responsive: bool) {
        if let Some(entry) = self.cores.lock().get_mut(core) {
            entry.responsive = responsive;
        }
    }

    /// Reports no thread on the calling core, as during early boot.
    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::SeqCst);
    }

    pub fn invalidations(&self, core: usize) -> Vec<(VirtAddr, usize)> {
        self.cores.lock().get(core).map_or_else(Vec::new, |entry| entry.tlb.ranges.lock().clone())
    }

    pub fn broadcasts(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }

    pub fn slept_ms(&self) -> u32 {
        self.slept_ms.load(Ordering::SeqCst)
    }

    /// Delivers every queued message, regardless of responsiveness.
    pub fn flush_pending(&self) {
        let pending = core::mem::take(&mut *self.pending.lock());
        let cores = self.cores.lock();
        for (index, message) in pending {
            if let Some(core) = cores.get(index) {
                Self::deliver(core, message.as_ref());
            }
        }
    }

    fn deliver(core: &SoftCore, message: &dyn CoreMessage) {
        message.deliver(&CoreView { current: core.current, parent: core.parent, tlb: &core.tlb });
    }
}

impl CoreMesh for SoftMesh {
    fn active_cores(&self) -> usize {
        self.cores.lock().len()
    }

    fn current_space(&self) -> Option<SpaceId> {
        if self.quiet.load(Ordering::SeqCst) {
            return None;
        }
        self.cores.lock().first().and_then(|core| core.current)
    }

    fn broadcast(&self, message: Arc<dyn CoreMessage>) -> usize {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        let cores = self.cores.lock();
        let mut recipients = 0;
        for (index, core) in cores.iter().enumerate().skip(1) {
            recipients += 1;
            if core.responsive {
                Self::deliver(core, message.as_ref());
            } else {
                self.pending.lock().push((index, message.clone()));
            }
        }
        recipients
    }

    fn sleep_ms(&self, ms: u32) {
        self.slept_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

/// High frames live above 4 GiB and are handed out first.
pub const HIGH_FRAMES: (PhysAddr, usize) = (0x1_0000_0000, 256);
/// Low frames sit below 16 MiB.
pub const LOW_FRAMES: (PhysAddr, usize) = (0x0010_0000, 256);

/// Bundle of software collaborators sharing one simulated memory.
pub struct SoftHal {
    pub memory: Arc<SoftMemory>,
    pub mmu: Arc<SoftMmu>,
    pub frames: Arc<SoftFrames>,
    pub mesh: Arc<SoftMesh>,
    pub layout: MachineLayout,
}

impl SoftHal {
    pub fn new(layout: MachineLayout, cores: usize) -> Self {
        let memory = Arc::new(SoftMemory::new());
        Self {
            mmu: Arc::new(SoftMmu::new(layout.global_access, memory.clone())),
            frames: Arc::new(SoftFrames::new(memory.clone(), &[LOW_FRAMES, HIGH_FRAMES])),
            mesh: Arc::new(SoftMesh::new(cores)),
            memory,
            layout,
        }
    }

    pub fn machine(&self) -> Machine {
        Machine::new(self.mmu.clone(), self.frames.clone(), self.mesh.clone(), self.layout)
    }
}
