// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory buffers built on the mapping engine
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ShmBuffer, ShmHandle, ShmDescriptor, Vmm::{shm_create,shm_export,shm_attach,shm_detach,shm_map,shm_unmap,shm_commit,shm_conform}
//! DEPENDS_ON: mm::map (engine), object::HandleTable, hal::FrameAllocator
//! INVARIANTS: Owned frames live exactly as long as the buffer; the page lock is never held across engine calls
//!
//! Flavors:
//!   - Device: noncached, persistent, eagerly backed under the descriptor's conformity mask
//!   - IPC: user mapping plus a global kernel mapping over the same frames
//!   - Trap: reserved only; every access faults until committed
//!   - Regular: eager with `ShmFlags::COMMIT`, otherwise reserved and backed on demand

extern crate alloc;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::Conformity;
use crate::error::{VmError, VmResult};
use crate::mm::{AddressSpace, MapOptions, MappingFlags, PhysicalPlacement, VirtualPlacement};
use crate::types::{page_align_down, page_count, page_offset, span_pages, PhysAddr, ShmId, VirtAddr, PAGE_SIZE};
use crate::vmm::Vmm;

pub mod conform;
pub mod sg;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod tests_prop;

pub use conform::ConformityOptions;
pub use sg::SgEntry;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ShmFlags: u32 {
        /// Only spaces related to the creator may attach or map.
        const PRIVATE = 1 << 0;
        /// Zero-fill frames when they are first backed.
        const CLEAN = 1 << 1;
        /// Back every page at creation.
        const COMMIT = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ShmAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Back the mapped range before mapping it.
        const COMMIT = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ConformFlags: u32 {
        /// Copy the source content into a freshly created clone.
        const FILL_ON_CREATION = 1 << 0;
        /// Copy the clone content back into the source when unmapped or detached.
        const BACKFILL_ON_UNMAP = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShmKind {
    #[default]
    Regular,
    Device,
    Ipc,
    Trap,
}

/// Creation request for [`Vmm::shm_create`].
#[derive(Clone, Copy, Debug)]
pub struct ShmDescriptor<'k> {
    /// Optional discovery path, resolved through [`Vmm::shm_lookup`].
    pub key: Option<&'k str>,
    pub size: usize,
    pub kind: ShmKind,
    pub flags: ShmFlags,
    pub access: ShmAccess,
    pub conformity: Conformity,
}

impl<'k> ShmDescriptor<'k> {
    pub fn new(size: usize, kind: ShmKind) -> Self {
        Self {
            key: None,
            size,
            kind,
            flags: ShmFlags::empty(),
            access: ShmAccess::READ | ShmAccess::WRITE,
            conformity: Conformity::None,
        }
    }

    pub fn key(mut self, key: &'k str) -> Self {
        self.key = Some(key);
        self
    }

    pub fn flags(mut self, flags: ShmFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn access(mut self, access: ShmAccess) -> Self {
        self.access = access;
        self
    }

    pub fn conformity(mut self, conformity: Conformity) -> Self {
        self.conformity = conformity;
        self
    }
}

/// Shareable memory object; one page entry per page, `0` while unbacked.
pub struct ShmBuffer {
    id: ShmId,
    owner: Weak<AddressSpace>,
    pages: spin::Mutex<Vec<PhysAddr>>,
    page_count: usize,
    offset: usize,
    length: usize,
    flags: ShmFlags,
    kind: ShmKind,
    access: ShmAccess,
    exported: bool,
    page_mask: usize,
    kernel_mapping: Option<VirtAddr>,
}

impl core::fmt::Debug for ShmBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShmBuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("exported", &self.exported)
            .finish()
    }
}

impl ShmBuffer {
    pub fn id(&self) -> ShmId {
        self.id
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Byte offset of the content inside the first page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn flags(&self) -> ShmFlags {
        self.flags
    }

    pub fn kind(&self) -> ShmKind {
        self.kind
    }

    /// Access granted when the buffer was created or exported.
    pub fn access(&self) -> ShmAccess {
        self.access
    }

    /// True when the frames belong to the exporting caller.
    pub fn is_exported(&self) -> bool {
        self.exported
    }

    pub fn page_mask(&self) -> usize {
        self.page_mask
    }

    pub fn kernel_mapping(&self) -> Option<VirtAddr> {
        self.kernel_mapping
    }

    /// Snapshot of the page array.
    pub fn pages(&self) -> Vec<PhysAddr> {
        self.pages.lock().clone()
    }

    pub fn scatter_gather(&self) -> Vec<SgEntry> {
        sg::build(&self.pages.lock(), self.offset)
    }

    fn pages_at(&self, index: usize, count: usize) -> VmResult<Vec<PhysAddr>> {
        let pages = self.pages.lock();
        let end = index.checked_add(count).ok_or(VmError::InvalidParams)?;
        let slice = pages.get(index..end).ok_or(VmError::InvalidParams)?;
        let mut out = Vec::new();
        out.try_reserve_exact(count).map_err(|_| VmError::OutOfMemory)?;
        out.extend_from_slice(slice);
        Ok(out)
    }
}

/// Per-consumer view of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmHandle {
    pub id: ShmId,
    /// Set on conformity clones; the source stays referenced until detach.
    pub source_id: Option<ShmId>,
    pub source_flags: ConformFlags,
    /// Content offset inside the source that the clone mirrors.
    pub source_offset: usize,
    pub capacity: usize,
    pub length: usize,
    pub offset: usize,
    pub buffer: Option<VirtAddr>,
}

impl ShmHandle {
    fn unmapped(id: ShmId, capacity: usize) -> Self {
        Self {
            id,
            source_id: None,
            source_flags: ConformFlags::empty(),
            source_offset: 0,
            capacity,
            length: capacity,
            offset: 0,
            buffer: None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.buffer.is_some()
    }
}

/// Mappings made at creation.
struct Backing {
    pages: Vec<PhysAddr>,
    user: Option<VirtAddr>,
    kernel: Option<VirtAddr>,
    page_mask: usize,
}

fn access_flags(base: MappingFlags, access: ShmAccess) -> MappingFlags {
    let mut flags = base;
    if !access.contains(ShmAccess::WRITE) {
        flags |= MappingFlags::READONLY;
    }
    if access.contains(ShmAccess::EXECUTE) {
        flags |= MappingFlags::EXECUTABLE;
    }
    flags
}

fn clean_flag(flags: ShmFlags) -> MappingFlags {
    if flags.contains(ShmFlags::CLEAN) {
        MappingFlags::CLEAN
    } else {
        MappingFlags::empty()
    }
}

fn device_flags(descriptor: &ShmDescriptor<'_>) -> MappingFlags {
    let base = MappingFlags::USERSPACE | MappingFlags::PERSISTENT | MappingFlags::NOCACHE | MappingFlags::COMMIT;
    access_flags(base | clean_flag(descriptor.flags), descriptor.access)
}

fn ipc_flags(descriptor: &ShmDescriptor<'_>) -> MappingFlags {
    MappingFlags::USERSPACE | MappingFlags::PERSISTENT | MappingFlags::COMMIT | clean_flag(descriptor.flags)
}

fn trap_flags(descriptor: &ShmDescriptor<'_>) -> MappingFlags {
    MappingFlags::USERSPACE | MappingFlags::PERSISTENT | MappingFlags::TRAPPAGE | clean_flag(descriptor.flags)
}

fn regular_flags(descriptor: &ShmDescriptor<'_>) -> MappingFlags {
    let mut base = MappingFlags::USERSPACE | MappingFlags::PERSISTENT | clean_flag(descriptor.flags);
    if descriptor.flags.contains(ShmFlags::COMMIT) {
        base |= MappingFlags::COMMIT;
    }
    access_flags(base, descriptor.access)
}

/// Flags for consumer mappings; frames stay under buffer control, so always persistent.
fn consumer_flags(access: ShmAccess) -> MappingFlags {
    access_flags(MappingFlags::USERSPACE | MappingFlags::PERSISTENT, access)
}

impl Vmm {
    /// Creates a buffer of the requested flavor and maps it into the current space.
    pub fn shm_create(&self, descriptor: &ShmDescriptor<'_>) -> VmResult<ShmHandle> {
        if descriptor.size == 0 || span_pages(0, descriptor.size).is_none() {
            return Err(VmError::InvalidParams);
        }
        let space = self.current_space();
        let id = self.shm.reserve()?;
        if let Some(key) = descriptor.key {
            if let Err(error) = self.shm.register_path(id, key) {
                self.shm.abandon(id);
                return Err(error);
            }
        }
        let backing = match self.back_buffer(&space, id, descriptor) {
            Ok(backing) => backing,
            Err(error) => {
                self.shm.abandon(id);
                return Err(error);
            }
        };
        let buffer = Arc::new(ShmBuffer {
            id,
            owner: Arc::downgrade(&space),
            page_count: backing.pages.len(),
            pages: spin::Mutex::new(backing.pages),
            offset: 0,
            length: descriptor.size,
            flags: descriptor.flags,
            kind: descriptor.kind,
            access: descriptor.access,
            exported: false,
            page_mask: backing.page_mask,
            kernel_mapping: backing.kernel,
        });
        if let Err(error) = self.shm.install(id, buffer.clone()) {
            if let Some(user) = backing.user {
                self.unmap_logged(&space, user, descriptor.size);
            }
            self.destroy_buffer(&buffer);
            self.shm.abandon(id);
            return Err(error);
        }
        log_debug!(
            target: "shm",
            "buffer {} created kind={:?} size=0x{:x}",
            id.to_raw(),
            descriptor.kind,
            descriptor.size
        );
        let mut handle = ShmHandle::unmapped(id, descriptor.size);
        handle.buffer = backing.user;
        Ok(handle)
    }

    /// Runs the flavor factory; on failure nothing it acquired survives.
    fn back_buffer(&self, space: &AddressSpace, id: ShmId, descriptor: &ShmDescriptor<'_>) -> VmResult<Backing> {
        let count = page_count(descriptor.size);
        let mut pages = Vec::new();
        pages.try_reserve_exact(count).map_err(|_| VmError::OutOfMemory)?;
        pages.resize(count, 0);
        let page_mask = descriptor.conformity.page_mask();

        let (flags, eager) = match descriptor.kind {
            ShmKind::Device => (device_flags(descriptor), true),
            ShmKind::Ipc => (ipc_flags(descriptor), true),
            ShmKind::Trap => (trap_flags(descriptor), false),
            ShmKind::Regular => (regular_flags(descriptor), descriptor.flags.contains(ShmFlags::COMMIT)),
        };
        if !eager {
            let options = MapOptions::new(descriptor.size, flags, VirtualPlacement::Process).tag(id);
            let user = self.map(space, options)?;
            return Ok(Backing { pages, user: Some(user), kernel: None, page_mask });
        }

        self.machine.frames.allocate(page_mask, &mut pages)?;
        let options = MapOptions::new(descriptor.size, flags, VirtualPlacement::Process)
            .physical(PhysicalPlacement::Fixed)
            .pages(&mut pages)
            .mask(page_mask)
            .tag(id);
        let user = match self.map(space, options) {
            Ok(user) => user,
            Err(error) => {
                self.machine.frames.free(&pages);
                return Err(error);
            }
        };
        if descriptor.kind != ShmKind::Ipc {
            return Ok(Backing { pages, user: Some(user), kernel: None, page_mask });
        }

        let options = MapOptions::new(
            descriptor.size,
            MappingFlags::COMMIT | MappingFlags::PERSISTENT,
            VirtualPlacement::Global,
        )
        .physical(PhysicalPlacement::Fixed)
        .pages(&mut pages)
        .tag(id);
        match self.map(&self.kernel, options) {
            Ok(kernel) => Ok(Backing { pages, user: Some(user), kernel: Some(kernel), page_mask }),
            Err(error) => {
                self.unmap_logged(space, user, descriptor.size);
                self.machine.frames.free(&pages);
                Err(error)
            }
        }
    }

    /// Wraps caller-owned memory at `address` without allocating frames.
    pub fn shm_export(
        &self,
        address: VirtAddr,
        size: usize,
        flags: ShmFlags,
        access: ShmAccess,
    ) -> VmResult<ShmHandle> {
        if address == 0 || size == 0 {
            return Err(VmError::InvalidParams);
        }
        let space = self.current_space();
        let offset = page_offset(address);
        let count = span_pages(address, size).ok_or(VmError::InvalidParams)?;
        let mut pages = Vec::new();
        pages.try_reserve_exact(count).map_err(|_| VmError::OutOfMemory)?;
        pages.resize(count, 0);
        self.machine.mmu.virtual_to_physical(&space.platform(), address, &mut pages)?;
        // The translation of the first page carries the in-page offset; it is tracked apart.
        pages[0] = page_align_down(pages[0]);
        if pages.iter().any(|&page| page == 0) {
            return Err(VmError::NotSupported);
        }

        let id = self.shm.reserve()?;
        let buffer = Arc::new(ShmBuffer {
            id,
            owner: Arc::downgrade(&space),
            page_count: count,
            pages: spin::Mutex::new(pages),
            offset,
            length: size,
            flags: ShmFlags::COMMIT | (flags & ShmFlags::PRIVATE),
            kind: ShmKind::Regular,
            access,
            exported: true,
            page_mask: usize::MAX,
            kernel_mapping: None,
        });
        if let Err(error) = self.shm.install(id, buffer) {
            self.shm.abandon(id);
            return Err(error);
        }
        log_debug!(target: "shm", "buffer {} exported from 0x{:x}+0x{:x}", id.to_raw(), address, size);
        Ok(ShmHandle::unmapped(id, size))
    }

    /// Takes a reference on a buffer and returns an unmapped view of it.
    pub fn shm_attach(&self, id: ShmId) -> VmResult<ShmHandle> {
        let buffer = self.shm.acquire(id).ok_or(VmError::NotFound)?;
        if let Err(error) = self.check_private(&buffer) {
            self.release_buffer(id);
            return Err(error);
        }
        Ok(ShmHandle::unmapped(id, buffer.length))
    }

    /// Unmaps the view if needed, settles the conformity source and drops the reference.
    pub fn shm_detach(&self, handle: &mut ShmHandle) -> VmResult<()> {
        if handle.is_mapped() {
            self.shm_unmap(handle)?;
        } else {
            self.backfill(handle)?;
        }
        if let Some(source) = handle.source_id.take() {
            self.release_buffer(source);
        }
        if let Some(buffer) = self.shm.release(handle.id)? {
            self.destroy_buffer(&buffer);
        }
        handle.buffer = None;
        handle.length = 0;
        handle.capacity = 0;
        Ok(())
    }

    /// Maps `[offset, offset + length)` of the buffer into the current space.
    ///
    /// A view already mapped at the same offset is updated in place, as long as it does not
    /// grow. Otherwise a new mapping is made first and the old one is released afterwards.
    pub fn shm_map(&self, handle: &mut ShmHandle, offset: usize, length: usize, access: ShmAccess) -> VmResult<()> {
        if length == 0 {
            return Err(VmError::InvalidParams);
        }
        if handle.source_id.is_some() {
            return Err(VmError::NotSupported);
        }
        let buffer = self.shm.lookup(handle.id).ok_or(VmError::NotFound)?;
        self.check_private(&buffer)?;
        let index = offset / PAGE_SIZE;
        if index >= buffer.page_count {
            return Err(VmError::InvalidParams);
        }
        // Requests past the end of the buffer are clamped to it.
        let clamped = length.saturating_add(page_offset(offset)).min((buffer.page_count - index) * PAGE_SIZE);
        let count = page_count(clamped);
        let space = self.current_space();
        let flags = consumer_flags(access);

        if let Some(current) = handle.buffer.filter(|_| handle.offset == offset && clamped <= handle.length) {
            if access.contains(ShmAccess::COMMIT) {
                self.ensure_pages(&buffer, index, count)?;
                let mut pages = buffer.pages_at(index, count)?;
                let placement = VirtualPlacement::Fixed(current);
                let options = MapOptions::new(count * PAGE_SIZE, flags | MappingFlags::COMMIT, placement)
                    .physical(PhysicalPlacement::Fixed)
                    .pages(&mut pages)
                    .mask(buffer.page_mask)
                    .tag(buffer.id);
                self.map(&space, options)?;
                let _ = self.sync_mapping_change(&space, current, count * PAGE_SIZE);
            } else {
                let _change = self.change_protection(&space, current, count * PAGE_SIZE, flags)?;
            }
            // The mapping keeps its size; only the covered pages change.
            return Ok(());
        }

        let mapping = if access.contains(ShmAccess::COMMIT) {
            self.ensure_pages(&buffer, index, count)?;
            let mut pages = buffer.pages_at(index, count)?;
            let options = MapOptions::new(count * PAGE_SIZE, flags | MappingFlags::COMMIT, VirtualPlacement::Process)
                .physical(PhysicalPlacement::Fixed)
                .pages(&mut pages)
                .mask(buffer.page_mask)
                .tag(buffer.id);
            self.map(&space, options)?
        } else {
            let options = MapOptions::new(count * PAGE_SIZE, flags, VirtualPlacement::Process).tag(buffer.id);
            self.map(&space, options)?
        };
        if let Some(previous) = handle.buffer {
            if let Err(error) = self.unmap(&space, previous, handle.length) {
                self.unmap_logged(&space, mapping, count * PAGE_SIZE);
                return Err(error);
            }
        }
        handle.buffer = Some(mapping);
        handle.offset = offset;
        handle.length = clamped;
        Ok(())
    }

    /// Releases the view's mapping, backfilling a conformity source first when requested.
    pub fn shm_unmap(&self, handle: &mut ShmHandle) -> VmResult<()> {
        let mapping = handle.buffer.ok_or(VmError::InvalidParams)?;
        self.backfill(handle)?;
        let space = self.current_space();
        let _progress = self.unmap(&space, mapping, handle.length)?;
        handle.buffer = None;
        handle.offset = 0;
        handle.length = 0;
        Ok(())
    }

    /// Backs and commits the pages of `[address, address + length)` inside the view.
    pub fn shm_commit(&self, handle: &ShmHandle, address: VirtAddr, length: usize) -> VmResult<()> {
        if address == 0 || length == 0 {
            return Err(VmError::InvalidParams);
        }
        let base = handle.buffer.ok_or(VmError::InvalidParams)?;
        let buffer = self.shm.lookup(handle.id).ok_or(VmError::NotFound)?;
        let start = page_align_down(address);
        if start < page_align_down(base) {
            return Err(VmError::InvalidParams);
        }
        let index = handle.offset / PAGE_SIZE + (start - page_align_down(base)) / PAGE_SIZE;
        let count = span_pages(address, length).ok_or(VmError::InvalidParams)?;
        if index.checked_add(count).map_or(true, |end| end > buffer.page_count) {
            return Err(VmError::InvalidParams);
        }
        self.ensure_pages(&buffer, index, count)?;
        let mut pages = buffer.pages_at(index, count)?;
        let space = self.current_space();
        self.commit(&space, start, &mut pages, count * PAGE_SIZE, buffer.page_mask, PhysicalPlacement::Fixed)
    }

    /// The privileged mapping of an IPC buffer.
    pub fn shm_kernel_mapping(&self, id: ShmId) -> VmResult<VirtAddr> {
        let buffer = self.shm.lookup(id).ok_or(VmError::NotFound)?;
        buffer.kernel_mapping.ok_or(VmError::NotSupported)
    }

    /// Reads IPC buffer content through the kernel mapping; returns the bytes copied.
    pub fn shm_read(&self, id: ShmId, offset: usize, out: &mut [u8]) -> VmResult<usize> {
        let (address, count) = self.kernel_window(id, offset, out.len())?;
        self.machine.mmu.read_bytes(&self.kernel.platform(), address, &mut out[..count])?;
        Ok(count)
    }

    /// Writes IPC buffer content through the kernel mapping; returns the bytes copied.
    pub fn shm_write(&self, id: ShmId, offset: usize, data: &[u8]) -> VmResult<usize> {
        let (address, count) = self.kernel_window(id, offset, data.len())?;
        self.machine.mmu.write_bytes(&self.kernel.platform(), address, &data[..count])?;
        Ok(count)
    }

    fn kernel_window(&self, id: ShmId, offset: usize, requested: usize) -> VmResult<(VirtAddr, usize)> {
        let buffer = self.shm.lookup(id).ok_or(VmError::NotFound)?;
        let mapping = buffer.kernel_mapping.ok_or(VmError::NotSupported)?;
        if offset > buffer.length {
            return Err(VmError::InvalidParams);
        }
        Ok((mapping + buffer.offset + offset, requested.min(buffer.length - offset)))
    }

    /// Resolves a path registered at creation.
    pub fn shm_lookup(&self, key: &str) -> VmResult<ShmId> {
        self.shm.lookup_path(key).ok_or(VmError::NotFound)
    }

    pub fn shm_buffer(&self, id: ShmId) -> VmResult<Arc<ShmBuffer>> {
        self.shm.lookup(id).ok_or(VmError::NotFound)
    }

    /// Backs every unbacked page in `[start, start + count)` with a fresh frame.
    ///
    /// Already backed pages are left alone. Frames of clean buffers are zeroed before they
    /// are published in the page array; a frame that lost the race to a concurrent backer is
    /// returned to the allocator.
    pub(crate) fn ensure_pages(&self, buffer: &ShmBuffer, start: usize, count: usize) -> VmResult<()> {
        let end = start.checked_add(count).ok_or(VmError::InvalidParams)?;
        let mut missing = Vec::new();
        {
            let pages = buffer.pages.lock();
            let range = pages.get(start..end).ok_or(VmError::InvalidParams)?;
            missing.try_reserve_exact(count).map_err(|_| VmError::OutOfMemory)?;
            missing.extend((start..end).zip(range).filter(|(_, page)| **page == 0).map(|(index, _)| index));
        }
        if missing.is_empty() {
            return Ok(());
        }

        let mut fresh = Vec::new();
        fresh.try_reserve_exact(missing.len()).map_err(|_| VmError::OutOfMemory)?;
        fresh.resize(missing.len(), 0);
        self.machine.frames.allocate(buffer.page_mask, &mut fresh)?;
        if buffer.flags.contains(ShmFlags::CLEAN) {
            if let Some(error) = fresh.iter().find_map(|&frame| self.scrub_frame(frame).err()) {
                self.machine.frames.free(&fresh);
                return Err(error);
            }
        }

        let mut losers = Vec::new();
        {
            let mut pages = buffer.pages.lock();
            for (&index, &frame) in missing.iter().zip(fresh.iter()) {
                match pages.get_mut(index) {
                    Some(page) if *page == 0 => *page = frame,
                    _ => losers.push(frame),
                }
            }
        }
        if !losers.is_empty() {
            self.machine.frames.free(&losers);
        }
        Ok(())
    }

    fn scrub_frame(&self, frame: PhysAddr) -> VmResult<()> {
        let flags = MappingFlags::COMMIT | MappingFlags::PERSISTENT | MappingFlags::CLEAN;
        let options = MapOptions::new(PAGE_SIZE, flags, VirtualPlacement::Global)
            .physical(PhysicalPlacement::Contiguous(frame));
        let window = self.map(&self.kernel, options)?;
        self.unmap_logged(&self.kernel, window, PAGE_SIZE);
        Ok(())
    }

    /// Private buffers accept only spaces related to their creator.
    fn check_private(&self, buffer: &ShmBuffer) -> VmResult<()> {
        if !buffer.flags.contains(ShmFlags::PRIVATE) {
            return Ok(());
        }
        let owner = buffer.owner.upgrade().ok_or(VmError::Permissions)?;
        if owner.are_related(&self.current_space()) {
            Ok(())
        } else {
            Err(VmError::Permissions)
        }
    }

    /// Drops one buffer reference; the last one destroys it.
    pub(crate) fn release_buffer(&self, id: ShmId) {
        match self.shm.release(id) {
            Ok(Some(buffer)) => self.destroy_buffer(&buffer),
            Ok(None) => {}
            Err(error) => log_warn!(target: "shm", "release of buffer {} failed: {}", id.to_raw(), error),
        }
    }

    fn destroy_buffer(&self, buffer: &ShmBuffer) {
        if let Some(mapping) = buffer.kernel_mapping {
            self.unmap_logged(&self.kernel, mapping, buffer.page_count * PAGE_SIZE);
        }
        if !buffer.exported {
            let owned: Vec<PhysAddr> = buffer.pages.lock().iter().copied().filter(|&page| page != 0).collect();
            if !owned.is_empty() {
                self.machine.frames.free(&owned);
            }
        }
        log_debug!(target: "shm", "buffer {} destroyed", buffer.id.to_raw());
    }

    fn unmap_logged(&self, space: &AddressSpace, address: VirtAddr, length: usize) {
        if let Err(error) = self.unmap(space, address, length) {
            log_warn!(target: "shm", "unmap of 0x{:x}+0x{:x} failed: {}", address, length, error);
        }
    }
}
