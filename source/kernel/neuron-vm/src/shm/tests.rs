// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Unit tests for shared-memory buffers
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; run against the software HAL with an application space current on core 0
//!
//! TEST_SCOPE:
//!   - Flavor factories and their mappings
//!   - Export of caller memory, attach/detach reference handling
//!   - Consumer mapping, in-place updates and lazy commits
//!   - Conformity reuse, cloning with fill and backfill
//!   - Private buffer access checks and path lookup
//!   - Rollback when a kernel window, a zeroing pass or a remap step fails

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{ConformFlags, ConformityOptions, ShmAccess, ShmDescriptor, ShmFlags, ShmHandle, ShmKind};
use crate::config::{Conformity, MachineLayout, Region};
use crate::error::VmError;
use crate::hal::soft::SoftHal;
use crate::hal::Mmu;
use crate::mm::{AddressSpace, MapOptions, MappingFlags, SpaceFlags, VirtualPlacement};
use crate::types::{VirtAddr, PAGE_SIZE};
use crate::vmm::Vmm;

const PAGE: usize = PAGE_SIZE;
const FOUR_GIB: usize = 0x1_0000_0000;

struct Fixture {
    hal: SoftHal,
    vmm: Vmm,
    app: Arc<AddressSpace>,
}

fn fixture() -> Fixture {
    fixture_with(MachineLayout::default())
}

fn fixture_with(layout: MachineLayout) -> Fixture {
    let hal = SoftHal::new(layout, 1);
    let vmm = Vmm::new(hal.machine()).unwrap();
    let (id, app) = vmm.create_address_space(SpaceFlags::APPLICATION).unwrap();
    hal.mesh.set_core(0, Some(id), None);
    Fixture { hal, vmm, app }
}

fn read_write() -> ShmAccess {
    ShmAccess::READ | ShmAccess::WRITE
}

impl Fixture {
    fn create(&self, size: usize, kind: ShmKind, flags: ShmFlags) -> ShmHandle {
        self.vmm
            .shm_create(&ShmDescriptor::new(size, kind).flags(flags))
            .unwrap()
    }

    fn map_committed(&self, length: usize) -> VirtAddr {
        let flags = MappingFlags::USERSPACE | MappingFlags::COMMIT;
        self.vmm
            .map(&self.app, MapOptions::new(length, flags, VirtualPlacement::Process))
            .unwrap()
    }

    fn write_user(&self, address: VirtAddr, data: &[u8]) {
        self.hal.mmu.write_bytes(&self.app.platform(), address, data).unwrap();
    }

    fn read_user(&self, address: VirtAddr, length: usize) -> Vec<u8> {
        let mut out = vec![0u8; length];
        self.hal.mmu.read_bytes(&self.app.platform(), address, &mut out).unwrap();
        out
    }

    fn enter(&self, space: &AddressSpace) {
        self.hal.mesh.set_core(0, Some(space.id()), None);
    }
}

fn pattern(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i % 251) as u8).collect()
}

#[test]
fn export_keeps_in_page_offset() {
    let fx = fixture();
    let source = fx.map_committed(9 * PAGE);
    let frames = fx.hal.frames.allocated_count();

    let mut handle = fx
        .vmm
        .shm_export(source + 0x856, 0x8400, ShmFlags::empty(), read_write())
        .unwrap();
    assert!(!handle.is_mapped());
    assert_eq!(handle.capacity, 0x8400);

    let buffer = fx.vmm.shm_buffer(handle.id).unwrap();
    assert_eq!(buffer.offset(), 0x856);
    assert_eq!(buffer.page_count(), 9);
    assert!(buffer.is_exported());
    let pages = buffer.pages();
    assert_eq!(pages[0] & (PAGE - 1), 0);
    assert_eq!(pages, fx.vmm.get_mapping(&fx.app, source, 9).unwrap());
    assert_eq!(buffer.scatter_gather()[0].address, pages[0] + 0x856);
    assert_eq!(fx.hal.frames.allocated_count(), frames);

    fx.vmm.shm_detach(&mut handle).unwrap();
    assert_eq!(fx.vmm.shm_buffer(handle.id).err(), Some(VmError::NotFound));
    // Exported frames stay with the caller's mapping.
    assert_eq!(fx.hal.frames.allocated_count(), frames);
    assert!(pages.iter().all(|&page| fx.hal.frames.is_allocated(page)));
}

#[test]
fn export_rejects_unbacked_memory() {
    let fx = fixture();
    let reserved = fx
        .vmm
        .map(&fx.app, MapOptions::new(2 * PAGE, MappingFlags::USERSPACE, VirtualPlacement::Process))
        .unwrap();
    assert_eq!(
        fx.vmm.shm_export(reserved, 2 * PAGE, ShmFlags::empty(), read_write()),
        Err(VmError::NotSupported)
    );
    assert_eq!(fx.vmm.shm_export(0, PAGE, ShmFlags::empty(), read_write()), Err(VmError::InvalidParams));
    assert!(fx.vmm.shm.is_empty());
}

#[test]
fn regular_commit_buffer_is_backed_and_mapped() {
    let fx = fixture();
    let handle = fx.create(3 * PAGE - 100, ShmKind::Regular, ShmFlags::COMMIT);
    let buffer = fx.vmm.shm_buffer(handle.id).unwrap();
    let address = handle.buffer.unwrap();

    assert_eq!(buffer.page_count(), 3);
    assert_eq!(fx.hal.frames.allocated_count(), 3);
    assert_eq!(fx.vmm.get_mapping(&fx.app, address, 3).unwrap(), buffer.pages());
    let descriptor = fx.vmm.query(&fx.app, address).unwrap();
    assert_eq!(descriptor.shm_tag, Some(handle.id));
    let pte = fx.hal.mmu.entry(&fx.app.platform(), address).unwrap();
    assert!(pte.flags.contains(MappingFlags::PERSISTENT));
    assert_eq!(fx.vmm.shm_kernel_mapping(handle.id), Err(VmError::NotSupported));
}

#[test]
fn device_buffer_is_uncached_and_conforming() {
    let fx = fixture();
    let descriptor = ShmDescriptor::new(2 * PAGE, ShmKind::Device).conformity(Conformity::Low);
    let mut handle = fx.vmm.shm_create(&descriptor).unwrap();
    let buffer = fx.vmm.shm_buffer(handle.id).unwrap();

    assert_eq!(buffer.page_mask(), Conformity::Low.page_mask());
    assert!(buffer.pages().iter().all(|&page| page + PAGE - 1 <= Conformity::Low.page_mask()));
    let pte = fx.hal.mmu.entry(&fx.app.platform(), handle.buffer.unwrap()).unwrap();
    assert!(pte.flags.contains(MappingFlags::NOCACHE | MappingFlags::PERSISTENT));

    fx.vmm.shm_detach(&mut handle).unwrap();
    assert_eq!(fx.hal.frames.allocated_count(), 0);
    assert_eq!(fx.hal.frames.double_frees(), 0);
}

#[test]
fn ipc_buffer_is_reachable_from_kernel() {
    let fx = fixture();
    let mut handle = fx.create(2 * PAGE, ShmKind::Ipc, ShmFlags::CLEAN);
    let user = handle.buffer.unwrap();
    let kernel = fx.vmm.shm_kernel_mapping(handle.id).unwrap();
    assert!(fx.hal.layout.global_access.contains(kernel));
    assert_eq!(fx.read_user(user, 16), vec![0u8; 16]);

    assert_eq!(fx.vmm.shm_write(handle.id, 0x10, b"hello"), Ok(5));
    assert_eq!(fx.read_user(user + 0x10, 5), b"hello");
    fx.write_user(user + PAGE, b"abc");
    let mut out = [0u8; 3];
    assert_eq!(fx.vmm.shm_read(handle.id, PAGE, &mut out), Ok(3));
    assert_eq!(&out, b"abc");

    let mut tail = [0u8; 8];
    assert_eq!(fx.vmm.shm_read(handle.id, 2 * PAGE - 2, &mut tail), Ok(2));
    assert_eq!(fx.vmm.shm_read(handle.id, 2 * PAGE + 1, &mut tail), Err(VmError::InvalidParams));

    fx.vmm.shm_detach(&mut handle).unwrap();
    assert!(fx.hal.mmu.entry(&fx.vmm.kernel_space().platform(), kernel).is_none());
    assert_eq!(fx.hal.frames.allocated_count(), 0);
}

#[test]
fn ipc_kernel_window_failure_unmaps_user_side() {
    let mut layout = MachineLayout::default();
    layout.global_access = Region::new(0xC000_0000, PAGE);
    let fx = fixture_with(layout);
    let kernel = fx.vmm.kernel_space().clone();
    // Exhaust the one-page global pool with a reserve-only mapping.
    let occupied = fx
        .vmm
        .map(&kernel, MapOptions::new(PAGE, MappingFlags::empty(), VirtualPlacement::Global))
        .unwrap();
    assert_eq!(occupied, 0xC000_0000);

    let descriptor = ShmDescriptor::new(2 * PAGE, ShmKind::Ipc);
    assert_eq!(fx.vmm.shm_create(&descriptor), Err(VmError::OutOfMemory));
    assert_eq!(fx.hal.frames.allocated_count(), 0);
    assert!(fx.app.context().unwrap().is_empty());
    assert_eq!(fx.hal.mmu.mapped_pages(&fx.app.platform()), 0);
    assert_eq!(fx.hal.mmu.global_pages(), 1);
    assert!(fx.vmm.shm.is_empty());
}

#[test]
fn trap_buffer_is_reserved_only() {
    let fx = fixture();
    let handle = fx.create(PAGE, ShmKind::Trap, ShmFlags::empty());
    let pte = fx.hal.mmu.entry(&fx.app.platform(), handle.buffer.unwrap()).unwrap();
    assert_eq!(pte.physical, 0);
    assert!(pte.flags.contains(MappingFlags::TRAPPAGE));
    assert_eq!(fx.hal.frames.allocated_count(), 0);

    let entries = fx.vmm.shm_scatter_gather(handle.id).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_hole());
}

#[test]
fn failed_create_leaves_nothing_behind() {
    let fx = fixture();
    fx.hal.frames.set_budget(Some(1));
    let descriptor = ShmDescriptor::new(3 * PAGE, ShmKind::Regular).flags(ShmFlags::COMMIT);
    assert_eq!(fx.vmm.shm_create(&descriptor), Err(VmError::OutOfMemory));
    assert!(fx.vmm.shm.is_empty());
    assert_eq!(fx.hal.frames.allocated_count(), 0);
    assert_eq!(fx.app.context().unwrap().len(), 0);
    fx.hal.frames.set_budget(None);

    assert_eq!(
        fx.vmm.shm_create(&ShmDescriptor::new(0, ShmKind::Regular)),
        Err(VmError::InvalidParams)
    );
}

#[cfg(feature = "failpoints")]
#[test]
fn id_exhaustion_is_out_of_memory() {
    let fx = fixture();
    fx.vmm.shm.deny_next_reserve();
    let descriptor = ShmDescriptor::new(PAGE, ShmKind::Regular).flags(ShmFlags::COMMIT);
    assert_eq!(fx.vmm.shm_create(&descriptor), Err(VmError::OutOfMemory));
    assert_eq!(fx.hal.frames.allocated_count(), 0);
}

#[test]
fn attach_and_detach_track_references() {
    let fx = fixture();
    let mut owner = fx.create(2 * PAGE, ShmKind::Regular, ShmFlags::COMMIT);
    let mut consumer = fx.vmm.shm_attach(owner.id).unwrap();
    assert!(!consumer.is_mapped());
    assert_eq!(consumer.capacity, 2 * PAGE);
    assert_eq!(fx.vmm.shm.references(owner.id), Some(2));

    fx.vmm.shm_detach(&mut owner).unwrap();
    assert_eq!(fx.hal.frames.allocated_count(), 2);
    fx.vmm.shm_detach(&mut consumer).unwrap();
    assert_eq!(fx.hal.frames.allocated_count(), 0);
    assert_eq!(fx.vmm.shm_attach(owner.id), Err(VmError::NotFound));
}

#[test]
fn private_buffer_rejects_unrelated_space() {
    let fx = fixture();
    let owner = fx.create(PAGE, ShmKind::Regular, ShmFlags::COMMIT | ShmFlags::PRIVATE);
    let (_, other) = fx.vmm.create_address_space(SpaceFlags::APPLICATION).unwrap();

    fx.enter(&other);
    assert_eq!(fx.vmm.shm_attach(owner.id), Err(VmError::Permissions));
    let options = ConformityOptions::default();
    assert_eq!(
        fx.vmm.shm_conform(owner.id, options, ConformFlags::empty(), read_write(), 0, PAGE),
        Err(VmError::Permissions)
    );
    assert_eq!(fx.vmm.shm.references(owner.id), Some(1));

    fx.enter(&fx.app);
    assert!(fx.vmm.shm_attach(owner.id).is_ok());
}

#[test]
fn mapping_updates_in_place_then_moves() {
    let fx = fixture();
    let owner = fx.create(4 * PAGE, ShmKind::Regular, ShmFlags::COMMIT);
    let pages = fx.vmm.shm_buffer(owner.id).unwrap().pages();
    let mut view = fx.vmm.shm_attach(owner.id).unwrap();
    let block = fx.app.platform();

    fx.vmm
        .shm_map(&mut view, 0, 2 * PAGE, ShmAccess::READ | ShmAccess::COMMIT)
        .unwrap();
    let first = view.buffer.unwrap();
    assert_eq!(fx.vmm.get_mapping(&fx.app, first, 2).unwrap(), pages[..2]);
    assert!(fx.hal.mmu.entry(&block, first).unwrap().flags.contains(MappingFlags::READONLY));

    fx.vmm.shm_map(&mut view, 0, PAGE, read_write()).unwrap();
    assert_eq!(view.buffer, Some(first));
    assert_eq!(view.length, 2 * PAGE);
    assert!(!fx.hal.mmu.entry(&block, first).unwrap().flags.contains(MappingFlags::READONLY));

    fx.vmm
        .shm_map(&mut view, PAGE, 2 * PAGE, read_write() | ShmAccess::COMMIT)
        .unwrap();
    let second = view.buffer.unwrap();
    assert_ne!(second, first);
    assert_eq!(view.offset, PAGE);
    assert!(fx.hal.mmu.entry(&block, first).is_none());
    assert_eq!(fx.vmm.get_mapping(&fx.app, second, 2).unwrap(), pages[1..3]);

    assert_eq!(fx.vmm.shm_map(&mut view, 4 * PAGE, PAGE, read_write()), Err(VmError::InvalidParams));
    assert_eq!(fx.vmm.shm_map(&mut view, 0, 0, read_write()), Err(VmError::InvalidParams));

    fx.vmm.shm_unmap(&mut view).unwrap();
    assert!(fx.hal.mmu.entry(&block, second).is_none());
    assert_eq!(fx.vmm.shm_unmap(&mut view), Err(VmError::InvalidParams));
    // Consumer mappings never own frames.
    assert_eq!(fx.hal.frames.allocated_count(), 4);
}

#[test]
fn map_length_is_clamped_to_buffer() {
    let fx = fixture();
    let owner = fx.create(2 * PAGE, ShmKind::Regular, ShmFlags::COMMIT);
    let mut view = fx.vmm.shm_attach(owner.id).unwrap();
    fx.vmm
        .shm_map(&mut view, PAGE + 8, 16 * PAGE, read_write() | ShmAccess::COMMIT)
        .unwrap();
    assert_eq!(view.length, PAGE);

    // A length whose span overflows still clamps to the buffer.
    fx.vmm.shm_map(&mut view, 8, usize::MAX, read_write()).unwrap();
    assert_eq!((view.offset, view.length), (8, 2 * PAGE));
}

#[test]
fn failed_remap_keeps_previous_view() {
    let fx = fixture();
    let other = fx.vmm.create_address_space(SpaceFlags::APPLICATION).unwrap().1;
    let owner = fx.create(3 * PAGE, ShmKind::Regular, ShmFlags::COMMIT);
    let mut view = fx.vmm.shm_attach(owner.id).unwrap();
    fx.vmm
        .shm_map(&mut view, 0, PAGE + 16, read_write() | ShmAccess::COMMIT)
        .unwrap();
    let first = view.buffer.unwrap();
    // A clone holds a second reference, so the partial release of the old view is refused.
    fx.vmm
        .clone_mapping(&fx.app, &other, first, VirtualPlacement::Process, PAGE, MappingFlags::USERSPACE)
        .unwrap();

    let context = fx.app.context().unwrap();
    let allocations = context.len();
    let entries = fx.hal.mmu.mapped_pages(&fx.app.platform());
    let frames = fx.hal.frames.allocated_count();
    let remap = fx.vmm.shm_map(&mut view, PAGE, PAGE, read_write() | ShmAccess::COMMIT);
    assert_eq!(remap, Err(VmError::Permissions));
    assert_eq!((view.buffer, view.offset, view.length), (Some(first), 0, PAGE + 16));
    assert_eq!(context.len(), allocations);
    assert_eq!(fx.hal.mmu.mapped_pages(&fx.app.platform()), entries);
    assert_eq!(fx.hal.frames.allocated_count(), frames);
}

#[test]
fn failed_scrub_leaves_page_unbacked() {
    let fx = fixture();
    let handle = fx.create(PAGE, ShmKind::Regular, ShmFlags::CLEAN);
    let address = handle.buffer.unwrap();
    let buffer = fx.vmm.shm_buffer(handle.id).unwrap();

    // The zeroing window is the next page-table install.
    fx.hal.mmu.fail_next_after(0);
    assert_eq!(fx.vmm.shm_commit(&handle, address, 16), Err(VmError::OutOfMemory));
    assert_eq!(buffer.pages(), vec![0]);
    assert_eq!(fx.hal.frames.allocated_count(), 0);

    fx.vmm.shm_commit(&handle, address, 16).unwrap();
    assert_ne!(buffer.pages()[0], 0);
    assert_eq!(fx.read_user(address, 16), vec![0u8; 16]);
}

#[test]
fn overflowing_buffer_lengths_are_rejected() {
    let fx = fixture();
    let source = fx.map_committed(PAGE);
    assert_eq!(
        fx.vmm.shm_export(source + 1, usize::MAX, ShmFlags::empty(), read_write()),
        Err(VmError::InvalidParams)
    );
    let huge = ShmDescriptor::new(usize::MAX, ShmKind::Regular);
    assert_eq!(fx.vmm.shm_create(&huge), Err(VmError::InvalidParams));

    let handle = fx.create(2 * PAGE, ShmKind::Regular, ShmFlags::empty());
    let address = handle.buffer.unwrap();
    assert_eq!(fx.vmm.shm_commit(&handle, address + 1, usize::MAX), Err(VmError::InvalidParams));
    assert!(fx.vmm.shm_buffer(handle.id).unwrap().pages().iter().all(|&page| page == 0));
    assert_eq!(fx.hal.frames.allocated_count(), 1);
}

#[test]
fn lazy_buffer_commits_on_demand() {
    let fx = fixture();
    let handle = fx.create(3 * PAGE, ShmKind::Regular, ShmFlags::CLEAN);
    let address = handle.buffer.unwrap();
    let buffer = fx.vmm.shm_buffer(handle.id).unwrap();
    assert!(buffer.pages().iter().all(|&page| page == 0));
    assert_eq!(fx.vmm.is_page_present(&fx.app, address), Ok(false));

    fx.vmm.shm_commit(&handle, address + PAGE + 8, 16).unwrap();
    let pages = buffer.pages();
    assert_eq!((pages[0] != 0, pages[1] != 0, pages[2] != 0), (false, true, false));
    assert_eq!(fx.vmm.get_mapping(&fx.app, address + PAGE, 1).unwrap(), vec![pages[1]]);
    assert_eq!(fx.read_user(address + PAGE, 32), vec![0u8; 32]);
    assert_eq!(fx.hal.frames.allocated_count(), 1);

    assert_eq!(fx.vmm.shm_commit(&handle, address + 2 * PAGE, 2 * PAGE), Err(VmError::InvalidParams));
    assert_eq!(fx.vmm.shm_commit(&handle, address, 0), Err(VmError::InvalidParams));
}

#[test]
fn consumer_commit_backs_shared_pages_once() {
    let fx = fixture();
    let owner = fx.create(2 * PAGE, ShmKind::Regular, ShmFlags::empty());
    let mut view = fx.vmm.shm_attach(owner.id).unwrap();
    fx.vmm
        .shm_map(&mut view, 0, 2 * PAGE, read_write() | ShmAccess::COMMIT)
        .unwrap();
    let pages = fx.vmm.shm_buffer(owner.id).unwrap().pages();
    assert!(pages.iter().all(|&page| page != 0));
    assert_eq!(fx.vmm.is_page_present(&fx.app, owner.buffer.unwrap()), Ok(false));

    fx.vmm.shm_commit(&owner, owner.buffer.unwrap(), 2 * PAGE).unwrap();
    assert_eq!(fx.vmm.get_mapping(&fx.app, owner.buffer.unwrap(), 2).unwrap(), pages);
    assert_eq!(fx.hal.frames.allocated_count(), 2);
}

#[test]
fn conforming_source_is_attached() {
    let fx = fixture();
    let owner = fx.create(3 * PAGE, ShmKind::Regular, ShmFlags::COMMIT);
    let entries = fx.vmm.shm.len();

    let handle = fx
        .vmm
        .shm_conform(
            owner.id,
            ConformityOptions::default(),
            ConformFlags::empty(),
            read_write() | ShmAccess::COMMIT,
            0,
            3 * PAGE,
        )
        .unwrap();
    assert_eq!(handle.id, owner.id);
    assert_eq!(handle.source_id, None);
    assert_eq!(fx.vmm.shm.len(), entries);
    assert_eq!(fx.vmm.shm.references(owner.id), Some(2));
    let pages = fx.vmm.shm_buffer(owner.id).unwrap().pages();
    assert_eq!(fx.vmm.get_mapping(&fx.app, handle.buffer.unwrap(), 3).unwrap(), pages);
}

#[test]
fn nonconforming_source_is_cloned_with_fill_and_backfill() {
    let fx = fixture();
    let owner = fx.create(2 * PAGE, ShmKind::Regular, ShmFlags::COMMIT);
    let source = owner.buffer.unwrap();
    assert!(fx.vmm.shm_buffer(owner.id).unwrap().pages().iter().all(|&page| page >= FOUR_GIB));
    let content = pattern(2 * PAGE);
    fx.write_user(source, &content);

    let options = ConformityOptions { alignment: 0, conformity: Conformity::Bits32 };
    let flags = ConformFlags::FILL_ON_CREATION | ConformFlags::BACKFILL_ON_UNMAP;
    let mut clone = fx
        .vmm
        .shm_conform(owner.id, options, flags, read_write(), 0x10, 2 * PAGE)
        .unwrap();
    assert_ne!(clone.id, owner.id);
    assert_eq!(clone.source_id, Some(owner.id));
    assert_eq!(clone.source_offset, 0x10);
    assert_eq!(clone.capacity, 2 * PAGE - 0x10);
    assert_eq!(fx.vmm.shm.references(owner.id), Some(2));

    let buffer = fx.vmm.shm_buffer(clone.id).unwrap();
    assert!(buffer.pages().iter().all(|&page| page + PAGE - 1 < FOUR_GIB));
    let view = clone.buffer.unwrap();
    assert_eq!(fx.read_user(view, 0x40), content[0x10..0x50]);
    assert_eq!(fx.read_user(view + PAGE, 8), content[PAGE + 0x10..PAGE + 0x18]);
    assert_eq!(
        fx.vmm.shm_map(&mut clone, 0, PAGE, read_write()),
        Err(VmError::NotSupported)
    );

    fx.write_user(view, &[1, 2, 3, 4]);
    fx.vmm.shm_detach(&mut clone).unwrap();
    assert_eq!(fx.read_user(source + 0x10, 4), vec![1, 2, 3, 4]);
    assert_eq!(fx.read_user(source, 0x10), content[..0x10]);
    assert_eq!(fx.vmm.shm_buffer(buffer.id()).err(), Some(VmError::NotFound));
    assert_eq!(fx.vmm.shm.references(owner.id), Some(1));
    assert_eq!(fx.hal.frames.allocated_count(), 2);
}

#[test]
fn clone_without_backfill_leaves_source_alone() {
    let fx = fixture();
    let owner = fx.create(PAGE, ShmKind::Regular, ShmFlags::COMMIT);
    let source = owner.buffer.unwrap();
    fx.write_user(source, &[9; 8]);

    let options = ConformityOptions { alignment: 0, conformity: Conformity::Low };
    let mut clone = fx
        .vmm
        .shm_conform(owner.id, options, ConformFlags::empty(), read_write(), 0, PAGE)
        .unwrap();
    let view = clone.buffer.unwrap();
    // No fill: fresh frames keep whatever the allocator left there.
    assert_ne!(fx.read_user(view, 8), vec![9; 8]);
    fx.write_user(view, &[7; 8]);
    fx.vmm.shm_detach(&mut clone).unwrap();
    assert_eq!(fx.read_user(source, 8), vec![9; 8]);
}

#[test]
fn conform_rejects_bad_ranges() {
    let fx = fixture();
    let owner = fx.create(PAGE, ShmKind::Regular, ShmFlags::COMMIT);
    let options = ConformityOptions::default();
    let flags = ConformFlags::empty();
    assert_eq!(
        fx.vmm.shm_conform(owner.id, options, flags, read_write(), PAGE, PAGE),
        Err(VmError::InvalidParams)
    );
    assert_eq!(
        fx.vmm.shm_conform(owner.id, options, flags, read_write(), 0, 0),
        Err(VmError::InvalidParams)
    );
    let odd = ConformityOptions { alignment: 24, conformity: Conformity::None };
    assert_eq!(
        fx.vmm.shm_conform(owner.id, odd, flags, read_write(), 0, PAGE),
        Err(VmError::InvalidParams)
    );
    assert_eq!(fx.vmm.shm.references(owner.id), Some(1));
}

#[test]
fn fill_from_unbacked_source_fails_cleanly() {
    let fx = fixture();
    let owner = fx.create(PAGE, ShmKind::Regular, ShmFlags::empty());
    let entries = fx.vmm.shm.len();
    let options = ConformityOptions { alignment: 0, conformity: Conformity::Bits32 };
    assert_eq!(
        fx.vmm
            .shm_conform(owner.id, options, ConformFlags::FILL_ON_CREATION, read_write(), 0, PAGE),
        Err(VmError::Buffer)
    );
    assert_eq!(fx.vmm.shm.len(), entries);
    assert_eq!(fx.vmm.shm.references(owner.id), Some(1));
    assert_eq!(fx.hal.frames.allocated_count(), 0);
}

#[test]
fn keyed_buffers_are_discoverable() {
    let fx = fixture();
    let descriptor = ShmDescriptor::new(PAGE, ShmKind::Ipc).key("display/fb0");
    let mut handle = fx.vmm.shm_create(&descriptor).unwrap();
    assert_eq!(fx.vmm.shm_lookup("display/fb0"), Ok(handle.id));
    assert_eq!(fx.vmm.shm_create(&descriptor), Err(VmError::InvalidParams));
    assert_eq!(fx.vmm.shm.len(), 1);

    fx.vmm.shm_detach(&mut handle).unwrap();
    assert_eq!(fx.vmm.shm_lookup("display/fb0"), Err(VmError::NotFound));
}
