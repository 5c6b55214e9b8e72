// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for scatter-gather lists and buffer export
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; export properties run against the software HAL.
//!
//! TEST_SCOPE:
//!   - Run lists cover the content exactly and are maximal
//!   - Export preserves the caller's in-page offset for any start and size
//!   - Conforming a clone under its own constraint reuses it
//!
//! TEST_SCENARIOS:
//!   - runs_cover_content_and_are_maximal(): lengths sum to the content, neighbours never merge
//!   - runs_expand_back_to_pages(): expand(build(pages)) restores the page array
//!   - export_preserves_offset(): offset and page count follow the requested start
//!   - conformed_clone_conforms_again(): a second conform under the same mask attaches the clone

extern crate alloc;

use alloc::vec::Vec;

use super::sg::{self, SgEntry};
use super::{ConformFlags, ConformityOptions, ShmAccess, ShmDescriptor, ShmFlags, ShmKind};
use crate::config::{Conformity, MachineLayout};
use crate::hal::soft::SoftHal;
use crate::mm::{MapOptions, MappingFlags, SpaceFlags, VirtualPlacement};
use crate::types::{page_count, PhysAddr, PAGE_SIZE};
use crate::vmm::Vmm;
use proptest::prelude::*;

/// Page arrays made of contiguous runs, scattered runs and holes.
fn arb_pages() -> impl Strategy<Value = Vec<PhysAddr>> {
    proptest::collection::vec((0usize..3, 1usize..5, 1usize..0x100), 1..8).prop_map(|runs| {
        let mut pages = Vec::new();
        for (kind, length, frame) in runs {
            for index in 0..length {
                pages.push(match kind {
                    0 => 0,
                    1 => (frame + index) * PAGE_SIZE,
                    _ => (frame + 2 * index) * PAGE_SIZE,
                });
            }
        }
        pages
    })
}

fn arb_conformity() -> impl Strategy<Value = Conformity> {
    prop_oneof![Just(Conformity::Low), Just(Conformity::Bits32)]
}

fn mergeable(left: &SgEntry, right: &SgEntry) -> bool {
    (left.is_hole() && right.is_hole()) || (!left.is_hole() && left.address + left.length == right.address)
}

proptest! {
    #[test]
    fn runs_cover_content_and_are_maximal(pages in arb_pages(), offset in 0usize..PAGE_SIZE) {
        let entries = sg::build(&pages, offset);
        let total: usize = entries.iter().map(|entry| entry.length).sum();
        prop_assert_eq!(total, pages.len() * PAGE_SIZE - offset);
        for pair in entries.windows(2) {
            prop_assert!(!mergeable(&pair[0], &pair[1]));
        }
    }

    #[test]
    fn runs_expand_back_to_pages(pages in arb_pages(), offset in 0usize..PAGE_SIZE) {
        prop_assert_eq!(sg::expand(&sg::build(&pages, offset), offset), pages);
    }

    #[test]
    fn export_preserves_offset(offset in 0usize..PAGE_SIZE, size in 1usize..6 * PAGE_SIZE) {
        let hal = SoftHal::new(MachineLayout::default(), 1);
        let vmm = Vmm::new(hal.machine()).unwrap();
        let (id, app) = vmm.create_address_space(SpaceFlags::APPLICATION).unwrap();
        hal.mesh.set_core(0, Some(id), None);
        let flags = MappingFlags::USERSPACE | MappingFlags::COMMIT;
        let base = vmm.map(&app, MapOptions::new(8 * PAGE_SIZE, flags, VirtualPlacement::Process)).unwrap();

        let handle = vmm
            .shm_export(base + offset, size, ShmFlags::empty(), ShmAccess::READ)
            .unwrap();
        let buffer = vmm.shm_buffer(handle.id).unwrap();
        prop_assert_eq!(buffer.offset(), offset);
        prop_assert_eq!(buffer.page_count(), page_count(offset + size));
        prop_assert_eq!(buffer.length(), size);
        let expected = vmm.get_mapping(&app, base, buffer.page_count()).unwrap();
        prop_assert_eq!(buffer.pages(), expected);
    }

    #[test]
    fn conformed_clone_conforms_again(conformity in arb_conformity(), pages in 1usize..4) {
        let hal = SoftHal::new(MachineLayout::default(), 1);
        let vmm = Vmm::new(hal.machine()).unwrap();
        let (id, _) = vmm.create_address_space(SpaceFlags::APPLICATION).unwrap();
        hal.mesh.set_core(0, Some(id), None);
        let descriptor = ShmDescriptor::new(pages * PAGE_SIZE, ShmKind::Regular).flags(ShmFlags::COMMIT);
        let source = vmm.shm_create(&descriptor).unwrap();

        let options = ConformityOptions { alignment: 0, conformity };
        let access = ShmAccess::READ | ShmAccess::WRITE;
        let clone = vmm
            .shm_conform(source.id, options, ConformFlags::empty(), access, 0, pages * PAGE_SIZE)
            .unwrap();
        prop_assert_ne!(clone.id, source.id);
        let again = vmm
            .shm_conform(clone.id, options, ConformFlags::empty(), access, 0, pages * PAGE_SIZE)
            .unwrap();
        prop_assert_eq!(again.id, clone.id);
        prop_assert_eq!(again.source_id, None);
    }
}
