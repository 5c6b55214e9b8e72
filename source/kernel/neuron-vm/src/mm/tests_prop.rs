// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the allocation ledger
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; drives AddressSpaceContext directly without an MMU.
//!
//! TEST_SCOPE:
//!   - Live allocations never overlap, whatever the allocation/free interleaving
//!   - Reference counts converge: N acquires need N+1 releases
//!   - Partial releases require the sole reference
//!
//! TEST_SCENARIOS:
//!   - live_allocations_are_disjoint(): random allocate/free script keeps records disjoint
//!   - references_converge(): extra references keep the record until the last release
//!   - partial_release_needs_sole_reference(): shared records refuse head releases

extern crate alloc;

use alloc::vec::Vec;

use super::flags::MappingFlags;
use super::ledger::AddressSpaceContext;
use crate::config::MachineLayout;
use crate::error::{Progress, VmError};
use crate::types::{page_align_up, SpaceId, VirtAddr, PAGE_SIZE};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Step {
    Allocate(usize),
    Free(usize),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1usize..=8 * PAGE_SIZE).prop_map(Step::Allocate),
        any::<usize>().prop_map(Step::Free),
    ]
}

fn context() -> AddressSpaceContext {
    let layout = MachineLayout::default();
    AddressSpaceContext::new(layout.user_heap, layout.granularity)
}

fn owner() -> SpaceId {
    SpaceId::from_raw(1).unwrap()
}

proptest! {
    #[test]
    fn live_allocations_are_disjoint(script in proptest::collection::vec(arb_step(), 1..48)) {
        let context = context();
        let mut live: Vec<(VirtAddr, usize)> = Vec::new();
        for step in script {
            match step {
                Step::Allocate(length) => {
                    let (base, _) = context.allocate_tracked(owner(), length, MappingFlags::USERSPACE, None).unwrap();
                    live.push((base, page_align_up(length)));
                }
                Step::Free(pick) if !live.is_empty() => {
                    let (base, length) = live.swap_remove(pick % live.len());
                    let outcome = context.reduce_or_free(base, length).unwrap();
                    prop_assert_eq!(outcome.progress, Progress::Complete);
                    prop_assert_eq!(outcome.remaining, 0);
                    context.heap_free(base);
                }
                Step::Free(_) => {}
            }
            prop_assert_eq!(context.len(), live.len());
            for (i, &(a, a_len)) in live.iter().enumerate() {
                for &(b, b_len) in live.iter().skip(i + 1) {
                    prop_assert!(a + a_len <= b || b + b_len <= a);
                }
                let recorded = context.lookup(a + a_len - 1).unwrap();
                prop_assert_eq!((recorded.base, recorded.length), (a, a_len));
            }
        }
    }

    #[test]
    fn references_converge(pages in 1usize..8, extra in 0u32..6) {
        let context = context();
        let (base, _) = context.allocate_tracked(owner(), pages * PAGE_SIZE, MappingFlags::USERSPACE, None).unwrap();
        for _ in 0..extra {
            prop_assert!(context.acquire(base).is_some());
        }
        for remaining in (1..=extra).rev() {
            let outcome = context.reduce_or_free(base, pages * PAGE_SIZE).unwrap();
            prop_assert_eq!(outcome.progress, Progress::Incomplete);
            prop_assert_eq!((outcome.base, outcome.remaining), (base, pages * PAGE_SIZE));
            prop_assert_eq!(context.lookup(base).unwrap().references, remaining);
        }
        let outcome = context.reduce_or_free(base, pages * PAGE_SIZE).unwrap();
        prop_assert_eq!(outcome.progress, Progress::Complete);
        prop_assert_eq!(outcome.freed, pages * PAGE_SIZE);
        prop_assert!(context.lookup(base).is_none());
    }

    #[test]
    fn partial_release_needs_sole_reference(pages in 2usize..8, release in 1usize..PAGE_SIZE * 7, shared in any::<bool>()) {
        let length = pages * PAGE_SIZE;
        prop_assume!(release < length);
        let context = context();
        let (base, _) = context.allocate_tracked(owner(), length, MappingFlags::USERSPACE, None).unwrap();
        if shared {
            context.acquire(base).unwrap();
            prop_assert_eq!(context.reduce_or_free(base, release).map(|o| o.progress), Err(VmError::Permissions));
            prop_assert_eq!(context.lookup(base).unwrap().references, 2);
        } else {
            let outcome = context.reduce_or_free(base, release).unwrap();
            prop_assert_eq!(outcome.progress, Progress::Complete);
            let keep = length - page_align_up(release);
            prop_assert_eq!(outcome.remaining, keep);
            prop_assert_eq!(context.lookup(base).map(|a| a.length), (keep > 0).then_some(keep));
        }
    }
}
