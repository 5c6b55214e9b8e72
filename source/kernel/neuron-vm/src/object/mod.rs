// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Reference-counted kernel object directory (address spaces, SHM buffers)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: HandleTable{reserve,install,abandon,insert,acquire,lookup,release,register_path,lookup_path}
//! DEPENDS_ON: types::HandleKey
//! INVARIANTS: Ids encode slot index and generation; a released slot never resolves again

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::num::NonZeroU32;
#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{VmError, VmResult};
use crate::types::HandleKey;

const INDEX_BITS: u32 = 16;
const MAX_SLOTS: usize = (1 << INDEX_BITS) - 1;

fn encode(index: usize, generation: u16) -> Option<NonZeroU32> {
    NonZeroU32::new(((generation as u32) << INDEX_BITS) | (index as u32 + 1))
}

fn decode(raw: NonZeroU32) -> (usize, u16) {
    let value = raw.get();
    (((value & MAX_SLOTS as u32) as usize).wrapping_sub(1), (value >> INDEX_BITS) as u16)
}

struct Entry<T> {
    /// `None` while reserved but not yet installed.
    object: Option<Arc<T>>,
    references: u32,
    path: Option<String>,
}

struct Slot<T> {
    generation: u16,
    entry: Option<Entry<T>>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

/// Directory of shared objects addressed by generation-checked ids.
pub struct HandleTable<K, T> {
    inner: spin::Mutex<Inner<T>>,
    #[cfg(feature = "failpoints")]
    deny_next_reserve: AtomicBool,
    #[cfg(feature = "failpoints")]
    deny_next_install: AtomicBool,
    _key: PhantomData<fn() -> K>,
}

impl<K: HandleKey, T> Default for HandleTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HandleKey, T> HandleTable<K, T> {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(Inner { slots: Vec::new(), free: Vec::new() }),
            #[cfg(feature = "failpoints")]
            deny_next_reserve: AtomicBool::new(false),
            #[cfg(feature = "failpoints")]
            deny_next_install: AtomicBool::new(false),
            _key: PhantomData,
        }
    }

    /// Test hook: the next reservation reports out-of-memory.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_reserve(&self) {
        self.deny_next_reserve.store(true, Ordering::SeqCst);
    }

    /// Test hook: the next install reports out-of-memory and leaves the id reserved.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_install(&self) {
        self.deny_next_install.store(true, Ordering::SeqCst);
    }

    /// Allocates an id whose object is installed later; lookups skip it until then.
    pub fn reserve(&self) -> VmResult<K> {
        #[cfg(feature = "failpoints")]
        if self.deny_next_reserve.swap(false, Ordering::SeqCst) {
            return Err(VmError::OutOfMemory);
        }
        let mut inner = self.inner.lock();
        let entry = Entry { object: None, references: 1, path: None };
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                if inner.slots.len() >= MAX_SLOTS {
                    return Err(VmError::OutOfMemory);
                }
                inner.slots.try_reserve(1).map_err(|_| VmError::OutOfMemory)?;
                inner.slots.push(Slot { generation: 0, entry: None });
                inner.slots.len() - 1
            }
        };
        let slot = &mut inner.slots[index];
        slot.entry = Some(entry);
        let raw = encode(index, slot.generation).ok_or(VmError::Unknown)?;
        Ok(K::from_raw_id(raw))
    }

    /// Publishes the object behind a reserved id.
    pub fn install(&self, id: K, object: Arc<T>) -> VmResult<()> {
        #[cfg(feature = "failpoints")]
        if self.deny_next_install.swap(false, Ordering::SeqCst) {
            return Err(VmError::OutOfMemory);
        }
        let mut inner = self.inner.lock();
        let entry = Self::entry_mut(&mut inner, id).ok_or(VmError::NotFound)?;
        if entry.object.is_some() {
            return Err(VmError::InvalidParams);
        }
        entry.object = Some(object);
        Ok(())
    }

    /// Drops a reserved id that never got an object.
    pub fn abandon(&self, id: K) {
        let mut inner = self.inner.lock();
        let reserved = Self::entry_mut(&mut inner, id).is_some_and(|entry| entry.object.is_none());
        if reserved {
            Self::retire(&mut inner, id);
        }
    }

    /// Reserves an id and installs `object` under it in one step.
    pub fn insert(&self, object: Arc<T>) -> VmResult<K> {
        let id = self.reserve()?;
        self.install(id, object)?;
        Ok(id)
    }

    /// Adds a reference and returns the object.
    pub fn acquire(&self, id: K) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        let entry = Self::entry_mut(&mut inner, id)?;
        let object = entry.object.clone()?;
        entry.references = entry.references.checked_add(1)?;
        Some(object)
    }

    /// Returns the object without touching its reference count.
    pub fn lookup(&self, id: K) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        Self::entry_mut(&mut inner, id)?.object.clone()
    }

    /// Drops one reference; yields the object once the last reference is gone.
    pub fn release(&self, id: K) -> VmResult<Option<Arc<T>>> {
        let mut inner = self.inner.lock();
        let entry = Self::entry_mut(&mut inner, id).ok_or(VmError::NotFound)?;
        if entry.object.is_none() {
            return Err(VmError::NotFound);
        }
        entry.references -= 1;
        if entry.references > 0 {
            return Ok(None);
        }
        let object = entry.object.take();
        Self::retire(&mut inner, id);
        Ok(object)
    }

    pub fn references(&self, id: K) -> Option<u32> {
        let mut inner = self.inner.lock();
        Self::entry_mut(&mut inner, id).map(|entry| entry.references)
    }

    /// Binds a discovery path to `id`; paths are unique within the table.
    pub fn register_path(&self, id: K, path: &str) -> VmResult<()> {
        if path.is_empty() {
            return Err(VmError::InvalidParams);
        }
        let mut inner = self.inner.lock();
        let taken = inner
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .any(|entry| entry.path.as_deref() == Some(path));
        if taken {
            return Err(VmError::InvalidParams);
        }
        let entry = Self::entry_mut(&mut inner, id).ok_or(VmError::NotFound)?;
        let mut owned = String::new();
        owned.try_reserve(path.len()).map_err(|_| VmError::OutOfMemory)?;
        owned.push_str(path);
        entry.path = Some(owned);
        Ok(())
    }

    pub fn lookup_path(&self, path: &str) -> Option<K> {
        let inner = self.inner.lock();
        inner.slots.iter().enumerate().find_map(|(index, slot)| {
            let entry = slot.entry.as_ref()?;
            if entry.object.is_some() && entry.path.as_deref() == Some(path) {
                encode(index, slot.generation).map(K::from_raw_id)
            } else {
                None
            }
        })
    }

    /// Number of live or reserved ids.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_mut(inner: &mut Inner<T>, id: K) -> Option<&mut Entry<T>> {
        let (index, generation) = decode(id.raw_id());
        let slot = inner.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn retire(inner: &mut Inner<T>, id: K) {
        let (index, _) = decode(id.raw_id());
        if let Some(slot) = inner.slots.get_mut(index) {
            slot.entry = None;
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShmId;

    type Table = HandleTable<ShmId, u32>;

    #[test]
    fn acquire_release_counts_references() {
        let table = Table::new();
        let id = table.insert(Arc::new(7)).unwrap();
        assert_eq!(table.acquire(id).map(|v| *v), Some(7));
        assert_eq!(table.references(id), Some(2));
        assert_eq!(table.release(id), Ok(None));
        assert_eq!(table.release(id).unwrap().map(|v| *v), Some(7));
        assert!(table.lookup(id).is_none());
        assert_eq!(table.release(id), Err(VmError::NotFound));
    }

    #[test]
    fn stale_ids_do_not_resolve_after_reuse() {
        let table = Table::new();
        let first = table.insert(Arc::new(1)).unwrap();
        let _ = table.release(first).unwrap();
        let second = table.insert(Arc::new(2)).unwrap();
        assert_ne!(first, second);
        assert!(table.lookup(first).is_none());
        assert_eq!(table.lookup(second).map(|v| *v), Some(2));
    }

    #[test]
    fn reserved_ids_are_invisible_until_installed() {
        let table = Table::new();
        let id = table.reserve().unwrap();
        assert!(table.lookup(id).is_none());
        assert!(table.acquire(id).is_none());
        table.install(id, Arc::new(3)).unwrap();
        assert_eq!(table.install(id, Arc::new(4)), Err(VmError::InvalidParams));
        assert_eq!(table.lookup(id).map(|v| *v), Some(3));

        let abandoned = table.reserve().unwrap();
        table.abandon(abandoned);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn paths_are_unique_and_resolve() {
        let table = Table::new();
        let id = table.insert(Arc::new(5)).unwrap();
        table.register_path(id, "/shm/display").unwrap();
        let other = table.insert(Arc::new(6)).unwrap();
        assert_eq!(table.register_path(other, "/shm/display"), Err(VmError::InvalidParams));
        assert_eq!(table.lookup_path("/shm/display"), Some(id));
        assert_eq!(table.lookup_path("/shm/none"), None);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn denied_reservation_reports_oom() {
        let table = Table::new();
        table.deny_next_reserve();
        assert_eq!(table.reserve(), Err(VmError::OutOfMemory));
        assert!(table.reserve().is_ok());
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn denied_install_keeps_id_reserved() {
        let table = Table::new();
        let id = table.reserve().unwrap();
        table.deny_next_install();
        assert_eq!(table.install(id, Arc::new(7)), Err(VmError::OutOfMemory));
        assert_eq!(table.lookup(id), None);
        table.abandon(id);
        assert!(table.is_empty());
    }
}
