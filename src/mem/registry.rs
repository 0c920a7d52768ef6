use crate::mem::entry::{EntryDescriptor, EntryRef, MemEntry};
use crate::mem::{EntryId, Pid};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

struct Inner {
    map: BTreeMap<EntryId, Arc<MemEntry>>,
    next_id: EntryId,
}

/// Per-process id -> entry map.
///
/// One mutex serializes every mutation and lookup; lookups only ever
/// return fully-constructed entries. Ids count up from 1 and are not
/// reused for the registry's lifetime, so a cursor resuming from
/// `last id + 1` lands exactly where an uninterrupted walk would have.
pub struct EntryRegistry {
    owner: Pid,
    inner: Mutex<Inner>,
}

impl EntryRegistry {
    #[must_use]
    pub fn new(owner: Pid) -> Self {
        Self {
            owner,
            inner: Mutex::new(Inner {
                map: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    #[must_use]
    pub fn owner(&self) -> Pid {
        self.owner
    }

    /// Allocates a fresh id and stores a new entry under it.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned.
    pub fn insert(&self, desc: EntryDescriptor) -> Arc<MemEntry> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        let entry = Arc::new(MemEntry::new(id, self.owner, desc));
        inner.map.insert(id, Arc::clone(&entry));
        entry
    }

    /// Takes a viewer reference on the entry with this id, if it is still
    /// live and referenceable.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned.
    #[must_use]
    pub fn lookup(&self, id: EntryId) -> Option<EntryRef> {
        self.inner.lock().unwrap().map.get(&id)?.try_get()
    }

    /// The referenceable entry with the smallest id strictly greater than
    /// `after`.
    #[must_use]
    pub fn lookup_next(&self, after: EntryId) -> Option<EntryRef> {
        self.find_from(Some(after), 0)
    }

    /// Walks ids ascending, strictly greater than `after` (or from the
    /// start when `None`), steps over `skip` entries, then yields the
    /// first entry a reference can be taken on. Entries whose acquisition
    /// fails (concurrently finalized) are stepped over and the walk
    /// continues.
    ///
    /// The whole walk happens under one lock hold, so it observes a
    /// consistent snapshot of the map.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned.
    #[must_use]
    pub fn find_from(&self, after: Option<EntryId>, mut skip: u64) -> Option<EntryRef> {
        let inner = self.inner.lock().unwrap();
        let range = match after {
            None => inner.map.range(..),
            Some(id) => inner.map.range((Bound::Excluded(id), Bound::Unbounded)),
        };

        for entry in range.map(|(_, e)| e) {
            if skip > 0 {
                skip -= 1;
                continue;
            }
            if let Some(viewer) = entry.try_get() {
                return Some(viewer);
            }
        }
        None
    }

    /// Unlinks the id from the map. The entry itself lives on until its
    /// references drain; cursors hold references, not map slots.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned.
    pub fn remove(&self, id: EntryId) -> Option<Arc<MemEntry>> {
        self.inner.lock().unwrap().map.remove(&id)
    }

    /// Unlinks and returns every entry, in id order.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned.
    pub fn drain(&self) -> Vec<Arc<MemEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let map = std::mem::take(&mut inner.map);
        map.into_values().collect()
    }

    /// Visits every entry in id order while holding the registry lock.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned.
    pub fn with_entries<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<MemEntry>),
    {
        for entry in self.inner.lock().unwrap().map.values() {
            f(entry);
        }
    }

    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PageHandle;

    fn registry_with(n: usize) -> EntryRegistry {
        let registry = EntryRegistry::new(100);
        for i in 0..n {
            registry.insert(
                EntryDescriptor::new(0x1000 * (i as u64 + 1), 4096)
                    .pages(vec![Some(PageHandle(i as u64))]),
            );
        }
        registry
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let registry = registry_with(3);
        assert_eq!(registry.len(), 3);

        let removed = registry.remove(2).unwrap();
        removed.release();

        let entry = registry.insert(EntryDescriptor::new(0x9000, 4096));
        assert_eq!(entry.id(), 4);
    }

    #[test]
    fn test_lookup_next_walks_in_id_order() {
        let registry = registry_with(3);
        assert_eq!(registry.lookup_next(0).unwrap().id(), 1);
        assert_eq!(registry.lookup_next(1).unwrap().id(), 2);
        assert_eq!(registry.lookup_next(3).map(|e| e.id()), None);
    }

    #[test]
    fn test_find_from_counts_positions() {
        let registry = registry_with(4);
        assert_eq!(registry.find_from(None, 0).unwrap().id(), 1);
        assert_eq!(registry.find_from(None, 2).unwrap().id(), 3);
        assert_eq!(registry.find_from(Some(2), 1).unwrap().id(), 4);
        assert!(registry.find_from(None, 4).is_none());
    }

    #[test]
    fn test_walk_steps_over_pending_free_entries() {
        let registry = registry_with(3);
        let second = registry.lookup(2).unwrap();
        second.shared().release();

        // Position 1 lands on the pending-free id 2; the walk moves on.
        assert_eq!(registry.find_from(None, 1).unwrap().id(), 3);
        assert!(registry.lookup(2).is_none());
        drop(second);
    }

    #[test]
    fn test_drain_returns_everything_in_order() {
        let registry = registry_with(3);
        let ids: Vec<_> = registry.drain().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(registry.is_empty());
    }
}
