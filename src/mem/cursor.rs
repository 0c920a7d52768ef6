use crate::mem::entry::EntryRef;
use crate::mem::registry::EntryRegistry;
use std::sync::Arc;

/// Restartable, position-indexed walk over a registry that mutates
/// underneath it.
///
/// Positions are 1-based ordinals into an id-ordered walk taken at the
/// moment of each call; they are not indices into a stable snapshot, so
/// concurrent removals shift what a given position means. Resuming from a
/// position re-walks from the start of the id space, and stepping forward
/// resumes from the last yielded id. The walk never yields a freed entry;
/// whether it sees entries inserted or removed mid-walk is best effort.
///
/// The cursor holds a reference on the entry it currently points at. The
/// reference is released when superseded by the next step, by [`stop`],
/// or by dropping the cursor, whichever comes first.
///
/// [`stop`]: EntryCursor::stop
pub struct EntryCursor {
    registry: Arc<EntryRegistry>,
    current: Option<EntryRef>,
}

impl EntryCursor {
    #[must_use]
    pub fn new(registry: Arc<EntryRegistry>) -> Self {
        Self {
            registry,
            current: None,
        }
    }

    /// Re-derives position `pos` (1-based) by walking from the beginning
    /// of the id space. Worst-case O(n); the accepted cost of a
    /// low-frequency diagnostic path.
    pub fn seek(&mut self, pos: u64) -> Option<&EntryRef> {
        let next = self.registry.find_from(None, pos.saturating_sub(1));
        self.replace(next)
    }

    /// Steps forward from the last yielded id. Returns `None` when the
    /// walk is exhausted or nothing has been yielded yet.
    pub fn advance(&mut self) -> Option<&EntryRef> {
        let after = self.current.as_ref()?.id();
        let next = self.registry.find_from(Some(after), 0);
        self.replace(next)
    }

    #[must_use]
    pub fn current(&self) -> Option<&EntryRef> {
        self.current.as_ref()
    }

    /// Releases the current reference, if any. Dropping the cursor has the
    /// same effect.
    pub fn stop(&mut self) {
        self.current = None;
    }

    // The previous reference is released only after its replacement has
    // been acquired.
    fn replace(&mut self, next: Option<EntryRef>) -> Option<&EntryRef> {
        let previous = std::mem::replace(&mut self.current, next);
        drop(previous);
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::entry::EntryDescriptor;
    use crate::mem::{MemEntry, PageHandle};

    fn registry_with(n: usize) -> Arc<EntryRegistry> {
        let registry = Arc::new(EntryRegistry::new(100));
        for i in 0..n {
            registry.insert(
                EntryDescriptor::new(0x1000 * (i as u64 + 1), 4096)
                    .pages(vec![Some(PageHandle(i as u64))]),
            );
        }
        registry
    }

    fn collect_entries(registry: &Arc<EntryRegistry>) -> Vec<Arc<MemEntry>> {
        let mut entries = Vec::new();
        registry.with_entries(|e| entries.push(Arc::clone(e)));
        entries
    }

    #[test]
    fn test_walk_yields_strictly_increasing_ids() {
        let registry = registry_with(5);
        let mut cursor = EntryCursor::new(Arc::clone(&registry));

        let mut ids = Vec::new();
        let mut next = cursor.seek(1).map(|e| e.id());
        while let Some(id) = next {
            ids.push(id);
            next = cursor.advance().map(|e| e.id());
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_resume_skips_entries_removed_in_between() {
        let registry = registry_with(4);
        let mut cursor = EntryCursor::new(Arc::clone(&registry));

        assert_eq!(cursor.seek(1).unwrap().id(), 1);

        let removed = registry.remove(2).unwrap();
        removed.release();

        assert_eq!(cursor.advance().unwrap().id(), 3);
        assert_eq!(cursor.advance().unwrap().id(), 4);
        assert!(cursor.advance().is_none());
    }

    #[test]
    fn test_seek_recounts_positions_after_removal() {
        let registry = registry_with(4);
        let mut cursor = EntryCursor::new(Arc::clone(&registry));

        assert_eq!(cursor.seek(2).unwrap().id(), 2);

        let removed = registry.remove(1).unwrap();
        removed.release();

        // Position 2 now means a different id; re-derivation is by count,
        // not by remembered index.
        assert_eq!(cursor.seek(2).unwrap().id(), 3);
    }

    #[test]
    fn test_early_stop_releases_exactly_what_was_acquired() {
        let registry = registry_with(3);
        let entries = collect_entries(&registry);

        let mut cursor = EntryCursor::new(Arc::clone(&registry));
        cursor.seek(1);
        cursor.advance();
        // Stop mid-walk: only the in-hand reference is outstanding.
        assert_eq!(entries[1].ref_count(), 2);
        cursor.stop();

        for entry in &entries {
            assert_eq!(entry.ref_count(), 1);
        }
    }

    #[test]
    fn test_dropping_cursor_releases_reference() {
        let registry = registry_with(1);
        let entries = collect_entries(&registry);

        let mut cursor = EntryCursor::new(Arc::clone(&registry));
        cursor.seek(1);
        assert_eq!(entries[0].ref_count(), 2);
        drop(cursor);
        assert_eq!(entries[0].ref_count(), 1);
    }

    #[test]
    fn test_advance_without_position_yields_nothing() {
        let registry = registry_with(2);
        let mut cursor = EntryCursor::new(registry);
        assert!(cursor.advance().is_none());
    }
}
