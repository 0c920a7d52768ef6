use crate::diag::fs::FileHandle;
use crate::mem::flags::{CacheMode, MemFlags, UserMemType};
use crate::mem::{EntryId, PageHandle, Pid};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use tracing::debug;

// Lifecycle states packed into an AtomicU8.
// 0 = Alive, 1 = PendingFree (owner started teardown), 2 = Freed
const ALIVE: u8 = 0;
const PENDING_FREE: u8 = 1;
const FREED: u8 = 2;

/// One sparse-virtual binding: a span of the virtual allocation backed at
/// some offset of a sparse-physical allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseBinding {
    pub size: u64,
    pub phys_offset: u64,
}

/// Everything a process supplies when registering an allocation.
#[derive(Debug, Clone, Default)]
pub struct EntryDescriptor {
    pub gpuaddr: u64,
    pub size: u64,
    pub flags: MemFlags,
    pub cache: CacheMode,
    pub align_log2: u8,
    pub usage: u8,
    pub mem_type: UserMemType,
    pub metadata: Option<String>,
    pub pages: Vec<Option<PageHandle>>,
}

impl EntryDescriptor {
    #[must_use]
    pub fn new(gpuaddr: u64, size: u64) -> Self {
        Self {
            gpuaddr,
            size,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: MemFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn align_log2(mut self, align_log2: u8) -> Self {
        self.align_log2 = align_log2;
        self
    }

    #[must_use]
    pub fn usage(mut self, usage: u8) -> Self {
        self.usage = usage;
        self
    }

    #[must_use]
    pub fn mem_type(mut self, mem_type: UserMemType) -> Self {
        self.mem_type = mem_type;
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Backing pages in allocation order; `None` marks a hole.
    #[must_use]
    pub fn pages(mut self, pages: Vec<Option<PageHandle>>) -> Self {
        self.pages = pages;
        self
    }
}

/// A reference-counted memory allocation record.
///
/// The count starts at 1 for the owning process. Every concurrent viewer
/// (an enumeration cursor or an open per-entry view) holds one more via
/// [`EntryRef`]. Once the owner begins teardown the entry goes
/// pending-free: new viewers are refused, in-flight viewers finish, and
/// the last reference out runs the single finalize step.
#[derive(Debug)]
pub struct MemEntry {
    id: EntryId,
    owner: Pid,
    gpuaddr: u64,
    size: u64,
    flags: MemFlags,
    cache: CacheMode,
    align_log2: u8,
    usage: u8,
    mem_type: UserMemType,
    metadata: Option<String>,
    page_count: usize,
    pages: Mutex<Vec<Option<PageHandle>>>,
    bindings: Mutex<BTreeMap<u64, SparseBinding>>,
    map_count: AtomicU32,
    refs: AtomicU32,
    state: AtomicU8,
    diag_node: Mutex<Option<FileHandle>>,
}

impl MemEntry {
    pub(crate) fn new(id: EntryId, owner: Pid, desc: EntryDescriptor) -> Self {
        Self {
            id,
            owner,
            gpuaddr: desc.gpuaddr,
            size: desc.size,
            flags: desc.flags,
            cache: desc.cache,
            align_log2: desc.align_log2,
            usage: desc.usage,
            mem_type: desc.mem_type,
            metadata: desc.metadata,
            page_count: desc.pages.len(),
            pages: Mutex::new(desc.pages),
            bindings: Mutex::new(BTreeMap::new()),
            map_count: AtomicU32::new(0),
            refs: AtomicU32::new(1),
            state: AtomicU8::new(ALIVE),
            diag_node: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub fn owner(&self) -> Pid {
        self.owner
    }

    #[must_use]
    pub fn gpuaddr(&self) -> u64 {
        self.gpuaddr
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    #[must_use]
    pub fn cache_mode(&self) -> CacheMode {
        self.cache
    }

    #[must_use]
    pub fn align_log2(&self) -> u8 {
        self.align_log2
    }

    #[must_use]
    pub fn usage(&self) -> u8 {
        self.usage
    }

    #[must_use]
    pub fn mem_type(&self) -> UserMemType {
        self.mem_type
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.flags.contains(MemFlags::GLOBAL)
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.flags.contains(MemFlags::SECURE)
    }

    #[must_use]
    pub fn is_sparse_virtual(&self) -> bool {
        self.flags.contains(MemFlags::SPARSE_VIRT)
    }

    #[must_use]
    pub fn is_sparse_physical(&self) -> bool {
        self.flags.contains(MemFlags::SPARSE_PHYS)
    }

    #[must_use]
    pub fn uses_cpu_map(&self) -> bool {
        self.flags.contains(MemFlags::USE_CPU_MAP)
    }

    #[must_use]
    pub fn gpu_writable(&self) -> bool {
        !self.flags.contains(MemFlags::GPU_READONLY)
    }

    /// Length of the backing page list, fixed at registration. Holes count.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// The page handle at `index`, or `None` for a hole or out-of-range
    /// index.
    ///
    /// # Panics
    ///
    /// Panics if the page list mutex is poisoned.
    #[must_use]
    pub fn page(&self, index: usize) -> Option<PageHandle> {
        self.pages.lock().unwrap().get(index).copied().flatten()
    }

    /// Number of present (non-hole) backing pages; the `sglen` column.
    ///
    /// # Panics
    ///
    /// Panics if the page list mutex is poisoned.
    #[must_use]
    pub fn sg_len(&self) -> usize {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.is_some())
            .count()
    }

    /// Live virtual-memory mappings of this entry. Monitoring only; the
    /// value feeds the `Y`/`N` mapped flag and the `mapcount` column.
    #[must_use]
    pub fn map_count(&self) -> u32 {
        self.map_count.load(Ordering::Relaxed)
    }

    pub fn mark_mapped(&self) {
        self.map_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_unmapped(&self) {
        self.map_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a sparse binding at `virt_offset`, replacing any previous
    /// binding at the same offset.
    ///
    /// # Panics
    ///
    /// Panics if the binding mutex is poisoned.
    pub fn bind(&self, virt_offset: u64, size: u64, phys_offset: u64) {
        self.bindings
            .lock()
            .unwrap()
            .insert(virt_offset, SparseBinding { size, phys_offset });
    }

    /// Removes the binding at `virt_offset`. Returns whether one existed.
    ///
    /// # Panics
    ///
    /// Panics if the binding mutex is poisoned.
    pub fn unbind(&self, virt_offset: u64) -> bool {
        self.bindings.lock().unwrap().remove(&virt_offset).is_some()
    }

    /// Visits all sparse bindings in virtual-offset order while holding the
    /// binding lock.
    ///
    /// # Panics
    ///
    /// Panics if the binding mutex is poisoned.
    pub fn with_bindings<F>(&self, mut f: F)
    where
        F: FnMut(u64, &SparseBinding),
    {
        for (off, binding) in self.bindings.lock().unwrap().iter() {
            f(*off, binding);
        }
    }

    /// Current reference count. Diagnostic value only; it may change
    /// before the caller looks at it.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_pending_free(&self) -> bool {
        self.state.load(Ordering::Acquire) != ALIVE
    }

    /// Takes a viewer reference, refusing entries that are pending free,
    /// already freed, or whose count has reached zero.
    pub(crate) fn try_get(self: &Arc<Self>) -> Option<EntryRef> {
        if self.state.load(Ordering::Acquire) != ALIVE {
            return None;
        }

        let mut refs = self.refs.load(Ordering::Relaxed);
        loop {
            if refs == 0 {
                return None;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(EntryRef {
                        entry: Arc::clone(self),
                    });
                }
                Err(current) => refs = current,
            }
        }
    }

    /// Owner teardown: marks the entry pending-free and drops the owning
    /// reference. Idempotent; only the first call releases.
    pub(crate) fn release(&self) {
        if self
            .state
            .compare_exchange(ALIVE, PENDING_FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.put();
        }
    }

    fn put(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1
            && self
                .state
                .compare_exchange(PENDING_FREE, FREED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.finalize();
        }
    }

    // Runs exactly once, guarded by the PendingFree -> Freed transition.
    fn finalize(&self) {
        self.pages.lock().unwrap().clear();
        self.bindings.lock().unwrap().clear();
        // Dropping the handle removes the entry's diagnostic file.
        drop(self.diag_node.lock().unwrap().take());
        debug!("finalized mem entry {} of process {}", self.id, self.owner);
    }

    pub(crate) fn attach_diag_node(&self, handle: FileHandle) {
        *self.diag_node.lock().unwrap() = Some(handle);
    }
}

/// RAII viewer reference to a [`MemEntry`].
///
/// Dropping the reference releases it; the last release after the owner
/// has started teardown finalizes the entry.
#[derive(Debug)]
pub struct EntryRef {
    entry: Arc<MemEntry>,
}

impl EntryRef {
    #[must_use]
    pub(crate) fn shared(&self) -> &Arc<MemEntry> {
        &self.entry
    }
}

impl Deref for EntryRef {
    type Target = MemEntry;

    fn deref(&self) -> &MemEntry {
        &self.entry
    }
}

impl Clone for EntryRef {
    fn clone(&self) -> Self {
        // A reference is already held, so the count cannot be zero here.
        self.entry.refs.fetch_add(1, Ordering::Relaxed);
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.entry.put();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alive_entry(id: EntryId) -> Arc<MemEntry> {
        let desc = EntryDescriptor::new(0x5000_0000, 4096).pages(vec![Some(PageHandle(1))]);
        Arc::new(MemEntry::new(id, 100, desc))
    }

    #[test]
    fn test_refcount_starts_at_one() {
        let entry = alive_entry(1);
        assert_eq!(entry.ref_count(), 1);
        assert!(!entry.is_pending_free());
    }

    #[test]
    fn test_try_get_and_drop_balance() {
        let entry = alive_entry(1);
        let viewer = entry.try_get().unwrap();
        assert_eq!(entry.ref_count(), 2);
        let second = viewer.clone();
        assert_eq!(entry.ref_count(), 3);
        drop(second);
        drop(viewer);
        assert_eq!(entry.ref_count(), 1);
    }

    #[test]
    fn test_release_refuses_new_viewers() {
        let entry = alive_entry(7);
        entry.release();
        assert!(entry.is_pending_free());
        assert!(entry.try_get().is_none());
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let entry = alive_entry(7);
        let viewer = entry.try_get().unwrap();
        entry.release();
        entry.release();
        assert_eq!(entry.ref_count(), 1);
        drop(viewer);
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn test_viewer_defers_finalize() {
        let entry = alive_entry(3);
        let viewer = entry.try_get().unwrap();

        entry.release();
        // The viewer still holds the entry; pages survive until it drops.
        assert_eq!(entry.page(0), Some(PageHandle(1)));

        drop(viewer);
        assert_eq!(entry.ref_count(), 0);
        assert_eq!(entry.page(0), None);
    }

    #[test]
    fn test_bindings_iterate_in_offset_order() {
        let entry = alive_entry(9);
        entry.bind(0x3000, 0x1000, 0x9000);
        entry.bind(0x1000, 0x1000, 0x4000);
        entry.bind(0x2000, 0x1000, 0x6000);

        let mut offsets = Vec::new();
        entry.with_bindings(|off, _| offsets.push(off));
        assert_eq!(offsets, vec![0x1000, 0x2000, 0x3000]);

        assert!(entry.unbind(0x2000));
        assert!(!entry.unbind(0x2000));
    }

    #[test]
    fn test_sg_len_skips_holes() {
        let desc = EntryDescriptor::new(0, 3 * 4096).pages(vec![
            Some(PageHandle(1)),
            None,
            Some(PageHandle(2)),
        ]);
        let entry = MemEntry::new(1, 100, desc);
        assert_eq!(entry.page_count(), 3);
        assert_eq!(entry.sg_len(), 2);
    }
}
