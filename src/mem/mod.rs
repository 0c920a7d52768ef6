pub mod cursor;
pub mod entry;
pub mod flags;
pub mod process;
pub mod registry;

/// Process identifier, as reported by the OS.
pub type Pid = u32;

/// Registry-scoped entry identifier. Allocated monotonically starting at 1
/// and never reused while the registry exists.
pub type EntryId = u32;

/// Size of one backing page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Opaque handle to one physical backing page.
///
/// The directory never dereferences a handle itself; it only stores them and
/// passes them to a [`PageMapper`] when a dump needs the page contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle(pub u64);

/// A page temporarily mapped into CPU-addressable memory.
///
/// Produced by [`PageMapper::map`] and handed back to [`PageMapper::unmap`]
/// once the caller has copied what it needs. The contents are only valid
/// between those two calls.
#[derive(Debug)]
pub struct MappedPage {
    handle: PageHandle,
    ptr: *const u8,
    len: usize,
}

impl MappedPage {
    /// Wraps a raw mapping produced by a [`PageMapper`] implementation.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes until the mapping is
    /// passed back to [`PageMapper::unmap`].
    #[must_use]
    pub unsafe fn new(handle: PageHandle, ptr: *const u8, len: usize) -> Self {
        Self { handle, ptr, len }
    }

    #[must_use]
    pub fn handle(&self) -> PageHandle {
        self.handle
    }

    /// The mapped page contents.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // Validity for self's lifetime is the construction contract; unmap
        // consumes the mapping by value.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Maps individual backing pages in and out of CPU-addressable memory.
///
/// The directory holds no mapping across the copy step: a dump maps one
/// page, copies it into a scratch buffer, and unmaps before formatting.
pub trait PageMapper: Send + Sync {
    /// Maps a single page. `None` means the mapping could not be
    /// established right now; the page's output is silently empty.
    fn map(&self, page: PageHandle) -> Option<MappedPage>;

    /// Releases a mapping produced by [`PageMapper::map`].
    fn unmap(&self, mapping: MappedPage);
}

// Re-export the directory building blocks for easy access
pub use cursor::EntryCursor;
pub use entry::{EntryDescriptor, EntryRef, MemEntry, SparseBinding};
pub use flags::{CacheMode, MemFlags, UserMemType};
pub use process::{ProcessRecord, ProcessTable};
pub use registry::EntryRegistry;
