use crate::error::{GmdError, GmdResult};
use crate::mem::{MappedPage, PAGE_SIZE, PageHandle, PageMapper};
use std::io;
use std::ptr;
use std::sync::Mutex;

/// Fixed-capacity pool of anonymous RAM pages, handed out as opaque
/// [`PageHandle`]s and mapped back in through the [`PageMapper`] trait.
///
/// Stands in for the platform's physical-page allocator: one anonymous
/// mmap region backs the whole pool, handles index into it, and the pool
/// unmaps the region when dropped.
pub struct RamPagePool {
    base: *mut u8,
    capacity: usize,
    next: Mutex<usize>,
}

// The region is owned exclusively by the pool and only ever handed out
// as read-only mappings or written through `write`, which the caller
// serializes per page.
unsafe impl Send for RamPagePool {}
unsafe impl Sync for RamPagePool {}

impl RamPagePool {
    /// Reserves an anonymous region of `capacity` pages.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error when the region cannot be mapped.
    pub fn new(capacity: usize) -> GmdResult<Self> {
        let len = capacity.max(1) * PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(GmdError::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            base: base.cast::<u8>(),
            capacity: capacity.max(1),
            next: Mutex::new(0),
        })
    }

    /// Hands out the next unused page.
    ///
    /// # Errors
    ///
    /// Fails once the pool is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if the allocation mutex is poisoned.
    pub fn alloc_page(&self) -> GmdResult<PageHandle> {
        let mut next = self.next.lock().unwrap();
        if *next >= self.capacity {
            return Err(GmdError::General(String::from("page pool exhausted")));
        }
        let handle = PageHandle(*next as u64);
        *next += 1;
        Ok(handle)
    }

    /// Fills a page with `bytes`, starting at `offset`. Writes past the
    /// page end are truncated.
    pub fn write(&self, page: PageHandle, offset: usize, bytes: &[u8]) {
        let Some(ptr) = self.page_ptr(page) else {
            return;
        };
        if offset >= PAGE_SIZE {
            return;
        }
        let len = bytes.len().min(PAGE_SIZE - offset);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), len);
        }
    }

    fn page_ptr(&self, page: PageHandle) -> Option<*mut u8> {
        let index = usize::try_from(page.0).ok()?;
        if index >= self.capacity {
            return None;
        }
        Some(unsafe { self.base.add(index * PAGE_SIZE) })
    }
}

impl PageMapper for RamPagePool {
    fn map(&self, page: PageHandle) -> Option<MappedPage> {
        let ptr = self.page_ptr(page)?;
        Some(unsafe { MappedPage::new(page, ptr, PAGE_SIZE) })
    }

    fn unmap(&self, _mapping: MappedPage) {
        // Pages stay resident in the pool region; the mapping was a view,
        // not a separate resource.
    }
}

impl Drop for RamPagePool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.capacity * PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_write_map_roundtrip() {
        let pool = RamPagePool::new(2).unwrap();
        let page = pool.alloc_page().unwrap();
        pool.write(page, 0, b"kgsl");

        let mapping = pool.map(page).unwrap();
        assert_eq!(&mapping.bytes()[..4], b"kgsl");
        assert_eq!(mapping.bytes().len(), PAGE_SIZE);
        pool.unmap(mapping);
    }

    #[test]
    fn test_fresh_pages_are_zeroed() {
        let pool = RamPagePool::new(1).unwrap();
        let page = pool.alloc_page().unwrap();
        let mapping = pool.map(page).unwrap();
        assert!(mapping.bytes().iter().all(|&b| b == 0));
        pool.unmap(mapping);
    }

    #[test]
    fn test_exhaustion_fails_cleanly() {
        let pool = RamPagePool::new(1).unwrap();
        pool.alloc_page().unwrap();
        assert!(pool.alloc_page().is_err());
    }

    #[test]
    fn test_unknown_handle_does_not_map() {
        let pool = RamPagePool::new(1).unwrap();
        assert!(pool.map(PageHandle(5)).is_none());
    }

    #[test]
    fn test_write_is_truncated_at_page_end() {
        let pool = RamPagePool::new(1).unwrap();
        let page = pool.alloc_page().unwrap();
        pool.write(page, PAGE_SIZE - 2, b"abcd");

        let mapping = pool.map(page).unwrap();
        assert_eq!(&mapping.bytes()[PAGE_SIZE - 2..], b"ab");
        pool.unmap(mapping);
    }
}
