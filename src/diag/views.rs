use crate::diag::gate::{AccessGate, Identity};
use crate::diag::render::{self, MemClassifier};
use crate::diag::seq::SeqSource;
use crate::error::GmdResult;
use crate::mem::cursor::EntryCursor;
use crate::mem::entry::{EntryRef, MemEntry};
use crate::mem::process::ProcessRecord;
use crate::mem::{PAGE_SIZE, PageMapper};
use crate::utils::{HEX_ROW_SIZE, hex_dump_line};
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Renders the device's global page-table entries. Opaque to this crate;
/// invoked once per read of the `globals` view.
pub trait GlobalPtSource: Send + Sync {
    fn render_global_entries(&self, out: &mut String);
}

// Shared pieces every view needs: who is asking, how rows are classified,
// and whether addresses are disclosed.
pub(crate) struct ViewContext {
    pub gate: Arc<AccessGate>,
    pub classifier: Arc<dyn MemClassifier>,
    pub mapper: Arc<dyn PageMapper>,
    pub requester: Identity,
    pub restrict_addresses: Arc<AtomicBool>,
}

impl ViewContext {
    // The restriction is global configuration; every fill observes the
    // current value rather than the one at open time.
    fn restrict(&self) -> bool {
        self.restrict_addresses.load(Ordering::Relaxed)
    }
}

/// Dumps one backing page of an entry as hex lines into `out`.
///
/// Out-of-range indices are rejected before any mapping attempt. A hole
/// or a failed temporary mapping produces zero output and no error. The
/// mapping is released as soon as the page has been copied; formatting
/// never runs against live mapped memory.
///
/// # Errors
///
/// Returns [`GmdError::PageIndexOutOfRange`] when `index` does not name a
/// slot in the entry's page list.
///
/// [`GmdError::PageIndexOutOfRange`]: crate::error::GmdError::PageIndexOutOfRange
pub fn dump_page(
    entry: &MemEntry,
    index: usize,
    mapper: &dyn PageMapper,
    restrict_addresses: bool,
    out: &mut String,
) -> GmdResult<()> {
    if index >= entry.page_count() {
        return Err(crate::error::GmdError::PageIndexOutOfRange {
            index,
            count: entry.page_count(),
        });
    }

    // Skip unallocated pages.
    let Some(handle) = entry.page(index) else {
        return Ok(());
    };

    let Some(mapping) = mapper.map(handle) else {
        debug!(
            "transient map failure for page {} of entry {}",
            index,
            entry.id()
        );
        return Ok(());
    };

    let mut buf = [0u8; PAGE_SIZE];
    let len = mapping.bytes().len().min(PAGE_SIZE);
    buf[..len].copy_from_slice(&mapping.bytes()[..len]);
    mapper.unmap(mapping);

    let page_offset = (index * PAGE_SIZE) as u64;
    let base = if restrict_addresses {
        0
    } else {
        entry.gpuaddr()
    };

    for (i, row) in buf[..len].chunks(HEX_ROW_SIZE).enumerate() {
        let offset = base + page_offset + (i * HEX_ROW_SIZE) as u64;
        let _ = write!(out, "{offset:016x}: ");
        hex_dump_line(row, out);
        out.push('\n');
    }
    Ok(())
}

// What the current position points at within a row-oriented view.
enum RowState {
    Header,
    Entry,
}

/// Per-process listing: the header row at position 0, then one row per
/// live, non-sparse-virtual entry in ascending id order. Each fill pass
/// re-runs the access gate before producing anything.
pub(crate) struct ProcessMemSeq {
    ctx: ViewContext,
    record: Arc<ProcessRecord>,
    cursor: EntryCursor,
    state: RowState,
}

impl ProcessMemSeq {
    pub(crate) fn new(ctx: ViewContext, record: Arc<ProcessRecord>) -> Self {
        let cursor = EntryCursor::new(Arc::clone(record.registry()));
        Self {
            ctx,
            record,
            cursor,
            state: RowState::Header,
        }
    }
}

impl SeqSource for ProcessMemSeq {
    fn start(&mut self, pos: u64) -> GmdResult<bool> {
        self.ctx.gate.check(self.record.pid(), &self.ctx.requester)?;
        if pos == 0 {
            self.state = RowState::Header;
            return Ok(true);
        }
        self.state = RowState::Entry;
        Ok(self.cursor.seek(pos).is_some())
    }

    fn show(&mut self, out: &mut String) -> GmdResult<()> {
        match self.state {
            RowState::Header => render::header_row(out),
            RowState::Entry => {
                if let Some(entry) = self.cursor.current() {
                    render::entry_row(
                        entry,
                        self.ctx.classifier.as_ref(),
                        self.ctx.restrict(),
                        out,
                    );
                }
            }
        }
        Ok(())
    }

    fn next(&mut self) -> GmdResult<bool> {
        let next = match self.state {
            RowState::Header => {
                self.state = RowState::Entry;
                self.cursor.seek(1)
            }
            RowState::Entry => self.cursor.advance(),
        };
        Ok(next.is_some())
    }

    fn stop(&mut self) {
        self.cursor.stop();
    }
}

/// Per-process sparse-binding listing: header, then one blank-line
/// separated binding block per sparse-virtual entry. Walks the same
/// registry positions as the row listing; non-sparse entries render
/// nothing at their position.
pub(crate) struct SparseMemSeq {
    ctx: ViewContext,
    record: Arc<ProcessRecord>,
    cursor: EntryCursor,
    state: RowState,
}

impl SparseMemSeq {
    pub(crate) fn new(ctx: ViewContext, record: Arc<ProcessRecord>) -> Self {
        let cursor = EntryCursor::new(Arc::clone(record.registry()));
        Self {
            ctx,
            record,
            cursor,
            state: RowState::Header,
        }
    }
}

impl SeqSource for SparseMemSeq {
    fn start(&mut self, pos: u64) -> GmdResult<bool> {
        self.ctx.gate.check(self.record.pid(), &self.ctx.requester)?;
        if pos == 0 {
            self.state = RowState::Header;
            return Ok(true);
        }
        self.state = RowState::Entry;
        Ok(self.cursor.seek(pos).is_some())
    }

    fn show(&mut self, out: &mut String) -> GmdResult<()> {
        match self.state {
            RowState::Header => render::sparse_header(out),
            RowState::Entry => {
                if let Some(entry) = self.cursor.current() {
                    render::sparse_entry_rows(entry, out);
                }
            }
        }
        Ok(())
    }

    fn next(&mut self) -> GmdResult<bool> {
        let next = match self.state {
            RowState::Header => {
                self.state = RowState::Entry;
                self.cursor.seek(1)
            }
            RowState::Entry => self.cursor.advance(),
        };
        Ok(next.is_some())
    }

    fn stop(&mut self) {
        self.cursor.stop();
    }
}

/// Per-entry view: the summary row at position 0, then one hex block per
/// backing page. Holds a viewer reference across each fill pass so the
/// entry cannot be finalized mid-dump; an entry already pending free
/// reads as empty rather than erroring.
pub(crate) struct MemEntrySeq {
    ctx: ViewContext,
    entry: Arc<MemEntry>,
    viewer: Option<EntryRef>,
    // Page index currently shown; `None` means the summary row.
    page: Option<usize>,
}

impl MemEntrySeq {
    pub(crate) fn new(ctx: ViewContext, entry: Arc<MemEntry>) -> Self {
        Self {
            ctx,
            entry,
            viewer: None,
            page: None,
        }
    }
}

impl SeqSource for MemEntrySeq {
    fn start(&mut self, pos: u64) -> GmdResult<bool> {
        self.ctx
            .gate
            .check(self.entry.owner(), &self.ctx.requester)?;

        let Some(viewer) = self.entry.try_get() else {
            // Being torn down; the view reads as already gone.
            return Ok(false);
        };
        let pages = viewer.page_count() as u64;
        self.viewer = Some(viewer);

        if pos == 0 {
            self.page = None;
            Ok(true)
        } else if pos <= pages {
            self.page = Some((pos - 1) as usize);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn show(&mut self, out: &mut String) -> GmdResult<()> {
        let Some(viewer) = self.viewer.as_ref() else {
            return Ok(());
        };
        match self.page {
            None => render::entry_row(
                viewer,
                self.ctx.classifier.as_ref(),
                self.ctx.restrict(),
                out,
            ),
            Some(index) => dump_page(
                viewer,
                index,
                self.ctx.mapper.as_ref(),
                self.ctx.restrict(),
                out,
            )?,
        }
        Ok(())
    }

    fn next(&mut self) -> GmdResult<bool> {
        let Some(viewer) = self.viewer.as_ref() else {
            return Ok(false);
        };
        let next = match self.page {
            None => 0,
            Some(index) => index + 1,
        };
        if next < viewer.page_count() {
            self.page = Some(next);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn stop(&mut self) {
        self.viewer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::entry::EntryDescriptor;
    use crate::mem::{MappedPage, PageHandle};
    use std::sync::Mutex;

    // Serves one in-memory page per handle and counts map calls.
    struct VecMapper {
        pages: Vec<Box<[u8; PAGE_SIZE]>>,
        maps: Mutex<usize>,
        fail: bool,
    }

    impl VecMapper {
        fn new(pages: Vec<Box<[u8; PAGE_SIZE]>>) -> Self {
            Self {
                pages,
                maps: Mutex::new(0),
                fail: false,
            }
        }
    }

    impl PageMapper for VecMapper {
        fn map(&self, page: PageHandle) -> Option<MappedPage> {
            *self.maps.lock().unwrap() += 1;
            if self.fail {
                return None;
            }
            let bytes = self.pages.get(page.0 as usize)?;
            Some(unsafe { MappedPage::new(page, bytes.as_ptr(), PAGE_SIZE) })
        }

        fn unmap(&self, _mapping: MappedPage) {}
    }

    fn patterned_page(seed: u8) -> Box<[u8; PAGE_SIZE]> {
        let mut page = Box::new([0u8; PAGE_SIZE]);
        for (i, b) in page.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        page
    }

    #[test]
    fn test_dump_page_rejects_out_of_range_before_mapping() {
        let mapper = VecMapper::new(vec![patterned_page(0)]);
        let entry = MemEntry::new(
            1,
            100,
            EntryDescriptor::new(0, 4096).pages(vec![Some(PageHandle(0))]),
        );

        let mut out = String::new();
        assert!(dump_page(&entry, 1, &mapper, false, &mut out).is_err());
        assert_eq!(*mapper.maps.lock().unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_dump_page_hole_is_silent() {
        let mapper = VecMapper::new(vec![patterned_page(0)]);
        let entry = MemEntry::new(
            1,
            100,
            EntryDescriptor::new(0, 2 * 4096).pages(vec![Some(PageHandle(0)), None]),
        );

        let mut out = String::new();
        dump_page(&entry, 1, &mapper, false, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(*mapper.maps.lock().unwrap(), 0);
    }

    #[test]
    fn test_dump_page_map_failure_is_silent() {
        let mut mapper = VecMapper::new(vec![patterned_page(0)]);
        mapper.fail = true;
        let entry = MemEntry::new(
            1,
            100,
            EntryDescriptor::new(0, 4096).pages(vec![Some(PageHandle(0))]),
        );

        let mut out = String::new();
        dump_page(&entry, 0, &mapper, false, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(*mapper.maps.lock().unwrap(), 1);
    }

    #[test]
    fn test_dump_page_offsets_and_line_count() {
        let mapper = VecMapper::new(vec![patterned_page(0)]);
        let entry = MemEntry::new(
            1,
            100,
            EntryDescriptor::new(0xa000_0000, 2 * 4096)
                .pages(vec![None, Some(PageHandle(0))]),
        );

        let mut out = String::new();
        dump_page(&entry, 1, &mapper, false, &mut out).unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), PAGE_SIZE / HEX_ROW_SIZE);
        // Page 1 starts one page past the base address.
        assert!(lines[0].starts_with("00000000a0001000: "));
        assert!(lines[1].starts_with("00000000a0001020: "));
    }

    #[test]
    fn test_dump_page_restriction_drops_base_address() {
        let mapper = VecMapper::new(vec![patterned_page(0)]);
        let entry = MemEntry::new(
            1,
            100,
            EntryDescriptor::new(0xa000_0000, 4096).pages(vec![Some(PageHandle(0))]),
        );

        let mut out = String::new();
        dump_page(&entry, 0, &mapper, true, &mut out).unwrap();
        assert!(out.starts_with("0000000000000000: "));
    }
}
