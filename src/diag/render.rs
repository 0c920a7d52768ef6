use crate::mem::entry::MemEntry;
use crate::mem::flags::{self, UserMemType, align_flag};
use std::borrow::Cow;
use std::fmt::Write;

/// Surface bookkeeping for dma-buf backed entries, supplied by the
/// graphics stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurfaceCounts {
    pub surfaces: u32,
    pub images: u32,
    pub total: u32,
}

/// Classifies backing memory for the listing columns.
///
/// The usage labels have a standard table; implementations usually only
/// provide [`surface_counts`], which needs visibility into the dma-buf
/// subsystem that this crate does not have.
///
/// [`surface_counts`]: MemClassifier::surface_counts
pub trait MemClassifier: Send + Sync {
    fn usage_label(&self, usage: u8) -> Cow<'static, str> {
        flags::usage_label(usage)
    }

    fn surface_counts(&self, entry: &MemEntry) -> SurfaceCounts;
}

/// Standard labels, no surface bookkeeping.
#[derive(Debug, Default)]
pub struct DefaultClassifier;

impl MemClassifier for DefaultClassifier {
    fn surface_counts(&self, _entry: &MemEntry) -> SurfaceCounts {
        SurfaceCounts::default()
    }
}

/// Column header for the per-process listing.
pub fn header_row(out: &mut String) {
    let _ = writeln!(
        out,
        "{:>16} {:>16} {:>16} {:>5} {:>9} {:>10} {:>16} {:>5} {:>16} {:>6} {:>6}",
        "gpuaddr",
        "useraddr",
        "size",
        "id",
        "flags",
        "type",
        "usage",
        "sglen",
        "mapcount",
        "eglsrf",
        "eglimg"
    );
}

// Fixed-order flag string; each position has a dedicated meaning.
fn flag_string(entry: &MemEntry) -> String {
    let mut s = String::with_capacity(9);
    s.push(if entry.is_global() { 'g' } else { '-' });
    s.push('-');
    s.push(if entry.gpu_writable() { 'w' } else { '-' });
    s.push(align_flag(entry.align_log2()));
    s.push(entry.cache_mode().flag_char());
    s.push(if entry.uses_cpu_map() { 'p' } else { '-' });
    // Y if at least one vma maps this entry (could be several).
    s.push(if entry.map_count() > 0 { 'Y' } else { 'N' });
    s.push(if entry.is_secure() { 's' } else { '-' });
    s.push(if entry.is_sparse_physical() { 'P' } else { '-' });
    s
}

/// One listing row for a non-sparse-virtual entry. Sparse-virtual
/// entries render nothing here; they belong to the sparse listing.
pub fn entry_row(
    entry: &MemEntry,
    classifier: &dyn MemClassifier,
    restrict_addresses: bool,
    out: &mut String,
) {
    if entry.is_sparse_virtual() {
        return;
    }

    let counts = if entry.mem_type() == UserMemType::DmaBuf {
        classifier.surface_counts(entry)
    } else {
        SurfaceCounts::default()
    };

    let gpuaddr = if restrict_addresses {
        0
    } else {
        entry.gpuaddr()
    };

    let _ = write!(
        out,
        "{:016x} {:016x} {:>16} {:>5} {:>9} {:>10} {:>16} {:>5} {:>16} {:>6} {:>6}",
        gpuaddr,
        // Zero for the useraddr: it cannot be tracked across multiple
        // vmas anyway.
        0u64,
        entry.size(),
        entry.id(),
        flag_string(entry),
        entry.mem_type().label(),
        classifier.usage_label(entry.usage()),
        entry.sg_len(),
        entry.map_count(),
        counts.surfaces,
        counts.images
    );

    if let Some(metadata) = entry.metadata() {
        let _ = write!(out, " {metadata}");
    }
    out.push('\n');
}

/// Column header for the sparse-binding listing.
pub fn sparse_header(out: &mut String) {
    let _ = writeln!(
        out,
        "{:>5} {:>16} {:>16} {:>16} {:>16}",
        "v_id", "gpuaddr", "v_offset", "v_size", "p_offset"
    );
}

/// The binding block for one sparse-virtual entry: one line per binding
/// in virtual-offset order, then a blank separator line. Non-sparse
/// entries render nothing.
pub fn sparse_entry_rows(entry: &MemEntry, out: &mut String) {
    if !entry.is_sparse_virtual() {
        return;
    }

    entry.with_bindings(|offset, binding| {
        let _ = writeln!(
            out,
            "{:>5} {:>16x} {:>16x} {:>16x} {:>16x}",
            entry.id(),
            entry.gpuaddr(),
            offset,
            binding.size,
            binding.phys_offset
        );
    });
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::entry::EntryDescriptor;
    use crate::mem::flags::MemFlags;
    use crate::mem::{CacheMode, PageHandle};

    fn plain_entry() -> MemEntry {
        let desc = EntryDescriptor::new(0x5000, 4096).pages(vec![Some(PageHandle(1))]);
        MemEntry::new(1, 100, desc)
    }

    #[test]
    fn test_header_layout() {
        let mut out = String::new();
        header_row(&mut out);
        assert_eq!(
            out,
            concat!(
                "         gpuaddr         useraddr             size    id     flags",
                "       type            usage sglen         mapcount eglsrf eglimg\n",
            )
        );
    }

    #[test]
    fn test_plain_entry_row() {
        let mut out = String::new();
        entry_row(&plain_entry(), &DefaultClassifier, false, &mut out);
        assert_eq!(
            out,
            concat!(
                "0000000000005000 0000000000000000             4096     1 --w---N--",
                "     gpumem           any(0)     1                0      0      0\n",
            )
        );
    }

    #[test]
    fn test_restricted_row_hides_address() {
        let mut out = String::new();
        entry_row(&plain_entry(), &DefaultClassifier, true, &mut out);
        assert!(out.starts_with("0000000000000000 0000000000000000"));
    }

    #[test]
    fn test_flag_positions() {
        let desc = EntryDescriptor::new(0, 4096)
            .flags(MemFlags::GLOBAL | MemFlags::SECURE | MemFlags::GPU_READONLY)
            .cache(CacheMode::WriteBack)
            .align_log2(20);
        let entry = MemEntry::new(2, 100, desc);
        entry.mark_mapped();

        let mut out = String::new();
        entry_row(&entry, &DefaultClassifier, false, &mut out);
        let flags: &str = out.split_whitespace().nth(4).unwrap();
        assert_eq!(flags, "g--Lb-Ys-");
    }

    #[test]
    fn test_metadata_is_appended() {
        let desc = EntryDescriptor::new(0, 4096).metadata("cmdbuffer");
        let entry = MemEntry::new(3, 100, desc);

        let mut out = String::new();
        entry_row(&entry, &DefaultClassifier, false, &mut out);
        assert!(out.ends_with(" cmdbuffer\n"));
    }

    #[test]
    fn test_dmabuf_rows_carry_surface_counts() {
        struct CountingClassifier;
        impl MemClassifier for CountingClassifier {
            fn surface_counts(&self, _entry: &MemEntry) -> SurfaceCounts {
                SurfaceCounts {
                    surfaces: 2,
                    images: 5,
                    total: 7,
                }
            }
        }

        let desc = EntryDescriptor::new(0, 4096).mem_type(UserMemType::DmaBuf);
        let entry = MemEntry::new(4, 100, desc);

        let mut out = String::new();
        entry_row(&entry, &CountingClassifier, false, &mut out);
        assert!(out.contains(" dmabuf "));
        assert!(out.ends_with("     2      5\n"));
    }

    #[test]
    fn test_sparse_virtual_entries_render_no_row() {
        let desc = EntryDescriptor::new(0, 4096).flags(MemFlags::SPARSE_VIRT);
        let entry = MemEntry::new(5, 100, desc);

        let mut out = String::new();
        entry_row(&entry, &DefaultClassifier, false, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_sparse_block_rows_and_separator() {
        let desc = EntryDescriptor::new(0x8000, 0x10000).flags(MemFlags::SPARSE_VIRT);
        let entry = MemEntry::new(3, 100, desc);
        entry.bind(0x2000, 0x1000, 0x6000);
        entry.bind(0x1000, 0x2000, 0x4000);

        let mut out = String::new();
        sparse_entry_rows(&entry, &mut out);
        assert_eq!(
            out,
            concat!(
                "    3             8000             1000             2000             4000\n",
                "    3             8000             2000             1000             6000\n",
                "\n",
            )
        );
    }

    #[test]
    fn test_sparse_block_skips_plain_entries() {
        let mut out = String::new();
        sparse_entry_rows(&plain_entry(), &mut out);
        assert!(out.is_empty());
    }
}
