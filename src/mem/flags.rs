use bitflags::bitflags;
use std::borrow::Cow;

bitflags! {
    /// Boolean attribute markers of a memory entry.
    ///
    /// Cache mode, usage hint, alignment and the user-memory subclass are
    /// carried as typed fields next to these bits (see
    /// [`EntryDescriptor`](super::EntryDescriptor)).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemFlags: u32 {
        /// The GPU may only read from this allocation.
        const GPU_READONLY = 0x0001;
        /// Shared across all processes on the device.
        const GLOBAL = 0x0002;
        /// Backed by protected memory; contents are never dumped.
        const SECURE = 0x0004;
        /// A sparse virtual allocation; rendered through the binding
        /// listing instead of the row listing.
        const SPARSE_VIRT = 0x0008;
        /// Physical backing for sparse bindings.
        const SPARSE_PHYS = 0x0010;
        /// CPU mappings reuse the GPU virtual address.
        const USE_CPU_MAP = 0x0020;
    }
}

/// CPU cache behavior of an allocation's mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    WriteCombine,
    Uncached,
    WriteBack,
    WriteThrough,
}

impl CacheMode {
    /// Single-character code used in listing rows.
    #[must_use]
    pub const fn flag_char(self) -> char {
        match self {
            Self::WriteCombine => '-',
            Self::Uncached => 'u',
            Self::WriteBack => 'b',
            Self::WriteThrough => 't',
        }
    }
}

/// Where an allocation's backing memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserMemType {
    /// Allocated by the driver on behalf of the process.
    #[default]
    Native,
    /// Imported user pages.
    User,
    /// Imported dma-buf.
    DmaBuf,
}

impl UserMemType {
    /// Label used in the `type` column of listing rows.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Native => "gpumem",
            Self::User => "usermem",
            Self::DmaBuf => "dmabuf",
        }
    }
}

/// Single-character alignment class for listing rows: `L` for 1 MiB or
/// larger, `l` for 64 KiB or larger.
#[must_use]
pub const fn align_flag(align_log2: u8) -> char {
    if align_log2 >= 20 {
        'L'
    } else if align_log2 >= 16 {
        'l'
    } else {
        '-'
    }
}

const USAGE_LABELS: [&str; 21] = [
    "any(0)",
    "framebuffer",
    "renderbuffer",
    "arraybuffer",
    "elementarraybuffer",
    "vertexarraybuffer",
    "texture",
    "surface",
    "egl_surface",
    "gl",
    "cl",
    "cl_buffer_map",
    "cl_buffer_nomap",
    "cl_image_map",
    "cl_image_nomap",
    "cl_kernel_stack",
    "command",
    "2d",
    "egl_image",
    "egl_shadow",
    "egl_multisample",
];

/// Usage hint reserved for driver-internal allocations.
pub const USAGE_KERNEL: u8 = 255;

/// Maps a usage hint to its display label. Hints outside the known table
/// come from newer clients and are shown numerically.
#[must_use]
pub fn usage_label(usage: u8) -> Cow<'static, str> {
    if usage == USAGE_KERNEL {
        return Cow::Borrowed("kernel");
    }
    match USAGE_LABELS.get(usage as usize) {
        Some(label) => Cow::Borrowed(label),
        None => Cow::Owned(format!("VK/others({usage:3})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_flag_classes() {
        assert_eq!(align_flag(12), '-');
        assert_eq!(align_flag(16), 'l');
        assert_eq!(align_flag(19), 'l');
        assert_eq!(align_flag(20), 'L');
    }

    #[test]
    fn test_usage_label_table() {
        assert_eq!(usage_label(0), "any(0)");
        assert_eq!(usage_label(6), "texture");
        assert_eq!(usage_label(20), "egl_multisample");
        assert_eq!(usage_label(USAGE_KERNEL), "kernel");
    }

    #[test]
    fn test_usage_label_fallback_width() {
        assert_eq!(usage_label(21), "VK/others( 21)");
        assert_eq!(usage_label(100), "VK/others(100)");
    }

    #[test]
    fn test_cache_flag_chars() {
        assert_eq!(CacheMode::WriteCombine.flag_char(), '-');
        assert_eq!(CacheMode::Uncached.flag_char(), 'u');
        assert_eq!(CacheMode::WriteBack.flag_char(), 'b');
        assert_eq!(CacheMode::WriteThrough.flag_char(), 't');
    }
}
