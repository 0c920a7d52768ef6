use std::fmt::Write;

/// Bytes rendered per dump line.
pub const HEX_ROW_SIZE: usize = 32;

const HEX_GROUP_SIZE: usize = 4;

/// Formats one row of a memory dump: hex groups, a two-space gap, then the
/// printable-ASCII column.
///
/// Groups of four bytes are rendered as little-endian 32-bit words. When the
/// row length is not a multiple of four the formatter falls back to single
/// byte groups so short tails stay readable.
pub fn hex_dump_line(bytes: &[u8], out: &mut String) {
    let len = bytes.len().min(HEX_ROW_SIZE);
    let bytes = &bytes[..len];

    let group = if len % HEX_GROUP_SIZE == 0 {
        HEX_GROUP_SIZE
    } else {
        1
    };

    let start = out.len();
    if group == HEX_GROUP_SIZE {
        for (i, chunk) in bytes.chunks_exact(HEX_GROUP_SIZE).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{word:08x}");
        }
    } else {
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{b:02x}");
        }
    }

    // Pad the hex area out to a fixed ASCII column so rows line up even when
    // the final row is short.
    let ascii_column = HEX_ROW_SIZE * 2 + HEX_ROW_SIZE / group + 2;
    while out.len() - start < ascii_column {
        out.push(' ');
    }

    for &b in bytes {
        out.push(if (0x20..0x7f).contains(&b) {
            b as char
        } else {
            '.'
        });
    }
}
