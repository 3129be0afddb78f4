use std::cmp;
use std::fmt::Write;

/// Render a short hex + ASCII preview of the bytes around `offset`.
///
/// Used for Warn/Debug log entries so a skipped record can be located in the
/// container without re-opening it in a hex editor.
pub(crate) fn preview(data: &[u8], offset: usize, len: usize) -> String {
    let start = offset.min(data.len());
    let end = cmp::min(start + len, data.len());
    let window = &data[start..end];

    let mut out = String::with_capacity(window.len() * 4 + 16);
    let _ = write!(out, "{start:08x}:");
    for b in window {
        let _ = write!(out, " {b:02x}");
    }
    out.push_str("  |");
    for &b in window {
        let c = b as char;
        out.push(if c.is_ascii_graphic() || c == ' ' { c } else { '.' });
    }
    out.push('|');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_replaces_control_bytes() {
        let data = [0x01, b'D', b'B', b'!', 0x00];
        let line = preview(&data, 0, 16);
        assert_eq!(line, "00000000: 01 44 42 21 00  |.DB!.|");
    }

    #[test]
    fn test_preview_clamps_to_buffer_end() {
        let data = [b'A'; 4];
        let line = preview(&data, 2, 16);
        assert_eq!(line, "00000002: 41 41  |AA|");
    }
}
