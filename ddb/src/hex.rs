//! Hex dump rendering.
//!
//! Formats memory for the display commands: an address column followed by
//! byte, word, or dword groups. Runs of lines repeating a single byte are
//! elided behind an ellipsis row.

/// Bytes shown per line.
const LINE: usize = 16;

/// Renders `data` starting at `start`, grouped into `word`-byte units
/// (1, 2, or 4), little-endian within each unit.
#[must_use]
pub fn dump(start: u32, data: &[u8], word: usize) -> String {
    let mut out = String::new();
    let mut repeat: Option<u8> = None;
    let mut skip = false;

    for (index, line) in data.chunks(LINE).enumerate() {
        // A line whose bytes are all identical is a padding candidate.
        let pad = match line {
            [head, tail @ ..] => tail.iter().all(|b| b == head).then_some(*head),
            [] => None,
        };
        if skip && pad == repeat {
            continue;
        }

        if index != 0 {
            out.push('\n');
        }
        if !skip && pad.is_some() && pad == repeat {
            // Entering a repeated run; print ellipses once.
            out.push_str("........:");
            skip = true;
        } else {
            let addr = start.wrapping_add((index * LINE) as u32);
            out.push_str(&format!("{addr:08X}:"));
            repeat = pad;
            skip = false;
        }

        for unit in line.chunks(word) {
            out.push(' ');
            for byte in unit.iter().rev() {
                out.push_str(&format!("{byte:02x}"));
            }
        }
    }

    out
}
