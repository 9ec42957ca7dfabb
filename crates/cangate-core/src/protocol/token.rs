//! Positional tokenizer for bracket frames.
//!
//! Commands address their arguments by element index rather than by
//! splitting into an owned vector: `< send 123 2 AA BB >` has its verb at
//! element 1, the CAN id at element 2, and so on. Element 0 is the run of
//! bytes immediately after the `<`, which is empty for conventionally
//! spaced frames (and for `<>`); elements are separated by runs of spaces.
//!
//! All functions here are pure and allocation-free.

/// Sentinel returned by [`hex_nibble`] for bytes that are not hex digits.
pub const INVALID_NIBBLE: u8 = 16;

/// Finds the `index`-th element of `frame` as `(offset, length)`.
///
/// Offsets are relative to the full frame bytes, brackets included. Element
/// 0 always exists (possibly with length 0); higher elements exist only when
/// a non-space run follows.
fn nth_element(frame: &[u8], index: usize) -> Option<(usize, usize)> {
    let base = usize::from(frame.first() == Some(&b'<'));
    let end = if frame.len() > base && frame.last() == Some(&b'>') {
        frame.len() - 1
    } else {
        frame.len()
    };
    let interior = &frame[base..end];

    let mut pos = 0usize;
    let mut n = 0usize;
    loop {
        let run_start = pos;
        while pos < interior.len() && interior[pos] != b' ' {
            pos += 1;
        }
        if n == index {
            return Some((base + run_start, pos - run_start));
        }
        while pos < interior.len() && interior[pos] == b' ' {
            pos += 1;
        }
        if pos >= interior.len() {
            return None;
        }
        n += 1;
    }
}

/// Byte offset of element `index` within the frame, or `None` when absent.
pub fn element_at(frame: &[u8], index: usize) -> Option<usize> {
    nth_element(frame, index).map(|(offset, _)| offset)
}

/// Byte length of element `index`; 0 when the element is absent or empty.
pub fn element_len(frame: &[u8], index: usize) -> usize {
    nth_element(frame, index).map_or(0, |(_, len)| len)
}

/// Element `index` as a byte slice, or `None` when absent.
pub fn element_bytes(frame: &[u8], index: usize) -> Option<&[u8]> {
    nth_element(frame, index).map(|(offset, len)| &frame[offset..offset + len])
}

/// Element `index` as text, or `None` when absent or not UTF-8.
pub fn element_str(frame: &[u8], index: usize) -> Option<&str> {
    element_bytes(frame, index).and_then(|b| std::str::from_utf8(b).ok())
}

/// Number of elements in the frame. At least 1 (element 0 always exists).
pub fn element_count(frame: &[u8]) -> usize {
    let mut n = 0;
    while nth_element(frame, n).is_some() {
        n += 1;
    }
    n
}

/// Value of one ASCII hex digit, or [`INVALID_NIBBLE`] for anything else.
pub fn hex_nibble(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'A'..=b'F' => b - b'A' + 10,
        b'a'..=b'f' => b - b'a' + 10,
        _ => INVALID_NIBBLE,
    }
}

/// Parses up to eight hex digits into a u32. `None` on empty input, invalid
/// digits, or overflow.
pub fn hex_to_u32(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    let mut value = 0u32;
    for &b in digits {
        let nibble = hex_nibble(b);
        if nibble == INVALID_NIBBLE {
            return None;
        }
        value = (value << 4) | u32::from(nibble);
    }
    Some(value)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
