//! Incremental assembly of bracket frames from a TCP byte stream.
//!
//! Wire format:
//! ```text
//! < element0 element1 ... elementN >
//! ```
//! A frame is everything from a `<` to the next `>`, brackets included.
//! Elements inside the frame are separated by runs of spaces. Bytes that
//! arrive outside any frame are noise and are dropped.
//!
//! TCP is a byte stream, so a single `read()` may return half a frame, one
//! and a half frames, or several complete frames at once. [`FrameAssembler`]
//! owns the per-connection carry-over buffer that makes complete frames out
//! of whatever the socket delivers:
//!
//! - [`FrameAssembler::append`] takes the bytes of one socket read.
//! - [`FrameAssembler::extract`] yields at most one complete [`Frame`] and
//!   compacts the buffer.
//! - [`FrameAssembler::wants_read`] tells the caller when a complete frame
//!   is already buffered, so the connection loop drains the buffer before
//!   touching the socket again.
//!
//! The buffer is bounded at [`MAX_FRAME_BUFFER`] bytes. A peer that sends
//! that much data without ever closing a frame gets a [`FrameError::Oversized`],
//! which callers treat as fatal for the connection.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

/// Capacity of the per-connection receive buffer in bytes.
///
/// No legal frame is longer than this; a buffer full of unterminated data
/// means the peer is broken or hostile and the connection is dropped.
pub const MAX_FRAME_BUFFER: usize = 16000;

/// Errors produced while assembling frames from the byte stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer filled to capacity without a closing `>`.
    ///
    /// The connection cannot make progress: no more bytes can be buffered
    /// and no frame can ever complete. Callers must drop the connection.
    #[error("unterminated frame fills the {capacity}-byte receive buffer")]
    Oversized { capacity: usize },
}

/// One complete `< ... >` frame, brackets included.
///
/// Frames are cheap to clone (the payload is a reference-counted [`Bytes`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Wraps raw bytes as a frame.
    ///
    /// Returns `None` unless the bytes start with `<` and end with `>`.
    /// Mostly useful in tests; production frames come out of
    /// [`FrameAssembler::extract`].
    pub fn from_bytes(bytes: Bytes) -> Option<Self> {
        if bytes.len() >= 2 && bytes.first() == Some(&b'<') && bytes.last() == Some(&b'>') {
            Some(Self { bytes })
        } else {
            None
        }
    }

    /// The full frame bytes, brackets included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The frame as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// The bytes between the brackets (exclusive). Empty for `<>`.
    pub fn interior(&self) -> &[u8] {
        &self.bytes[1..self.bytes.len() - 1]
    }

    /// Total length in bytes, brackets included. Never less than 2.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; the shortest frame is `<>`.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

/// Incremental frame parser over a bounded carry-over buffer.
///
/// # Examples
///
/// ```rust
/// use cangate_core::protocol::assembler::FrameAssembler;
///
/// let mut asm = FrameAssembler::new();
/// asm.append(b"< echo ");
/// assert!(asm.extract().unwrap().is_none()); // incomplete
/// asm.append(b">< hi >");
/// let first = asm.extract().unwrap().unwrap();
/// assert_eq!(first.as_bytes(), b"< echo >");
/// // A full second frame is buffered; drain it before reading the socket.
/// assert!(!asm.wants_read());
/// let second = asm.extract().unwrap().unwrap();
/// assert_eq!(second.as_bytes(), b"< hi >");
/// ```
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    capacity: usize,
    /// Set by `extract` when the remainder already holds a complete frame.
    full_frame_buffered: bool,
}

impl FrameAssembler {
    /// Creates an assembler with the standard [`MAX_FRAME_BUFFER`] capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_BUFFER)
    }

    /// Creates an assembler with a custom buffer capacity.
    ///
    /// Only tests shrink the capacity; the daemon always uses
    /// [`MAX_FRAME_BUFFER`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity.min(4096)),
            capacity,
            full_frame_buffered: false,
        }
    }

    /// True when the connection loop should read more bytes from the socket.
    ///
    /// False when a complete frame is already buffered: the caller must call
    /// [`extract`](Self::extract) again first, otherwise a quiet peer could
    /// delay a frame that has already fully arrived.
    pub fn wants_read(&self) -> bool {
        !self.full_frame_buffered
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Room left in the buffer. Callers read at most this many bytes.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Appends bytes from a socket read.
    ///
    /// At most [`remaining_capacity`](Self::remaining_capacity) bytes are
    /// taken; the number actually buffered is returned. The connection loop
    /// sizes its reads so that truncation never happens in practice.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.remaining_capacity());
        self.buf.extend_from_slice(&bytes[..take]);
        take
    }

    /// Extracts the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes before the first
    /// `<` are dropped as noise; after a frame is cut out, anything between
    /// its `>` and the next `<` is dropped too. When a frame is returned and
    /// a complete second frame is still buffered,
    /// [`wants_read`](Self::wants_read) turns false until it is drained.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Oversized`] when the buffer is full and holds an
    /// opening `<` with no closing `>`: the frame can never complete.
    pub fn extract(&mut self) -> Result<Option<Frame>, FrameError> {
        self.full_frame_buffered = false;

        // Locate the opening bracket. A buffer with no '<' at all is noise.
        let Some(open) = find_byte(&self.buf, b'<', 0) else {
            if !self.buf.is_empty() {
                trace!(dropped = self.buf.len(), "discarding bytes outside any frame");
                self.buf.clear();
            }
            return Ok(None);
        };

        // Locate the closing bracket at or after the '<'.
        let Some(close) = find_byte(&self.buf, b'>', open) else {
            if self.buf.len() >= self.capacity {
                return Err(FrameError::Oversized {
                    capacity: self.capacity,
                });
            }
            // Partial frame; keep everything and wait for more bytes.
            return Ok(None);
        };

        // Cut the inclusive '<'..'>' span out of the buffer, discarding any
        // noise in front of it.
        let mut head = self.buf.split_to(close + 1);
        let frame_bytes = head.split_off(open).freeze();
        if open > 0 {
            trace!(dropped = open, "discarding bytes before frame start");
        }

        // Compact the remainder: drop anything before the next '<'. With no
        // further '<' the tail is noise and is cleared outright.
        match find_byte(&self.buf, b'<', 0) {
            None => {
                if !self.buf.is_empty() {
                    trace!(dropped = self.buf.len(), "discarding bytes after frame end");
                    self.buf.clear();
                }
            }
            Some(next_open) => {
                self.buf.advance(next_open);
                // The remainder now starts with '<'; any '>' after it means a
                // complete second frame is already waiting.
                self.full_frame_buffered = find_byte(&self.buf, b'>', 0).is_some();
            }
        }

        Ok(Some(Frame { bytes: frame_bytes }))
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the first occurrence of `needle` at or after `from`.
fn find_byte(haystack: &[u8], needle: u8, from: usize) -> Option<usize> {
    haystack[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|rel| from + rel)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds the whole input in one append and drains every frame.
    fn drain_all(input: &[u8]) -> Vec<String> {
        let mut asm = FrameAssembler::new();
        asm.append(input);
        drain(&mut asm)
    }

    fn drain(asm: &mut FrameAssembler) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(frame) = asm.extract().unwrap() {
            out.push(frame.to_string());
        }
        out
    }

    // ── Basic extraction ──────────────────────────────────────────────────────

    #[test]
    fn test_extract_single_complete_frame() {
        assert_eq!(drain_all(b"< echo >"), vec!["< echo >"]);
    }

    #[test]
    fn test_extract_returns_none_on_empty_buffer() {
        let mut asm = FrameAssembler::new();
        assert_eq!(asm.extract().unwrap(), None);
    }

    #[test]
    fn test_extract_returns_none_on_partial_frame() {
        let mut asm = FrameAssembler::new();
        asm.append(b"< ech");
        assert_eq!(asm.extract().unwrap(), None);
        // The partial bytes must survive for the next append.
        assert_eq!(asm.buffered(), 5);
    }

    #[test]
    fn test_empty_frame_is_legal() {
        // Arrange: the shortest possible frame
        let frames = drain_all(b"<>");

        // Assert
        assert_eq!(frames, vec!["<>"]);
    }

    #[test]
    fn test_empty_frame_interior_is_zero_length() {
        let mut asm = FrameAssembler::new();
        asm.append(b"<>");
        let frame = asm.extract().unwrap().unwrap();
        assert_eq!(frame.interior(), b"");
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn test_frame_accessors() {
        let mut asm = FrameAssembler::new();
        asm.append(b"< open can0 >");
        let frame = asm.extract().unwrap().unwrap();
        assert_eq!(frame.as_bytes(), b"< open can0 >");
        assert_eq!(frame.as_text(), Some("< open can0 >"));
        assert_eq!(frame.interior(), b" open can0 ");
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_frame_from_bytes_accepts_bracketed_span() {
        assert!(Frame::from_bytes(Bytes::from_static(b"< hi >")).is_some());
        assert!(Frame::from_bytes(Bytes::from_static(b"<>")).is_some());
    }

    #[test]
    fn test_frame_from_bytes_rejects_unbracketed_input() {
        assert!(Frame::from_bytes(Bytes::from_static(b"hi")).is_none());
        assert!(Frame::from_bytes(Bytes::from_static(b"< hi")).is_none());
        assert!(Frame::from_bytes(Bytes::from_static(b"hi >")).is_none());
        assert!(Frame::from_bytes(Bytes::from_static(b"")).is_none());
    }

    // ── Noise handling ────────────────────────────────────────────────────────

    #[test]
    fn test_noise_before_frame_is_dropped() {
        assert_eq!(drain_all(b"garbage< echo >"), vec!["< echo >"]);
    }

    #[test]
    fn test_noise_only_buffer_is_cleared() {
        let mut asm = FrameAssembler::new();
        asm.append(b"no brackets here");
        assert_eq!(asm.extract().unwrap(), None);
        assert_eq!(asm.buffered(), 0, "noise without '<' must be discarded");
    }

    #[test]
    fn test_noise_after_frame_without_next_open_is_dropped() {
        // The tail after '>' contains no '<', so it is discarded outright.
        // A '>' arriving later must not resurrect it.
        let mut asm = FrameAssembler::new();
        asm.append(b"< a >junk");
        let frame = asm.extract().unwrap().unwrap();
        assert_eq!(frame.as_bytes(), b"< a >");
        assert_eq!(asm.buffered(), 0);

        asm.append(b" more >");
        assert_eq!(asm.extract().unwrap(), None);
    }

    #[test]
    fn test_noise_between_frames_is_dropped() {
        assert_eq!(
            drain_all(b"< a >xxx< b >"),
            vec!["< a >", "< b >"],
            "bytes between '>' and the next '<' are noise"
        );
    }

    #[test]
    fn test_close_bracket_before_any_open_is_noise() {
        // A stray '>' before the first '<' must not terminate anything.
        assert_eq!(drain_all(b">>>< echo >"), vec!["< echo >"]);
    }

    // ── Multiple frames and wants_read ────────────────────────────────────────

    #[test]
    fn test_two_frames_in_one_append_both_extracted() {
        assert_eq!(drain_all(b"<a><b>"), vec!["<a>", "<b>"]);
    }

    #[test]
    fn test_wants_read_false_while_second_frame_buffered() {
        // Arrange
        let mut asm = FrameAssembler::new();
        asm.append(b"<a><b>");

        // Act: extract the first frame
        let first = asm.extract().unwrap().unwrap();

        // Assert: the loop must drain the buffer before the next socket read
        assert_eq!(first.as_bytes(), b"<a>");
        assert!(!asm.wants_read());

        let second = asm.extract().unwrap().unwrap();
        assert_eq!(second.as_bytes(), b"<b>");
        assert!(asm.wants_read());
    }

    #[test]
    fn test_wants_read_true_for_partial_second_frame() {
        let mut asm = FrameAssembler::new();
        asm.append(b"< a >< b");
        let first = asm.extract().unwrap().unwrap();
        assert_eq!(first.as_bytes(), b"< a >");
        // The second frame is incomplete; more bytes are required.
        assert!(asm.wants_read());
        assert_eq!(asm.extract().unwrap(), None);
    }

    #[test]
    fn test_three_frames_in_one_append() {
        assert_eq!(drain_all(b"<1><2><3>"), vec!["<1>", "<2>", "<3>"]);
    }

    #[test]
    fn test_wants_read_initially_true() {
        let asm = FrameAssembler::new();
        assert!(asm.wants_read());
    }

    // ── Chunking invariance ───────────────────────────────────────────────────

    #[test]
    fn test_split_append_yields_same_frames() {
        // Arrange: the same stream delivered in two reads
        let mut asm = FrameAssembler::new();
        asm.append(b"< a >< b");
        let mut frames = drain(&mut asm);
        asm.append(b" >");
        frames.extend(drain(&mut asm));

        // Assert: identical to a single-shot delivery
        assert_eq!(frames, drain_all(b"< a >< b >"));
    }

    #[test]
    fn test_byte_at_a_time_append_yields_same_frames() {
        let input: &[u8] = b"junk< open can0 ><>< send 123 2 AA BB >trailing<";
        let expected = drain_all(input);

        let mut asm = FrameAssembler::new();
        let mut frames = Vec::new();
        for &b in input {
            asm.append(&[b]);
            frames.extend(drain(&mut asm));
        }
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_every_split_point_yields_same_frames() {
        let input: &[u8] = b"< a >x< bb ><><: ?>";
        let expected = drain_all(input);

        for split in 0..=input.len() {
            let mut asm = FrameAssembler::new();
            let mut frames = Vec::new();
            asm.append(&input[..split]);
            frames.extend(drain(&mut asm));
            asm.append(&input[split..]);
            frames.extend(drain(&mut asm));
            assert_eq!(frames, expected, "split at byte {split} diverged");
        }
    }

    // ── Capacity handling ─────────────────────────────────────────────────────

    #[test]
    fn test_full_buffer_without_close_is_an_error() {
        // Arrange: fill the whole buffer with an unterminated frame
        let mut asm = FrameAssembler::new();
        let mut junk = vec![b'<'];
        junk.resize(MAX_FRAME_BUFFER, b'x');
        let taken = asm.append(&junk);
        assert_eq!(taken, MAX_FRAME_BUFFER);

        // Act / Assert: extraction must terminate with an error, not spin
        assert_eq!(
            asm.extract(),
            Err(FrameError::Oversized {
                capacity: MAX_FRAME_BUFFER
            })
        );
    }

    #[test]
    fn test_append_truncates_at_capacity() {
        let mut asm = FrameAssembler::with_capacity(8);
        let taken = asm.append(b"0123456789");
        assert_eq!(taken, 8);
        assert_eq!(asm.remaining_capacity(), 0);
    }

    #[test]
    fn test_small_capacity_oversized_error() {
        let mut asm = FrameAssembler::with_capacity(8);
        asm.append(b"< aaaaaaaa");
        assert_eq!(asm.extract(), Err(FrameError::Oversized { capacity: 8 }));
    }

    #[test]
    fn test_full_buffer_of_noise_without_open_is_cleared() {
        // A full buffer with no '<' is plain noise, not an oversized frame.
        let mut asm = FrameAssembler::with_capacity(8);
        asm.append(b"xxxxxxxx");
        assert_eq!(asm.extract().unwrap(), None);
        assert_eq!(asm.remaining_capacity(), 8);
    }

    #[test]
    fn test_frame_spanning_most_of_buffer_still_extracts() {
        // A frame just under capacity must parse fine.
        let mut asm = FrameAssembler::new();
        let mut big = Vec::with_capacity(MAX_FRAME_BUFFER);
        big.push(b'<');
        big.resize(MAX_FRAME_BUFFER - 1, b'a');
        big.push(b'>');
        asm.append(&big);
        let frame = asm.extract().unwrap().unwrap();
        assert_eq!(frame.len(), MAX_FRAME_BUFFER);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn test_oversized_error_display_names_capacity() {
        let err = FrameError::Oversized { capacity: 16000 };
        assert_eq!(
            err.to_string(),
            "unterminated frame fills the 16000-byte receive buffer"
        );
    }

    // ── Buffer reuse across frames ────────────────────────────────────────────

    #[test]
    fn test_capacity_recovers_after_extraction() {
        let mut asm = FrameAssembler::new();
        asm.append(b"< a >");
        let _ = asm.extract().unwrap().unwrap();
        assert_eq!(asm.remaining_capacity(), MAX_FRAME_BUFFER);
    }

    #[test]
    fn test_long_session_of_many_frames() {
        // Push far more total bytes than the buffer holds; extraction after
        // each read keeps the buffer drained.
        let mut asm = FrameAssembler::new();
        let mut count = 0usize;
        for i in 0..10_000 {
            let chunk = format!("< frame {i} >");
            asm.append(chunk.as_bytes());
            while let Some(_frame) = asm.extract().unwrap() {
                count += 1;
            }
        }
        assert_eq!(count, 10_000);
        assert_eq!(asm.buffered(), 0);
    }
}
