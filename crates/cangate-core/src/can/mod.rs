//! CAN frame model and the ASCII rendering used on the client connection.
//!
//! Bus frames cross the network as text:
//! ```text
//! < frame 123 1699972214.123456 11223344 >
//! < frame 1F334455 1699972214.123457 DEADBEEF >
//! ```
//! Standard (11-bit) identifiers render as three uppercase hex digits,
//! extended (29-bit) identifiers as eight. The timestamp is the receive
//! time in seconds and microseconds; the payload is the concatenated
//! `%02X` data bytes.
//!
//! On the way in, `send`-style commands carry the id, a decimal data
//! length, and one hex element per data byte:
//! ```text
//! < send 123 2 AA BB >
//! ```
//! An id element longer than three digits selects an extended identifier
//! even when its value would fit in 11 bits.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::token::{element_bytes, hex_nibble, hex_to_u32, INVALID_NIBBLE};

/// Highest valid standard (11-bit) CAN identifier.
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Highest valid extended (29-bit) CAN identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Data bytes in a classic CAN frame.
pub const CLASSIC_MAX_DATA: usize = 8;
/// Data bytes in a CAN FD frame.
pub const FD_MAX_DATA: usize = 64;

/// A CAN identifier, standard or extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanId {
    /// 11-bit identifier.
    Standard(u16),
    /// 29-bit identifier.
    Extended(u32),
}

impl CanId {
    /// Parses a hex id element.
    ///
    /// The identifier is extended when it has more than three digits or a
    /// value above [`MAX_STANDARD_ID`]. Returns `None` for non-hex input or
    /// values above [`MAX_EXTENDED_ID`].
    pub fn parse(element: &[u8]) -> Option<Self> {
        let value = hex_to_u32(element)?;
        if element.len() > 3 || value > MAX_STANDARD_ID {
            (value <= MAX_EXTENDED_ID).then_some(CanId::Extended(value))
        } else {
            Some(CanId::Standard(value as u16))
        }
    }

    /// The raw identifier value without flags.
    pub fn raw(&self) -> u32 {
        match *self {
            CanId::Standard(id) => u32::from(id),
            CanId::Extended(id) => id,
        }
    }

    /// True for 29-bit identifiers.
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

impl fmt::Display for CanId {
    /// Renders with the on-wire width: `%03X` standard, `%08X` extended.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CanId::Standard(id) => write!(f, "{id:03X}"),
            CanId::Extended(id) => write!(f, "{id:08X}"),
        }
    }
}

/// One CAN frame as it moves between a session and its bus transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub id: CanId,
    pub data: Vec<u8>,
    /// Remote transmission request; carries no data.
    pub remote: bool,
}

impl BusFrame {
    /// A data frame.
    pub fn new(id: CanId, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            remote: false,
        }
    }
}

/// Errors from parsing frame elements out of a client command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanParseError {
    /// A required element is not present in the frame.
    #[error("missing frame element {index}")]
    Missing { index: usize },

    /// The CAN id element is not valid hex or is out of range.
    #[error("invalid CAN id '{text}'")]
    BadId { text: String },

    /// The data length element is not a number or exceeds the frame limit.
    #[error("invalid data length '{text}' (limit {limit})")]
    BadLength { text: String, limit: usize },

    /// A data byte element is not one or two hex digits.
    #[error("invalid data byte '{text}'")]
    BadByte { text: String },
}

/// Parses `id dlc byte...` elements starting at `first_element`.
///
/// `send`-style commands put the id at element 2, so mode handlers call
/// this with `first_element = 2` (or 4 for the cyclic `add`, which carries
/// an interval first). `max_data` is [`CLASSIC_MAX_DATA`] or
/// [`FD_MAX_DATA`] depending on the transport.
///
/// # Errors
///
/// Returns [`CanParseError`] naming the offending element.
pub fn parse_frame_elements(
    frame: &[u8],
    first_element: usize,
    max_data: usize,
) -> Result<BusFrame, CanParseError> {
    let id_elem = element_bytes(frame, first_element).ok_or(CanParseError::Missing {
        index: first_element,
    })?;
    let id = CanId::parse(id_elem).ok_or_else(|| CanParseError::BadId {
        text: String::from_utf8_lossy(id_elem).into_owned(),
    })?;

    let len_elem = element_bytes(frame, first_element + 1).ok_or(CanParseError::Missing {
        index: first_element + 1,
    })?;
    let dlc = parse_decimal(len_elem)
        .filter(|&n| n <= max_data)
        .ok_or_else(|| CanParseError::BadLength {
            text: String::from_utf8_lossy(len_elem).into_owned(),
            limit: max_data,
        })?;

    let mut data = Vec::with_capacity(dlc);
    for i in 0..dlc {
        let index = first_element + 2 + i;
        let elem = element_bytes(frame, index).ok_or(CanParseError::Missing { index })?;
        let byte = parse_data_byte(elem).ok_or_else(|| CanParseError::BadByte {
            text: String::from_utf8_lossy(elem).into_owned(),
        })?;
        data.push(byte);
    }

    Ok(BusFrame::new(id, data))
}

/// Renders a received bus frame for the client connection.
///
/// `timestamp` is the receive time as a duration since the Unix epoch.
pub fn format_frame(frame: &BusFrame, timestamp: Duration) -> String {
    let mut out = format!(
        "< frame {} {}.{:06} ",
        frame.id,
        timestamp.as_secs(),
        timestamp.subsec_micros()
    );
    for byte in &frame.data {
        out.push(HEX_UPPER[usize::from(byte >> 4)] as char);
        out.push(HEX_UPPER[usize::from(byte & 0xF)] as char);
    }
    out.push_str(" >");
    out
}

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Renders bytes as a continuous uppercase hex string.
pub fn hex_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push(HEX_UPPER[usize::from(byte >> 4)] as char);
        out.push(HEX_UPPER[usize::from(byte & 0xF)] as char);
    }
    out
}

/// Parses a continuous even-length hex string into bytes.
pub fn parse_hex_data(element: &[u8]) -> Option<Vec<u8>> {
    if element.is_empty() || element.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(element.len() / 2);
    for pair in element.chunks_exact(2) {
        let hi = hex_nibble(pair[0]);
        let lo = hex_nibble(pair[1]);
        if hi == INVALID_NIBBLE || lo == INVALID_NIBBLE {
            return None;
        }
        out.push((hi << 4) | lo);
    }
    Some(out)
}

/// Parses one or two hex digits into a byte.
fn parse_data_byte(element: &[u8]) -> Option<u8> {
    if element.is_empty() || element.len() > 2 {
        return None;
    }
    hex_to_u32(element).map(|v| v as u8)
}

/// Parses an ASCII decimal number.
fn parse_decimal(element: &[u8]) -> Option<usize> {
    std::str::from_utf8(element).ok()?.parse().ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
