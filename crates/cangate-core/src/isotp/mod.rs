//! ISO-TP (ISO 15765-2) segmentation and reassembly.
//!
//! ISO-TP moves PDUs of up to 4095 bytes over classic CAN frames that carry
//! at most 8 bytes each. The first payload nibble of every frame names its
//! role:
//!
//! ```text
//! 0x0L              single frame, L data bytes follow
//! 0x1L 0xLL         first frame, 12-bit total length, 6 data bytes follow
//! 0x2N              consecutive frame, 4-bit sequence number N, up to 7 bytes
//! 0x3S 0xBS 0xST    flow control: status, block size, separation time
//! ```
//!
//! [`IsotpSender`] and [`IsotpReceiver`] are pure state machines: they never
//! touch a socket or a clock. The caller puts the returned frame payloads on
//! the bus, feeds received payloads back in, and sleeps for
//! [`IsotpSender::st_min`] between consecutive frames.

use std::time::Duration;

use thiserror::Error;

/// Largest PDU a 12-bit first-frame length field can announce.
pub const MAX_PDU: usize = 4095;

/// Data bytes that fit in a single frame.
const SINGLE_MAX: usize = 7;
/// Data bytes carried by a first frame.
const FIRST_PAYLOAD: usize = 6;
/// Data bytes carried by one consecutive frame.
const CONSECUTIVE_PAYLOAD: usize = 7;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

const FLOW_CONTINUE: u8 = 0x0;
const FLOW_WAIT: u8 = 0x1;
const FLOW_OVERFLOW: u8 = 0x2;

/// Errors raised by the segmentation state machines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IsotpError {
    /// The PDU does not fit the 12-bit length field.
    #[error("PDU of {len} bytes exceeds the {limit}-byte ISO-TP limit")]
    PduTooLarge { len: usize, limit: usize },

    /// A second transfer was started while one is still running.
    #[error("a transfer is already in progress")]
    TransferInProgress,

    /// Flow control arrived while no transfer was waiting for one.
    #[error("flow control arrived outside a transfer")]
    UnexpectedFlowControl,

    /// The peer reported a receive buffer overflow; the transfer is aborted.
    #[error("peer reported receive buffer overflow")]
    Overflow,

    /// The flow status nibble is not continue, wait, or overflow.
    #[error("invalid flow status {status}")]
    InvalidFlowStatus { status: u8 },

    /// A consecutive frame arrived out of order; the transfer is aborted.
    #[error("consecutive frame sequence {got}, expected {expected}")]
    SequenceMismatch { got: u8, expected: u8 },

    /// The frame payload is shorter than its control information requires.
    #[error("frame too short for its protocol control information")]
    Truncated,

    /// A first frame announced a length that belongs in a single frame.
    #[error("first frame announces {len} bytes, below the multi-frame minimum")]
    InvalidFirstFrame { len: usize },

    /// The protocol control nibble is not a known frame type.
    #[error("unknown protocol control nibble {pci:#X}")]
    UnknownPci { pci: u8 },
}

/// Role of one received frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Single,
    First,
    Consecutive,
    FlowControl,
}

/// Classifies a frame payload by its protocol control nibble.
pub fn frame_kind(data: &[u8]) -> Option<FrameKind> {
    match data.first()? >> 4 {
        PCI_SINGLE => Some(FrameKind::Single),
        PCI_FIRST => Some(FrameKind::First),
        PCI_CONSECUTIVE => Some(FrameKind::Consecutive),
        PCI_FLOW_CONTROL => Some(FrameKind::FlowControl),
        _ => None,
    }
}

/// Decodes the separation-time byte of a flow control frame.
///
/// 0x00–0x7F are milliseconds; 0xF1–0xF9 are 100–900 microseconds. Reserved
/// values fall back to the maximum of 127 ms, as the standard requires.
pub fn decode_st_min(byte: u8) -> Duration {
    match byte {
        0x00..=0x7F => Duration::from_millis(u64::from(byte)),
        0xF1..=0xF9 => Duration::from_micros(u64::from(byte - 0xF0) * 100),
        _ => Duration::from_millis(127),
    }
}

// ── Sender ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Idle,
    AwaitFlowControl,
    Sending,
    Complete,
}

/// Outbound transfer state machine.
///
/// One transfer at a time: [`start`](IsotpSender::start) returns the single
/// or first frame, [`on_flow_control`](IsotpSender::on_flow_control) consumes
/// the peer's flow control, and [`next_frame`](IsotpSender::next_frame) hands
/// out consecutive frames until the negotiated block is exhausted or the
/// transfer completes.
#[derive(Debug)]
pub struct IsotpSender {
    pdu: Vec<u8>,
    offset: usize,
    sequence: u8,
    block_size: u8,
    sent_in_block: u8,
    st_min: Duration,
    phase: SendPhase,
}

impl IsotpSender {
    pub fn new() -> Self {
        Self {
            pdu: Vec::new(),
            offset: 0,
            sequence: 0,
            block_size: 0,
            sent_in_block: 0,
            st_min: Duration::ZERO,
            phase: SendPhase::Idle,
        }
    }

    /// Begins a transfer and returns the first frame payload to transmit.
    ///
    /// PDUs of up to 7 bytes go out as a single frame and the transfer is
    /// immediately [`complete`](Self::is_complete). Longer PDUs return a
    /// first frame; the sender then waits for the peer's flow control.
    ///
    /// # Errors
    ///
    /// [`IsotpError::PduTooLarge`] above 4095 bytes and
    /// [`IsotpError::TransferInProgress`] while an earlier transfer is
    /// still running.
    pub fn start(&mut self, pdu: &[u8]) -> Result<Vec<u8>, IsotpError> {
        if matches!(self.phase, SendPhase::AwaitFlowControl | SendPhase::Sending) {
            return Err(IsotpError::TransferInProgress);
        }
        if pdu.len() > MAX_PDU {
            return Err(IsotpError::PduTooLarge {
                len: pdu.len(),
                limit: MAX_PDU,
            });
        }

        if pdu.len() <= SINGLE_MAX {
            let mut frame = Vec::with_capacity(1 + pdu.len());
            frame.push((PCI_SINGLE << 4) | pdu.len() as u8);
            frame.extend_from_slice(pdu);
            self.phase = SendPhase::Complete;
            return Ok(frame);
        }

        let mut frame = Vec::with_capacity(2 + FIRST_PAYLOAD);
        frame.push((PCI_FIRST << 4) | ((pdu.len() >> 8) as u8 & 0x0F));
        frame.push((pdu.len() & 0xFF) as u8);
        frame.extend_from_slice(&pdu[..FIRST_PAYLOAD]);

        self.pdu = pdu.to_vec();
        self.offset = FIRST_PAYLOAD;
        self.sequence = 1;
        self.phase = SendPhase::AwaitFlowControl;
        Ok(frame)
    }

    /// Consumes a flow control frame from the peer.
    ///
    /// # Errors
    ///
    /// [`IsotpError::UnexpectedFlowControl`] when no transfer is waiting,
    /// [`IsotpError::Overflow`] when the peer aborts, and
    /// [`IsotpError::InvalidFlowStatus`] / [`IsotpError::Truncated`] for
    /// malformed frames. Overflow and bad status abort the transfer.
    pub fn on_flow_control(&mut self, data: &[u8]) -> Result<(), IsotpError> {
        if self.phase != SendPhase::AwaitFlowControl {
            return Err(IsotpError::UnexpectedFlowControl);
        }
        if data.len() < 3 {
            return Err(IsotpError::Truncated);
        }
        match data[0] & 0x0F {
            FLOW_CONTINUE => {
                self.block_size = data[1];
                self.st_min = decode_st_min(data[2]);
                self.sent_in_block = 0;
                self.phase = SendPhase::Sending;
                Ok(())
            }
            // The peer needs time; stay put until the next flow control.
            FLOW_WAIT => Ok(()),
            FLOW_OVERFLOW => {
                self.phase = SendPhase::Idle;
                Err(IsotpError::Overflow)
            }
            status => {
                self.phase = SendPhase::Idle;
                Err(IsotpError::InvalidFlowStatus { status })
            }
        }
    }

    /// Next consecutive frame payload, or `None` when the sender must wait
    /// (for flow control, or because the transfer is complete).
    ///
    /// The caller pauses [`st_min`](Self::st_min) between frames.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.phase != SendPhase::Sending {
            return None;
        }

        let remaining = self.pdu.len() - self.offset;
        let take = remaining.min(CONSECUTIVE_PAYLOAD);
        let mut frame = Vec::with_capacity(1 + take);
        frame.push((PCI_CONSECUTIVE << 4) | self.sequence);
        frame.extend_from_slice(&self.pdu[self.offset..self.offset + take]);

        self.offset += take;
        self.sequence = (self.sequence + 1) & 0x0F;

        if self.offset >= self.pdu.len() {
            self.phase = SendPhase::Complete;
            self.pdu.clear();
        } else if self.block_size != 0 {
            self.sent_in_block += 1;
            if self.sent_in_block >= self.block_size {
                self.phase = SendPhase::AwaitFlowControl;
            }
        }
        Some(frame)
    }

    /// True once the whole PDU has been handed out.
    pub fn is_complete(&self) -> bool {
        self.phase == SendPhase::Complete
    }

    /// True while the sender is blocked on the peer's flow control.
    pub fn awaiting_flow_control(&self) -> bool {
        self.phase == SendPhase::AwaitFlowControl
    }

    /// Pacing gap the peer requested between consecutive frames.
    pub fn st_min(&self) -> Duration {
        self.st_min
    }
}

impl Default for IsotpSender {
    fn default() -> Self {
        Self::new()
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

/// Something the caller must act on after feeding a frame to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsotpEvent {
    /// Put this flow control payload on the bus for the peer.
    FlowControl(Vec<u8>),
    /// A complete PDU was reassembled.
    Pdu(Vec<u8>),
}

/// Inbound reassembly state machine.
#[derive(Debug)]
pub struct IsotpReceiver {
    buf: Vec<u8>,
    expected: usize,
    sequence: u8,
    active: bool,
    /// Block size we announce in flow control; 0 means no limit.
    block_size: u8,
    /// Raw separation-time byte we announce in flow control.
    st_min_raw: u8,
    received_in_block: u8,
}

impl IsotpReceiver {
    /// A receiver that announces no block limit and no separation time.
    pub fn new() -> Self {
        Self::with_flow_params(0, 0)
    }

    /// A receiver announcing the given block size and raw STmin byte.
    pub fn with_flow_params(block_size: u8, st_min_raw: u8) -> Self {
        Self {
            buf: Vec::new(),
            expected: 0,
            sequence: 0,
            active: false,
            block_size,
            st_min_raw,
            received_in_block: 0,
        }
    }

    /// Feeds one received frame payload to the reassembler.
    ///
    /// Returns the flow control to transmit, a completed PDU, or nothing.
    /// Stray consecutive frames outside a transfer and flow control frames
    /// are ignored. An oversized first frame is answered with an overflow
    /// flow control and dropped.
    ///
    /// # Errors
    ///
    /// Sequence and framing errors abort the transfer in progress.
    pub fn on_frame(&mut self, data: &[u8]) -> Result<Option<IsotpEvent>, IsotpError> {
        let kind = match frame_kind(data) {
            Some(kind) => kind,
            None => {
                return Err(IsotpError::UnknownPci {
                    pci: data.first().map_or(0, |b| b >> 4),
                })
            }
        };

        match kind {
            FrameKind::Single => self.on_single(data),
            FrameKind::First => self.on_first(data),
            FrameKind::Consecutive => self.on_consecutive(data),
            // Flow control belongs to the sending side; tolerate it here.
            FrameKind::FlowControl => Ok(None),
        }
    }

    fn on_single(&mut self, data: &[u8]) -> Result<Option<IsotpEvent>, IsotpError> {
        let len = usize::from(data[0] & 0x0F);
        if len == 0 || len > SINGLE_MAX || data.len() < 1 + len {
            return Err(IsotpError::Truncated);
        }
        // A single frame aborts any reassembly in progress.
        self.active = false;
        Ok(Some(IsotpEvent::Pdu(data[1..1 + len].to_vec())))
    }

    fn on_first(&mut self, data: &[u8]) -> Result<Option<IsotpEvent>, IsotpError> {
        if data.len() < 2 {
            return Err(IsotpError::Truncated);
        }
        let len = (usize::from(data[0] & 0x0F) << 8) | usize::from(data[1]);
        if len <= SINGLE_MAX {
            return Err(IsotpError::InvalidFirstFrame { len });
        }
        if len > MAX_PDU {
            // Cannot happen with a 12-bit field, but keep the guard with the
            // overflow answer it would deserve.
            self.active = false;
            return Ok(Some(IsotpEvent::FlowControl(vec![
                (PCI_FLOW_CONTROL << 4) | FLOW_OVERFLOW,
                0,
                0,
            ])));
        }
        let payload = &data[2..data.len().min(2 + FIRST_PAYLOAD)];

        self.buf.clear();
        self.buf.extend_from_slice(payload);
        self.expected = len;
        self.sequence = 1;
        self.active = true;
        self.received_in_block = 0;

        Ok(Some(IsotpEvent::FlowControl(vec![
            (PCI_FLOW_CONTROL << 4) | FLOW_CONTINUE,
            self.block_size,
            self.st_min_raw,
        ])))
    }

    fn on_consecutive(&mut self, data: &[u8]) -> Result<Option<IsotpEvent>, IsotpError> {
        if !self.active {
            // Late frame from an aborted transfer; nothing to do.
            return Ok(None);
        }
        let sn = data[0] & 0x0F;
        if sn != self.sequence {
            self.active = false;
            return Err(IsotpError::SequenceMismatch {
                got: sn,
                expected: self.sequence,
            });
        }
        self.sequence = (self.sequence + 1) & 0x0F;

        let remaining = self.expected - self.buf.len();
        let available = data.len() - 1;
        let take = remaining.min(CONSECUTIVE_PAYLOAD).min(available);
        self.buf.extend_from_slice(&data[1..1 + take]);

        if self.buf.len() >= self.expected {
            self.active = false;
            return Ok(Some(IsotpEvent::Pdu(std::mem::take(&mut self.buf))));
        }
        if available < CONSECUTIVE_PAYLOAD {
            // A short frame that does not finish the PDU starves the
            // transfer; abort rather than hang.
            self.active = false;
            return Err(IsotpError::Truncated);
        }
        if self.block_size != 0 {
            self.received_in_block += 1;
            if self.received_in_block >= self.block_size {
                self.received_in_block = 0;
                return Ok(Some(IsotpEvent::FlowControl(vec![
                    (PCI_FLOW_CONTROL << 4) | FLOW_CONTINUE,
                    self.block_size,
                    self.st_min_raw,
                ])));
            }
        }
        Ok(None)
    }

    /// True while a multi-frame reassembly is in progress.
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Default for IsotpReceiver {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
