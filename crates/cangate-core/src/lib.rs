//! cangate-core: protocol building blocks for the cangate daemon.
//!
//! The daemon bridges TCP and Unix-socket clients to CAN buses. Everything
//! here is transport-free and synchronous so it can be tested without a
//! socket or a CAN interface in sight:
//!
//! - [`protocol::assembler`] — cuts `< ... >` frames out of the byte stream.
//! - [`protocol::token`] — positional access to a frame's elements.
//! - [`protocol::session`] — the per-connection mode state machine.
//! - [`can`] — CAN frame model and its ASCII wire rendering.
//! - [`isotp`] — ISO 15765-2 segmentation and reassembly.
//!
//! The daemon crate owns all I/O: sockets, CAN transports, timers.

pub mod can;
pub mod isotp;
pub mod protocol;

pub use can::{BusFrame, CanId};
pub use protocol::assembler::{Frame, FrameAssembler, FrameError, MAX_FRAME_BUFFER};
pub use protocol::session::SessionState;
