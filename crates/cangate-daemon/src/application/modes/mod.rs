//! Per-mode command handlers.
//!
//! Each handler owns the connection until the client switches modes or
//! disconnects.  Commands are only valid in their own mode, and bus traffic
//! only reaches the client in the modes that define a relay format.

pub mod bcm;
pub mod control;
pub mod isotp;
pub mod nobus;
pub mod raw;

use std::sync::Arc;
use std::time::SystemTime;

use cangate_core::protocol::token::element_str;
use cangate_core::{BusFrame, Frame};
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::application::session::{send_reply, SessionError};
use crate::infrastructure::bus::{BusError, BusTransport};

/// Reply for syntactically broken command arguments.
pub(crate) const INVALID_PARAMETERS: &str = "< error invalid parameters >";

/// Reply for commands that need a bus before `< open >` succeeded.
pub(crate) const NO_BUS: &str = "< error no bus selected >";

/// Sends the unknown-command error naming the offending verb.
pub(crate) async fn reject_unknown<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), SessionError> {
    let verb = element_str(frame.as_bytes(), 1).unwrap_or("");
    debug!(command = %verb, "unknown command");
    send_reply(writer, &format!("< error unknown command '{verb}' >")).await
}

/// Receives from the bus when one is open; pends forever otherwise, so the
/// call can sit in a `select!` arm unconditionally.
pub(crate) async fn next_bus_frame(
    bus: Option<&Arc<dyn BusTransport>>,
) -> Result<(BusFrame, SystemTime), BusError> {
    match bus {
        Some(bus) => bus.recv().await,
        None => std::future::pending().await,
    }
}
