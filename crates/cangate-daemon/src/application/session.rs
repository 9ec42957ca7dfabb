//! Client session loop.
//!
//! One session runs per connected client, fully isolated from its siblings:
//! it owns its stream halves, its frame assembler and whatever bus transport
//! it opened.  After the `< hi >` greeting the session starts in the no-bus
//! mode and hands the connection to one mode handler at a time; handlers
//! return when the client switches modes (or disconnects), and the loop here
//! dispatches to the next handler until the session shuts down.
//!
//! Mode switches are recognized centrally (`cangate_core::protocol::session`)
//! so every handler treats `< rawmode >`, `< bcmmode >`, `< isotpmode >` and
//! `< controlmode >` identically; switching to the current mode is silently
//! ignored without leaving the handler, so handler-local state survives.

use std::sync::Arc;

use cangate_core::protocol::session::SessionState;
use cangate_core::{Frame, FrameAssembler, FrameError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::application::modes::{self, bcm::BcmState, isotp::IsotpChannel};
use crate::infrastructure::bus::{BusError, BusProvider, BusTransport};
use crate::infrastructure::network::acceptor::AckHint;

/// First bytes every client receives.
pub const GREETING: &str = "< hi >";

/// Read chunk size for the client socket.
const READ_CHUNK: usize = 2048;

/// Error type for a running session.  Any of these ends the session; replies
/// like `< error unknown command '...' >` are not errors, the handlers send
/// them and carry on.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client violated the framing protocol.
    #[error("frame assembly failed: {0}")]
    Frame(#[from] FrameError),

    /// The client socket failed.
    #[error("client I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The session's bus transport failed.
    #[error("bus failed: {0}")]
    Bus(#[from] BusError),
}

/// Immutable per-session data handed to every mode handler.
pub struct SessionContext {
    pub id: Uuid,
    /// Peer description for logs.
    pub peer: String,
    /// Quick-ack hint for the client socket; re-armed before every read.
    pub ack: AckHint,
    pub provider: Arc<dyn BusProvider>,
    /// Maximum data bytes per client frame: 8, or 64 on CAN FD buses.
    pub data_limit: usize,
}

/// Mutable state that survives mode switches within one session.
///
/// The opened bus, cyclic transmission jobs and the ISO-TP channel
/// configuration persist until the client replaces them or disconnects;
/// everything else is local to a handler invocation.
pub struct SessionShared {
    pub bus: Option<Arc<dyn BusTransport>>,
    pub bcm: BcmState,
    pub isotp: Option<IsotpChannel>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            bus: None,
            bcm: BcmState::default(),
            isotp: None,
        }
    }
}

// ── Frame reader ──────────────────────────────────────────────────────────────

/// Reads client bytes and yields complete bracket frames.
///
/// The socket is only read while the assembler holds no complete frame, and
/// never for more bytes than the assembler can accept.  Before each read the
/// quick-ack hint re-arms `TCP_QUICKACK`.
pub struct FrameReader<R> {
    rd: R,
    asm: FrameAssembler,
    ack: AckHint,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(rd: R, ack: AckHint) -> Self {
        Self {
            rd,
            asm: FrameAssembler::new(),
            ack,
            chunk: vec![0; READ_CHUNK],
        }
    }

    /// Waits for the next complete frame; `Ok(None)` means the peer closed
    /// the connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Frame`] when the client fills the receive
    /// buffer without ever completing a frame, and [`SessionError::Io`] for
    /// socket errors.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, SessionError> {
        loop {
            if let Some(frame) = self.asm.extract()? {
                return Ok(Some(frame));
            }
            let want = self.asm.remaining_capacity().min(self.chunk.len());
            self.ack.rearm();
            let n = self.rd.read(&mut self.chunk[..want]).await?;
            if n == 0 {
                return Ok(None);
            }
            self.asm.append(&self.chunk[..n]);
        }
    }
}

/// Writes one reply frame to the client.
pub async fn send_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    text: &str,
) -> Result<(), SessionError> {
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

// ── Session loop ──────────────────────────────────────────────────────────────

/// Runs one client session to completion.
///
/// Returns `Ok(())` when the client disconnects; the error cases are framing
/// violations, socket failures and bus failures.
pub async fn run_session<S>(stream: S, ctx: SessionContext) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (rd, wr) = tokio::io::split(stream);
    let mut reader = FrameReader::new(rd, ctx.ack);
    let mut writer = wr;

    send_reply(&mut writer, GREETING).await?;

    let mut shared = SessionShared::new();
    let mut state = SessionState::NoBus;
    loop {
        let next = match state {
            SessionState::NoBus => {
                modes::nobus::run(&mut reader, &mut writer, &mut shared, &ctx).await?
            }
            SessionState::Raw => {
                modes::raw::run(&mut reader, &mut writer, &mut shared, &ctx).await?
            }
            SessionState::Bcm => {
                modes::bcm::run(&mut reader, &mut writer, &mut shared, &ctx).await?
            }
            SessionState::Isotp => {
                modes::isotp::run(&mut reader, &mut writer, &mut shared, &ctx).await?
            }
            SessionState::Control => {
                modes::control::run(&mut reader, &mut writer, &mut shared, &ctx).await?
            }
            SessionState::Shutdown => break,
        };
        if next != state && next != SessionState::Shutdown {
            debug!(session = %ctx.id, from = %state, to = %next, "mode changed");
        }
        state = next;
    }
    Ok(())
}
