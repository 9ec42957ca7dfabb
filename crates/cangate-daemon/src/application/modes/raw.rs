//! Raw mode: unfiltered frame relay.
//!
//! Every frame seen on the bus is forwarded to the client as
//! `< frame id sec.usec data >`, and `< send id dlc data >` transmits onto
//! the bus.  Transmits are not acknowledged; the mode is meant for
//! full-rate traffic.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use cangate_core::can::{format_frame, parse_frame_elements};
use cangate_core::protocol::session::{apply, SessionState, Transition};
use cangate_core::protocol::token::element_str;
use cangate_core::Frame;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{next_bus_frame, reject_unknown, INVALID_PARAMETERS, NO_BUS};
use crate::application::session::{
    send_reply, FrameReader, SessionContext, SessionError, SessionShared,
};
use crate::infrastructure::bus::BusTransport;

pub async fn run<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    shared: &mut SessionShared,
    ctx: &SessionContext,
) -> Result<SessionState, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bus = shared.bus.clone();
    loop {
        tokio::select! {
            frame = reader.next_frame() => {
                let Some(frame) = frame? else {
                    return Ok(SessionState::Shutdown);
                };
                match apply(SessionState::Raw, frame.as_bytes()) {
                    Transition::Entered(next) => return Ok(next),
                    Transition::Stayed => continue,
                    Transition::NotASwitch => {}
                }
                match element_str(frame.as_bytes(), 1) {
                    Some("send") => handle_send(writer, &frame, bus.as_ref(), ctx).await?,
                    Some("echo") => send_reply(writer, "< echo >").await?,
                    _ => reject_unknown(writer, &frame).await?,
                }
            }
            received = next_bus_frame(bus.as_ref()) => {
                let (bus_frame, ts) = received?;
                let stamp = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
                send_reply(writer, &format_frame(&bus_frame, stamp)).await?;
            }
        }
    }
}

async fn handle_send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    bus: Option<&Arc<dyn BusTransport>>,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let Some(bus) = bus else {
        return send_reply(writer, NO_BUS).await;
    };
    match parse_frame_elements(frame.as_bytes(), 2, ctx.data_limit) {
        Ok(out) => {
            bus.send(&out).await?;
            Ok(())
        }
        Err(e) => {
            debug!(session = %ctx.id, "send rejected: {e}");
            send_reply(writer, INVALID_PARAMETERS).await
        }
    }
}
