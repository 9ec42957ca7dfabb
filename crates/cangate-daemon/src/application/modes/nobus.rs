//! No-bus mode: the session's starting state.
//!
//! Only `< open busname >` does real work here.  On success the daemon
//! replies `< ok >` and the session enters BCM mode, which is what CAN
//! gateway clients expect after opening a bus.

use cangate_core::protocol::session::{apply, SessionState, Transition};
use cangate_core::protocol::token::element_str;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::{reject_unknown, INVALID_PARAMETERS};
use crate::application::session::{
    send_reply, FrameReader, SessionContext, SessionError, SessionShared,
};

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
    loop {
        let Some(frame) = reader.next_frame().await? else {
            return Ok(SessionState::Shutdown);
        };
        match apply(SessionState::NoBus, frame.as_bytes()) {
            Transition::Entered(next) => return Ok(next),
            Transition::Stayed => continue,
            Transition::NotASwitch => {}
        }

        match element_str(frame.as_bytes(), 1) {
            Some("open") => {
                let Some(bus_name) = element_str(frame.as_bytes(), 2) else {
                    send_reply(writer, INVALID_PARAMETERS).await?;
                    continue;
                };
                match ctx.provider.open(bus_name) {
                    Ok(bus) => {
                        info!(session = %ctx.id, bus = %bus_name, "bus opened");
                        shared.bus = Some(bus);
                        send_reply(writer, "< ok >").await?;
                        return Ok(SessionState::Bcm);
                    }
                    Err(e) => {
                        warn!(session = %ctx.id, bus = %bus_name, "open failed: {e}");
                        send_reply(writer, "< error could not open bus >").await?;
                    }
                }
            }
            Some("echo") => send_reply(writer, "< echo >").await?,
            _ => reject_unknown(writer, &frame).await?,
        }
    }
}
