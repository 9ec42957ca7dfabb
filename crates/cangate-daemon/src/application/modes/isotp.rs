//! ISO-TP mode: segmented transfer-protocol exchange on the session's bus.
//!
//! `< config tx_id rx_id >` pins the identifier pair, `< sendpdu hex >`
//! segments and transmits a payload, and reassembled incoming transfers are
//! delivered as `< pdu hex >`.  Flow control frames are generated and
//! honored per ISO 15765-2; anything arriving on identifiers other than the
//! configured receive id is ignored.
//!
//! The segmentation engines live in `cangate_core::isotp`; this handler only
//! moves their frames to and from the bus.  Engines reset on `< config >`
//! and when the client leaves the mode; an unanswered first frame is
//! abandoned after a one second flow control timeout.

use std::sync::Arc;
use std::time::Duration;

use cangate_core::can::{hex_string, parse_hex_data};
use cangate_core::isotp::{frame_kind, FrameKind, IsotpError, IsotpEvent, IsotpReceiver, IsotpSender};
use cangate_core::protocol::session::{apply, SessionState, Transition};
use cangate_core::protocol::token::{element_bytes, element_str};
use cangate_core::{BusFrame, CanId, Frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{next_bus_frame, reject_unknown, INVALID_PARAMETERS, NO_BUS};
use crate::application::session::{
    send_reply, FrameReader, SessionContext, SessionError, SessionShared,
};
use crate::infrastructure::bus::BusTransport;

const NOT_CONFIGURED: &str = "< error no isotp channel >";
const TRANSFER_BUSY: &str = "< error transfer busy >";

/// How long an outgoing transfer waits for the peer's flow control frame.
const FLOW_CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Identifier pair of an ISO-TP channel; survives mode switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsotpChannel {
    /// Identifier this gateway transmits on.
    pub tx_id: CanId,
    /// Identifier the peer transmits on.
    pub rx_id: CanId,
}

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
    let mut tx = IsotpSender::new();
    let mut rx = IsotpReceiver::new();
    loop {
        tokio::select! {
            frame = reader.next_frame() => {
                let Some(frame) = frame? else {
                    return Ok(SessionState::Shutdown);
                };
                match apply(SessionState::Isotp, frame.as_bytes()) {
                    Transition::Entered(next) => return Ok(next),
                    Transition::Stayed => continue,
                    Transition::NotASwitch => {}
                }
                match element_str(frame.as_bytes(), 1) {
                    Some("config") => {
                        match parse_channel(&frame) {
                            Some(channel) => {
                                debug!(session = %ctx.id, tx_id = %channel.tx_id, rx_id = %channel.rx_id, "isotp channel configured");
                                shared.isotp = Some(channel);
                                tx = IsotpSender::new();
                                rx = IsotpReceiver::new();
                                send_reply(writer, "< ok >").await?;
                            }
                            None => send_reply(writer, INVALID_PARAMETERS).await?,
                        }
                    }
                    Some("sendpdu") => {
                        handle_sendpdu(writer, &mut tx, shared.isotp.as_ref(), bus.as_ref(), &frame, ctx).await?;
                    }
                    Some("echo") => send_reply(writer, "< echo >").await?,
                    _ => reject_unknown(writer, &frame).await?,
                }
            }
            received = next_bus_frame(bus.as_ref()) => {
                let (bus_frame, _ts) = received?;
                let Some(channel) = shared.isotp else { continue };
                if bus_frame.id != channel.rx_id {
                    continue;
                }
                if let Some(bus) = bus.as_ref() {
                    handle_bus_frame(writer, &mut tx, &mut rx, &bus_frame.data, channel.tx_id, bus, ctx).await?;
                }
            }
            _ = tokio::time::sleep(FLOW_CONTROL_TIMEOUT), if tx.awaiting_flow_control() => {
                warn!(session = %ctx.id, "flow control timeout, transfer abandoned");
                tx = IsotpSender::new();
            }
        }
    }
}

fn parse_channel(frame: &Frame) -> Option<IsotpChannel> {
    let tx_id = CanId::parse(element_bytes(frame.as_bytes(), 2)?)?;
    let rx_id = CanId::parse(element_bytes(frame.as_bytes(), 3)?)?;
    Some(IsotpChannel { tx_id, rx_id })
}

async fn handle_sendpdu<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tx: &mut IsotpSender,
    channel: Option<&IsotpChannel>,
    bus: Option<&Arc<dyn BusTransport>>,
    frame: &Frame,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let Some(bus) = bus else {
        return send_reply(writer, NO_BUS).await;
    };
    let Some(channel) = channel else {
        return send_reply(writer, NOT_CONFIGURED).await;
    };
    let Some(payload) = element_bytes(frame.as_bytes(), 2).and_then(parse_hex_data) else {
        return send_reply(writer, INVALID_PARAMETERS).await;
    };

    match tx.start(&payload) {
        Ok(first) => {
            bus.send(&BusFrame::new(channel.tx_id, first)).await?;
            Ok(())
        }
        Err(IsotpError::TransferInProgress) => send_reply(writer, TRANSFER_BUSY).await,
        Err(e) => {
            debug!(session = %ctx.id, "sendpdu rejected: {e}");
            send_reply(writer, INVALID_PARAMETERS).await
        }
    }
}

async fn handle_bus_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tx: &mut IsotpSender,
    rx: &mut IsotpReceiver,
    data: &[u8],
    tx_id: CanId,
    bus: &Arc<dyn BusTransport>,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    if frame_kind(data) == Some(FrameKind::FlowControl) {
        match tx.on_flow_control(data) {
            Ok(()) => drain_consecutive(tx, bus, tx_id).await,
            Err(e) => {
                debug!(session = %ctx.id, "flow control rejected: {e}");
                Ok(())
            }
        }
    } else {
        match rx.on_frame(data) {
            Ok(Some(IsotpEvent::FlowControl(fc))) => {
                bus.send(&BusFrame::new(tx_id, fc)).await?;
                Ok(())
            }
            Ok(Some(IsotpEvent::Pdu(pdu))) => {
                send_reply(writer, &format!("< pdu {} >", hex_string(&pdu))).await
            }
            Ok(None) => Ok(()),
            Err(e) => {
                debug!(session = %ctx.id, "reassembly error: {e}");
                Ok(())
            }
        }
    }
}

/// Transmits consecutive frames until the block (or the whole transfer)
/// completes, spacing them by the peer's requested minimum gap.
async fn drain_consecutive(
    tx: &mut IsotpSender,
    bus: &Arc<dyn BusTransport>,
    tx_id: CanId,
) -> Result<(), SessionError> {
    let gap = tx.st_min();
    while let Some(cf) = tx.next_frame() {
        bus.send(&BusFrame::new(tx_id, cf)).await?;
        if !gap.is_zero() {
            tokio::time::sleep(gap).await;
        }
    }
    Ok(())
}
