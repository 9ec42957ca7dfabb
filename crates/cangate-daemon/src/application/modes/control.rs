//! Control mode: interface statistics streaming.
//!
//! `< statistics interval_ms >` starts periodic `< stat ... >` reports for
//! the opened bus; an interval of zero stops the stream.  The first report
//! is sent immediately, later ones follow the requested cadence.  Counters
//! come from `/proc/net/dev`; a bus the kernel does not report shows zeros.

use std::time::Duration;

use cangate_core::protocol::session::{apply, SessionState, Transition};
use cangate_core::protocol::token::element_str;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{reject_unknown, INVALID_PARAMETERS, NO_BUS};
use crate::application::session::{
    send_reply, FrameReader, SessionContext, SessionError, SessionShared,
};
use crate::infrastructure::stats::{read_counters, BusCounters};

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
    let bus_name = shared.bus.as_ref().map(|bus| bus.name().to_string());
    let mut stream_interval: Option<Duration> = None;
    let mut next_report = tokio::time::Instant::now();

    loop {
        tokio::select! {
            frame = reader.next_frame() => {
                let Some(frame) = frame? else {
                    return Ok(SessionState::Shutdown);
                };
                match apply(SessionState::Control, frame.as_bytes()) {
                    Transition::Entered(next) => return Ok(next),
                    Transition::Stayed => continue,
                    Transition::NotASwitch => {}
                }
                match element_str(frame.as_bytes(), 1) {
                    Some("statistics") => {
                        if bus_name.is_none() {
                            send_reply(writer, NO_BUS).await?;
                            continue;
                        }
                        match element_str(frame.as_bytes(), 2).and_then(|s| s.parse::<u64>().ok()) {
                            Some(0) => {
                                debug!(session = %ctx.id, "statistics stream stopped");
                                stream_interval = None;
                            }
                            Some(ms) => {
                                debug!(session = %ctx.id, interval_ms = ms, "statistics stream started");
                                stream_interval = Some(Duration::from_millis(ms));
                                next_report = tokio::time::Instant::now();
                            }
                            None => send_reply(writer, INVALID_PARAMETERS).await?,
                        }
                    }
                    Some("echo") => send_reply(writer, "< echo >").await?,
                    _ => reject_unknown(writer, &frame).await?,
                }
            }
            _ = tokio::time::sleep_until(next_report), if stream_interval.is_some() => {
                let (Some(interval), Some(name)) = (stream_interval, bus_name.as_deref()) else {
                    continue;
                };
                let counters = read_counters(name).unwrap_or_default();
                send_reply(writer, &render_stat(name, &counters)).await?;
                next_report = tokio::time::Instant::now() + interval;
            }
        }
    }
}

fn render_stat(bus: &str, c: &BusCounters) -> String {
    format!(
        "< stat {} {} {} {} {} >",
        bus, c.rx_packets, c.rx_bytes, c.tx_packets, c.tx_bytes
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
