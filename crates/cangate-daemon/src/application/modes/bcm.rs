//! Broadcast-manager mode: cyclic transmission jobs and filtered reception.
//!
//! The kernel BCM is not used; jobs run as per-session tokio tasks and
//! subscription filtering happens in the session.  Like kernel BCM timers,
//! jobs keep cycling while the client visits other modes and stop on
//! `< delete >` or disconnect.  Subscription filters stay registered across
//! mode switches but only deliver frames while the session sits in BCM mode.
//!
//! Commands:
//!
//! | command                           | effect                               |
//! |-----------------------------------|--------------------------------------|
//! | `< add sec usec id dlc data >`    | start (or replace) a cyclic job      |
//! | `< update id dlc data >`          | swap a job's payload, keep its timer |
//! | `< delete id >`                   | stop a cyclic job                    |
//! | `< send id dlc data >`            | one-shot transmit                    |
//! | `< subscribe sec usec id >`       | relay matching frames, throttled     |
//! | `< unsubscribe id >`              | stop relaying an identifier          |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

use cangate_core::can::{format_frame, parse_frame_elements};
use cangate_core::protocol::session::{apply, SessionState, Transition};
use cangate_core::protocol::token::{element_bytes, element_str};
use cangate_core::{BusFrame, CanId, Frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{next_bus_frame, reject_unknown, INVALID_PARAMETERS, NO_BUS};
use crate::application::session::{
    send_reply, FrameReader, SessionContext, SessionError, SessionShared,
};
use crate::infrastructure::bus::BusTransport;

const NO_SUCH_ENTRY: &str = "< error no such entry >";

// ── BCM state ─────────────────────────────────────────────────────────────────

struct CyclicJob {
    payload: Arc<Mutex<BusFrame>>,
    abort: AbortHandle,
}

struct Subscription {
    interval: Duration,
    last_forwarded: Option<Instant>,
}

impl Subscription {
    /// Rate-limits relaying: at most one frame per interval, every frame
    /// when the interval is zero.
    fn should_forward(&mut self, now: Instant) -> bool {
        if self.interval.is_zero() {
            return true;
        }
        match self.last_forwarded {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_forwarded = Some(now);
                true
            }
        }
    }
}

/// Cyclic jobs and subscriptions of one session, keyed by CAN identifier.
#[derive(Default)]
pub struct BcmState {
    jobs: HashMap<CanId, CyclicJob>,
    subscriptions: HashMap<CanId, Subscription>,
}

impl BcmState {
    /// Starts a cyclic transmission task, replacing any job on the same
    /// identifier.
    fn add_job(&mut self, bus: &Arc<dyn BusTransport>, interval: Duration, frame: BusFrame) {
        let id = frame.id;
        self.delete_job(&id);

        let payload = Arc::new(Mutex::new(frame));
        let task_payload = Arc::clone(&payload);
        let bus = Arc::clone(bus);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let frame = match task_payload.lock() {
                    Ok(guard) => guard.clone(),
                    Err(_) => break,
                };
                if let Err(e) = bus.send(&frame).await {
                    warn!("cyclic transmit failed: {e}");
                    break;
                }
            }
        });
        self.jobs.insert(
            id,
            CyclicJob {
                payload,
                abort: task.abort_handle(),
            },
        );
    }

    /// Replaces a job's payload without touching its timer.
    fn update_job(&mut self, frame: BusFrame) -> bool {
        match self.jobs.get(&frame.id) {
            Some(job) => match job.payload.lock() {
                Ok(mut guard) => {
                    *guard = frame;
                    true
                }
                Err(_) => false,
            },
            None => false,
        }
    }

    fn delete_job(&mut self, id: &CanId) -> bool {
        match self.jobs.remove(id) {
            Some(job) => {
                job.abort.abort();
                true
            }
            None => false,
        }
    }

    fn subscribe(&mut self, id: CanId, interval: Duration) {
        self.subscriptions.insert(
            id,
            Subscription {
                interval,
                last_forwarded: None,
            },
        );
    }

    fn unsubscribe(&mut self, id: &CanId) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    fn should_forward(&mut self, id: &CanId, now: Instant) -> bool {
        match self.subscriptions.get_mut(id) {
            Some(sub) => sub.should_forward(now),
            None => false,
        }
    }
}

impl Drop for BcmState {
    fn drop(&mut self) {
        for job in self.jobs.values() {
            job.abort.abort();
        }
    }
}

// ── Mode handler ──────────────────────────────────────────────────────────────

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
                match apply(SessionState::Bcm, frame.as_bytes()) {
                    Transition::Entered(next) => return Ok(next),
                    Transition::Stayed => continue,
                    Transition::NotASwitch => {}
                }
                handle_command(writer, &frame, shared, bus.as_ref(), ctx).await?;
            }
            received = next_bus_frame(bus.as_ref()) => {
                let (bus_frame, ts) = received?;
                if shared.bcm.should_forward(&bus_frame.id, Instant::now()) {
                    let stamp = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
                    send_reply(writer, &format_frame(&bus_frame, stamp)).await?;
                }
            }
        }
    }
}

async fn handle_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    shared: &mut SessionShared,
    bus: Option<&Arc<dyn BusTransport>>,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let verb = element_str(frame.as_bytes(), 1);
    if verb == Some("echo") {
        return send_reply(writer, "< echo >").await;
    }

    let Some(bus) = bus else {
        return send_reply(writer, NO_BUS).await;
    };

    match verb {
        Some("add") => match parse_job(frame, ctx.data_limit) {
            Some((interval, out)) => {
                if interval.is_zero() {
                    // A zero interval is a one-shot transmission.
                    bus.send(&out).await?;
                } else {
                    debug!(session = %ctx.id, id = %out.id, ?interval, "cyclic job added");
                    shared.bcm.add_job(bus, interval, out);
                }
                send_reply(writer, "< ok >").await
            }
            None => send_reply(writer, INVALID_PARAMETERS).await,
        },
        Some("update") => match parse_frame_elements(frame.as_bytes(), 2, ctx.data_limit) {
            Ok(out) => {
                if shared.bcm.update_job(out) {
                    send_reply(writer, "< ok >").await
                } else {
                    send_reply(writer, NO_SUCH_ENTRY).await
                }
            }
            Err(_) => send_reply(writer, INVALID_PARAMETERS).await,
        },
        Some("delete") => match parse_id(frame, 2) {
            Some(id) => {
                if shared.bcm.delete_job(&id) {
                    debug!(session = %ctx.id, id = %id, "cyclic job deleted");
                    send_reply(writer, "< ok >").await
                } else {
                    send_reply(writer, NO_SUCH_ENTRY).await
                }
            }
            None => send_reply(writer, INVALID_PARAMETERS).await,
        },
        Some("send") => match parse_frame_elements(frame.as_bytes(), 2, ctx.data_limit) {
            Ok(out) => {
                bus.send(&out).await?;
                send_reply(writer, "< ok >").await
            }
            Err(_) => send_reply(writer, INVALID_PARAMETERS).await,
        },
        Some("subscribe") => {
            let interval = parse_interval(frame.as_bytes(), 2);
            let id = parse_id(frame, 4);
            match (interval, id) {
                (Some(interval), Some(id)) => {
                    shared.bcm.subscribe(id, interval);
                    send_reply(writer, "< ok >").await
                }
                _ => send_reply(writer, INVALID_PARAMETERS).await,
            }
        }
        Some("unsubscribe") => match parse_id(frame, 2) {
            Some(id) => {
                if shared.bcm.unsubscribe(&id) {
                    send_reply(writer, "< ok >").await
                } else {
                    send_reply(writer, NO_SUCH_ENTRY).await
                }
            }
            None => send_reply(writer, INVALID_PARAMETERS).await,
        },
        _ => reject_unknown(writer, frame).await,
    }
}

// ── Command parsing ───────────────────────────────────────────────────────────

/// Parses `< add sec usec id dlc data... >` into interval and frame.
fn parse_job(frame: &Frame, data_limit: usize) -> Option<(Duration, BusFrame)> {
    let interval = parse_interval(frame.as_bytes(), 2)?;
    let out = parse_frame_elements(frame.as_bytes(), 4, data_limit).ok()?;
    Some((interval, out))
}

/// Parses a `sec usec` pair starting at `first_element`.
fn parse_interval(frame: &[u8], first_element: usize) -> Option<Duration> {
    let secs: u64 = element_str(frame, first_element)?.parse().ok()?;
    let micros: u32 = element_str(frame, first_element + 1)?.parse().ok()?;
    if micros >= 1_000_000 {
        return None;
    }
    Some(Duration::new(secs, micros * 1_000))
}

fn parse_id(frame: &Frame, element: usize) -> Option<CanId> {
    CanId::parse(element_bytes(frame.as_bytes(), element)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
