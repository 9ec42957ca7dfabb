//! Accept loop and per-session task supervision.
//!
//! `run_server` owns the daemon's runtime surface: it resolves the listen
//! endpoint, binds the listener, starts the discovery beacon and the
//! statistics sampler, and accepts clients until the shutdown flag clears.
//! Every client runs in its own task; finished tasks are reaped between
//! accepts, and whatever is still connected is closed in order when the
//! loop exits.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cangate_core::can::{CLASSIC_MAX_DATA, FD_MAX_DATA};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::session::{run_session, SessionContext};
use crate::infrastructure::bus::{BusOptions, BusProvider, ConfiguredBuses};
use crate::infrastructure::network::acceptor::{AcceptedClient, ListenEndpoint, Listener};
use crate::infrastructure::network::addr::{resolve_interface, InterfaceAddrs};
use crate::infrastructure::network::beacon::run_beacon;
use crate::infrastructure::stats::run_sampler;
use crate::infrastructure::storage::config::DaemonConfig;

/// How long one accept attempt may block before the loop re-checks the
/// shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

// ── Endpoint resolution ───────────────────────────────────────────────────────

/// Derives the listen endpoint from the configuration.
///
/// A configured Unix socket supersedes the TCP port/interface settings.  For
/// TCP listeners the interface addresses come back too, so the beacon can
/// announce the service URL.
fn resolve_endpoint(
    cfg: &DaemonConfig,
) -> anyhow::Result<(ListenEndpoint, Option<InterfaceAddrs>)> {
    if let Some(name) = &cfg.unix_socket {
        return Ok((ListenEndpoint::Unix(name.clone()), None));
    }
    let addrs = resolve_interface(&cfg.listen_interface)
        .with_context(|| format!("cannot resolve listen interface '{}'", cfg.listen_interface))?;
    let endpoint = ListenEndpoint::Tcp(SocketAddr::from((addrs.addr, cfg.port)));
    Ok((endpoint, Some(addrs)))
}

// ── Server loop ───────────────────────────────────────────────────────────────

/// Runs the daemon until `running` clears.
///
/// Returns once the listener is closed and every session task has finished.
///
/// # Errors
///
/// Fails on startup problems only: an unresolvable listen interface or a
/// bind failure.  Accept errors and session errors are logged and survived.
pub async fn run_server(cfg: DaemonConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let (endpoint, addrs) = resolve_endpoint(&cfg)?;
    let listener = Listener::bind(&endpoint, cfg.quick_ack)
        .with_context(|| format!("failed to bind listener on {endpoint}"))?;
    info!(%endpoint, buses = ?cfg.buses, "listening");

    // The beacon needs a broadcast address, so it only runs in front of TCP
    // listeners.
    let mut beacon = None;
    if cfg.beacon {
        match addrs {
            Some(ifaddrs) => {
                let port = cfg.port;
                let buses = cfg.buses.clone();
                beacon = Some(tokio::spawn(async move {
                    if let Err(e) = run_beacon(ifaddrs.broadcast, ifaddrs.addr, port, buses).await {
                        warn!("beacon task failed: {e:#}");
                    }
                }));
            }
            None => debug!("beacon not started on a Unix socket listener"),
        }
    }
    let sampler = cfg.stats_interval.map(|interval| {
        tokio::spawn(run_sampler(
            cfg.buses.clone(),
            interval,
            Arc::clone(&running),
        ))
    });

    let provider: Arc<dyn BusProvider> = Arc::new(ConfiguredBuses::new(
        cfg.buses.clone(),
        BusOptions {
            error_mask: cfg.error_mask,
            fd: cfg.can_fd,
        },
    ));
    let data_limit = if cfg.can_fd {
        FD_MAX_DATA
    } else {
        CLASSIC_MAX_DATA
    };

    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown requested, closing the listener");
            break;
        }
        reap_finished(&mut sessions);

        // A short accept timeout keeps the loop responsive to the shutdown
        // flag even when no clients connect.
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok(client)) => {
                let ctx = SessionContext {
                    id: Uuid::new_v4(),
                    peer: client.peer.clone(),
                    ack: client.ack,
                    provider: Arc::clone(&provider),
                    data_limit,
                };
                info!(session = %ctx.id, peer = %ctx.peer, "client connected");
                sessions.spawn(handle_client(client, ctx));
            }
            Ok(Err(e)) => {
                // Transient accept failures (fd exhaustion and kin) must not
                // take the daemon down.
                error!("accept failed: {e}");
            }
            Err(_) => {} // poll timeout, re-check the flag
        }
    }

    // Ordered shutdown: listener first (no new clients), then the
    // announcers, then the remaining sessions.  Every step tolerates being
    // already done.
    drop(listener);
    if let Some(handle) = beacon {
        handle.abort();
    }
    if let Some(handle) = sampler {
        handle.abort();
    }
    let active = sessions.len();
    if active > 0 {
        info!(sessions = active, "closing remaining client sessions");
    }
    sessions.shutdown().await;
    info!("daemon stopped");
    Ok(())
}

/// Observes finished session tasks so the join set stays small.
fn reap_finished(sessions: &mut JoinSet<()>) {
    while let Some(result) = sessions.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                error!("session task panicked: {e}");
            }
        }
    }
}

// ── Per-client handler ────────────────────────────────────────────────────────

/// Entry point of a per-connection task: runs the session and logs how it
/// ended.
async fn handle_client(client: AcceptedClient, ctx: SessionContext) {
    let id = ctx.id;
    let peer = ctx.peer.clone();
    match run_session(client.stream, ctx).await {
        Ok(()) => info!(session = %id, peer = %peer, "session closed"),
        Err(e) => warn!(session = %id, peer = %peer, "session ended with error: {e}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
