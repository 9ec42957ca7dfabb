//! UDP service discovery beacon.
//!
//! Every three seconds the daemon broadcasts a small XML description of
//! itself to port 42000 on the listen interface's broadcast address.
//! Discovery tools on the LAN use it to find reachable gateways and the
//! buses they expose.  Send failures are logged and retried on the next
//! tick; the beacon never takes the daemon down.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// UDP port discovery tools listen on.
pub const BROADCAST_PORT: u16 = 42000;

/// Interval between beacon transmissions.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(3);

/// Renders the beacon XML document.
///
/// ```text
/// <CANBeacon name="gateway-host" type="SocketCAN" description="cangate">
///   <URL>can://192.168.1.5:29536</URL>
///   <Bus name="can0"/>
/// </CANBeacon>
/// ```
pub fn render_beacon(hostname: &str, addr: Ipv4Addr, port: u16, buses: &[String]) -> String {
    let mut out = String::with_capacity(128);
    out.push_str(&format!(
        "<CANBeacon name=\"{hostname}\" type=\"SocketCAN\" description=\"cangate\">\n"
    ));
    out.push_str(&format!("  <URL>can://{addr}:{port}</URL>\n"));
    for bus in buses {
        out.push_str(&format!("  <Bus name=\"{bus}\"/>\n"));
    }
    out.push_str("</CANBeacon>");
    out
}

/// Broadcasts the beacon forever.  Runs as a background task and is aborted
/// on shutdown.
pub async fn run_beacon(
    broadcast: Ipv4Addr,
    service_addr: Ipv4Addr,
    port: u16,
    buses: Vec<String>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("failed to bind beacon socket")?;
    socket
        .set_broadcast(true)
        .context("failed to enable UDP broadcast")?;

    let payload = render_beacon(&hostname(), service_addr, port, &buses);
    let target = SocketAddr::from((broadcast, BROADCAST_PORT));
    debug!(%target, "beacon task started");

    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(payload.as_bytes(), target).await {
            warn!("beacon send failed: {e}");
        }
    }
}

/// The machine's hostname, falling back to the daemon name.
fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            if let Some(end) = buf.iter().position(|&b| b == 0) {
                if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                    if !name.is_empty() {
                        return name.to_string();
                    }
                }
            }
        }
    }
    "cangate".to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
