//! Interface traffic statistics.
//!
//! Counters come from `/proc/net/dev`, which the kernel updates for CAN
//! interfaces like for any other netdev.  The parser is separated from the
//! file read so it can be tested with captured text on any platform.
//!
//! Two consumers: the control-mode `< statistics >` stream, and an optional
//! background sampler that logs one line per bus at a fixed interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

/// Byte and packet counters for one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Extracts the counters for `interface` from `/proc/net/dev` text.
///
/// Returns `None` when the interface does not appear or a line is malformed.
pub fn parse_proc_net_dev(text: &str, interface: &str) -> Option<BusCounters> {
    // First two lines are column headers.
    for line in text.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != interface {
            continue;
        }
        // Layout after the colon: 8 receive fields, then 8 transmit fields:
        //   rx: bytes packets errs drop fifo frame compressed multicast
        //   tx: bytes packets errs drop fifo colls carrier compressed
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map_while(|f| f.parse().ok())
            .collect();
        if fields.len() < 10 {
            return None;
        }
        return Some(BusCounters {
            rx_bytes: fields[0],
            rx_packets: fields[1],
            tx_bytes: fields[8],
            tx_packets: fields[9],
        });
    }
    None
}

/// Reads current counters for `interface`, or `None` when unavailable.
pub fn read_counters(interface: &str) -> Option<BusCounters> {
    #[cfg(target_os = "linux")]
    {
        let text = std::fs::read_to_string("/proc/net/dev").ok()?;
        parse_proc_net_dev(&text, interface)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = interface;
        None
    }
}

/// Logs counters for every configured bus at `interval` until `running`
/// clears.
pub async fn run_sampler(buses: Vec<String>, interval: Duration, running: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(interval);
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        for bus in &buses {
            match read_counters(bus) {
                Some(c) => info!(
                    bus = %bus,
                    rx_frames = c.rx_packets,
                    rx_bytes = c.rx_bytes,
                    tx_frames = c.tx_packets,
                    tx_bytes = c.tx_bytes,
                    "bus statistics"
                ),
                None => debug!(bus = %bus, "no statistics available"),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
