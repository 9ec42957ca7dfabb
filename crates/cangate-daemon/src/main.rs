//! cangated — network-to-CAN gateway daemon entry point.
//!
//! Exposes local SocketCAN interfaces to the network: clients connect over
//! TCP (or a Unix socket) and speak the bracket-frame ASCII protocol to
//! relay raw traffic, run cyclic transmission jobs, exchange ISO-TP payloads
//! and stream bus statistics.
//!
//! ```text
//! cangated [-v] [-i can0,vcan1] [-p port] [-l interface] [-u name]
//!          [-q] [-n] [-e error_mask] [-f] [-d] [-c /etc/cangate.toml]
//! ```
//!
//! Settings resolve in three layers: built-in defaults, then the TOML config
//! file, then command-line flags.  The config file is read before anything
//! else so `--verbose` on the command line can still raise the log level the
//! file left at `info`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cangate_daemon::infrastructure::network::server::run_server;
use cangate_daemon::infrastructure::storage::config::{
    load_config, DaemonConfig, DEFAULT_CONFIG_PATH,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Network-to-CAN gateway daemon.
#[derive(Debug, Parser)]
#[command(
    name = "cangated",
    about = "TCP/Unix-socket gateway to SocketCAN buses",
    version
)]
struct Cli {
    /// Log at debug level when no RUST_LOG filter is set.
    #[arg(short, long)]
    verbose: bool,

    /// Comma-separated list of CAN interfaces clients may open
    /// (e.g. 'can0,vcan1').
    #[arg(
        short,
        long,
        value_name = "LIST",
        value_delimiter = ',',
        env = "CANGATE_INTERFACES"
    )]
    interfaces: Option<Vec<String>>,

    /// TCP port to listen on.
    #[arg(short, long, env = "CANGATE_PORT")]
    port: Option<u16>,

    /// Network interface whose address the TCP listener binds to.
    #[arg(short, long, env = "CANGATE_LISTEN")]
    listen: Option<String>,

    /// Listen on a Unix socket instead of TCP.  A leading '/' selects a
    /// filesystem socket; any other name lands in the abstract namespace.
    /// Supersedes the port/listen settings.
    #[arg(short, long, value_name = "NAME", env = "CANGATE_UNIX_SOCKET")]
    unix_socket: Option<String>,

    /// Enable the TCP_QUICKACK socket option on client connections.
    #[arg(short, long)]
    quick_ack: bool,

    /// Disable the UDP discovery beacon.
    #[arg(short, long)]
    no_beacon: bool,

    /// Hexadecimal CAN error frame mask applied to opened buses
    /// (e.g. 1FFFFFFF).
    #[arg(short, long, value_name = "HEX", value_parser = parse_error_mask)]
    error_mask: Option<u32>,

    /// Open buses in CAN FD mode (payloads up to 64 bytes).
    #[arg(short = 'f', long)]
    can_fd: bool,

    /// Plain log output without ANSI colors, for service managers.
    #[arg(short, long)]
    daemon: bool,

    /// Config file location.
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

/// Parses a `can_err_mask_t` value from hex, with or without a `0x` prefix.
fn parse_error_mask(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex error mask '{s}': {e}"))
}

impl Cli {
    /// Applies the command-line overrides on top of the file-derived
    /// configuration.  Flags that were not given leave the file values
    /// untouched.
    fn apply_to(self, mut cfg: DaemonConfig) -> DaemonConfig {
        if self.verbose {
            cfg.verbose = true;
        }
        if let Some(buses) = self.interfaces {
            cfg.buses = buses;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(listen) = self.listen {
            cfg.listen_interface = listen;
        }
        if let Some(name) = self.unix_socket {
            cfg.unix_socket = Some(name);
        }
        if self.quick_ack {
            cfg.quick_ack = true;
        }
        if self.no_beacon {
            cfg.beacon = false;
        }
        if let Some(mask) = self.error_mask {
            cfg.error_mask = mask;
        }
        if self.can_fd {
            cfg.can_fd = true;
        }
        if self.daemon {
            cfg.plain_log = true;
        }
        cfg
    }
}

// ── Startup plumbing ──────────────────────────────────────────────────────────

/// Initializes the tracing subscriber.  `RUST_LOG` wins when set; otherwise
/// the level comes from the verbose setting.
fn init_logging(cfg: &DaemonConfig) {
    let default = if cfg.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_ansi(!cfg.plain_log)
        .init();
}

/// Clears `running` when an interrupt arrives.  The watcher stays armed, so
/// repeated signals during shutdown are absorbed without side effects.
fn spawn_shutdown_watcher(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = shutdown_signal().await {
                error!("signal listener failed: {e}");
                return;
            }
            info!("shutdown signal received");
            running.store(false, Ordering::Relaxed);
        }
    });
}

/// Completes when SIGINT or SIGTERM is delivered.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file = load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let cfg = cli.apply_to(DaemonConfig::from(file));
    init_logging(&cfg);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        buses = ?cfg.buses,
        "cangate starting"
    );

    let running = Arc::new(AtomicBool::new(true));
    spawn_shutdown_watcher(Arc::clone(&running));

    run_server(cfg, running).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
