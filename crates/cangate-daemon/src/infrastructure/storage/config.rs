//! TOML-based daemon configuration.
//!
//! The daemon reads `/etc/cangate.toml` at startup (the path can be changed
//! with `--config`).  Values resolve in three layers: built-in defaults, then
//! the config file, then command-line flags.  Example file:
//!
//! ```toml
//! [network]
//! port = 29536
//! listen = "eth0"
//! quick_ack = true
//!
//! [can]
//! buses = ["can0", "can1"]
//! error_mask = 0x20000004
//! ```
//!
//! Every field carries a serde default, so a missing section or a missing
//! file behaves like an empty one and old config files keep working when we
//! add fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default path of the daemon config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cangate.toml";

/// Default TCP listening port.
pub const DEFAULT_PORT: u16 = 29536;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but reading it failed.
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub can: CanSection,
    #[serde(default)]
    pub beacon: BeaconSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub stats: StatsSection,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// TCP port the daemon listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Network interface whose address the TCP listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Unix socket to listen on instead of TCP.  A leading `/` selects a
    /// filesystem socket; any other name lands in the abstract namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<String>,
    /// Enable TCP_QUICKACK on client connections for lower latency.
    #[serde(default)]
    pub quick_ack: bool,
}

/// CAN bus settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanSection {
    /// Bus interfaces clients are allowed to open.
    #[serde(default = "default_buses")]
    pub buses: Vec<String>,
    /// CAN error frame mask applied to every opened socket (`can_err_mask_t`
    /// bits).  Zero disables error frame reception.
    #[serde(default)]
    pub error_mask: u32,
    /// Open buses as CAN FD sockets (payloads up to 64 bytes).
    #[serde(default)]
    pub fd: bool,
}

/// Service discovery beacon settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeaconSection {
    /// Broadcast a discovery beacon over UDP.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogSection {
    /// Log at `debug` instead of `info` when no `RUST_LOG` filter is set.
    #[serde(default)]
    pub verbose: bool,
    /// Disable ANSI colors in log output (for journald/syslog capture).
    #[serde(default)]
    pub plain: bool,
}

/// Background interface statistics settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsSection {
    /// Interval in milliseconds between statistics log samples.  Zero
    /// disables the background sampler.
    #[serde(default)]
    pub interval_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_listen() -> String {
    "eth0".to_string()
}
fn default_buses() -> Vec<String> {
    vec!["can0".to_string()]
}
fn default_true() -> bool {
    true
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            listen: default_listen(),
            unix_socket: None,
            quick_ack: false,
        }
    }
}

impl Default for CanSection {
    fn default() -> Self {
        Self {
            buses: default_buses(),
            error_mask: 0,
            fd: false,
        }
    }
}

impl Default for BeaconSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

// ── Runtime configuration ─────────────────────────────────────────────────────

/// Fully resolved configuration threaded through the daemon.
///
/// Built from [`FileConfig`] via `From`, then adjusted by command-line flags
/// in `main.rs`.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub verbose: bool,
    pub plain_log: bool,
    pub buses: Vec<String>,
    pub port: u16,
    pub listen_interface: String,
    pub unix_socket: Option<String>,
    pub quick_ack: bool,
    pub beacon: bool,
    pub error_mask: u32,
    pub can_fd: bool,
    /// Background statistics sampling interval; `None` disables the sampler.
    pub stats_interval: Option<Duration>,
}

impl From<FileConfig> for DaemonConfig {
    fn from(file: FileConfig) -> Self {
        Self {
            verbose: file.log.verbose,
            plain_log: file.log.plain,
            buses: file.can.buses,
            port: file.network.port,
            listen_interface: file.network.listen,
            unix_socket: file.network.unix_socket,
            quick_ack: file.network.quick_ack,
            beacon: file.beacon.enabled,
            error_mask: file.can.error_mask,
            can_fd: file.can.fd,
            stats_interval: (file.stats.interval_ms > 0)
                .then(|| Duration::from_millis(file.stats.interval_ms)),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        FileConfig::default().into()
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Loads [`FileConfig`] from `path`, returning `FileConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// A file that exists but cannot be read yields [`ConfigError::Io`]; content
/// that does not parse yields [`ConfigError::Parse`].
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: FileConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
