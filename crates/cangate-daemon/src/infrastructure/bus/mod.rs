//! CAN bus transports.
//!
//! Sessions talk to buses through the [`BusTransport`] trait so the protocol
//! logic stays independent of the SocketCAN API.  On Linux the real transport
//! lives in [`socketcan`]; [`mock`] provides an in-memory transport for tests
//! and non-Linux builds.

pub mod mock;

#[cfg(target_os = "linux")]
pub mod socketcan;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use cangate_core::BusFrame;
use thiserror::Error;

/// Error type for bus transport operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus interface could not be opened.
    #[error("could not open CAN bus '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The requested bus is not in the daemon's configured bus list.
    #[error("CAN bus '{name}' is not configured")]
    NotConfigured { name: String },

    /// No CAN transport exists on this platform.
    #[error("SocketCAN transport is only available on Linux")]
    Unsupported,

    /// A transmit failed.
    #[error("send on CAN bus '{name}' failed: {source}")]
    Send {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A receive failed.
    #[error("receive on CAN bus '{name}' failed: {source}")]
    Receive {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The transport was closed underneath the session.
    #[error("CAN bus '{name}' closed")]
    Closed { name: String },

    /// The frame cannot be represented on this bus (bad identifier or
    /// payload length).
    #[error("frame does not fit CAN bus '{name}'")]
    InvalidFrame { name: String },
}

/// Socket options applied when opening a bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusOptions {
    /// `can_err_mask_t` bits for error frame reception; zero disables it.
    pub error_mask: u32,
    /// Open CAN FD sockets (payloads up to 64 bytes).
    pub fd: bool,
}

/// Async frame-level access to one CAN bus.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Bus interface name as configured (e.g. `"can0"`).
    fn name(&self) -> &str;

    /// Waits for the next frame from the bus, with its receive timestamp.
    async fn recv(&self) -> Result<(BusFrame, SystemTime), BusError>;

    /// Transmits one frame onto the bus.
    async fn send(&self, frame: &BusFrame) -> Result<(), BusError>;
}

/// Source of bus transports for client sessions.
pub trait BusProvider: Send + Sync {
    /// Opens a configured bus by name.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotConfigured`] for names outside the configured
    /// bus list and [`BusError::Open`] when the socket cannot be created.
    fn open(&self, name: &str) -> Result<Arc<dyn BusTransport>, BusError>;
}

/// [`BusProvider`] backed by real SocketCAN sockets, restricted to the buses
/// named in the daemon configuration.
pub struct ConfiguredBuses {
    buses: Vec<String>,
    options: BusOptions,
}

impl ConfiguredBuses {
    pub fn new(buses: Vec<String>, options: BusOptions) -> Self {
        Self { buses, options }
    }
}

impl BusProvider for ConfiguredBuses {
    fn open(&self, name: &str) -> Result<Arc<dyn BusTransport>, BusError> {
        if !self.buses.iter().any(|b| b == name) {
            return Err(BusError::NotConfigured {
                name: name.to_string(),
            });
        }

        #[cfg(target_os = "linux")]
        {
            let bus = socketcan::SocketCanBus::open(name, &self.options)?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = &self.options;
            Err(BusError::Unsupported)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
