//! In-memory mock bus transport for tests.
//!
//! [`MockBus`] records every transmitted frame and replays frames pushed
//! through an injection handle, so session tests can script both directions
//! of bus traffic without a real CAN interface:
//!
//! ```
//! # use cangate_core::{BusFrame, CanId};
//! # use cangate_daemon::infrastructure::bus::mock::MockBus;
//! # use cangate_daemon::infrastructure::bus::BusTransport;
//! # async fn demo() {
//! let (bus, inject) = MockBus::new("can0");
//! inject.send(BusFrame::new(CanId::Standard(0x123), vec![1])).unwrap();
//!
//! let (frame, _ts) = bus.recv().await.unwrap();
//! assert_eq!(frame.id, CanId::Standard(0x123));
//!
//! bus.send(&frame).await.unwrap();
//! assert_eq!(bus.sent_frames().len(), 1);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use cangate_core::BusFrame;
use tokio::sync::mpsc;

use super::{BusError, BusProvider, BusTransport};

/// Scripted bus transport.
pub struct MockBus {
    name: String,
    fail_sends: bool,
    sent: Mutex<Vec<BusFrame>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BusFrame>>,
}

impl MockBus {
    /// Creates a mock bus and the handle used to inject received frames.
    pub fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedSender<BusFrame>) {
        Self::with_failures(name, false)
    }

    /// Creates a mock bus whose `send` always fails.
    pub fn failing(name: &str) -> (Arc<Self>, mpsc::UnboundedSender<BusFrame>) {
        Self::with_failures(name, true)
    }

    fn with_failures(name: &str, fail_sends: bool) -> (Arc<Self>, mpsc::UnboundedSender<BusFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            name: name.to_string(),
            fail_sends,
            sent: Mutex::new(Vec::new()),
            rx: tokio::sync::Mutex::new(rx),
        });
        (bus, tx)
    }

    /// All frames transmitted through this bus so far, in order.
    pub fn sent_frames(&self) -> Vec<BusFrame> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl BusTransport for MockBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self) -> Result<(BusFrame, SystemTime), BusError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(frame) => Ok((frame, SystemTime::now())),
            // Injection handle dropped: behave like a vanished interface.
            None => Err(BusError::Closed {
                name: self.name.clone(),
            }),
        }
    }

    async fn send(&self, frame: &BusFrame) -> Result<(), BusError> {
        if self.fail_sends {
            return Err(BusError::Send {
                name: self.name.clone(),
                source: std::io::Error::other("mock send failure"),
            });
        }
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

/// [`BusProvider`] handing out pre-registered [`MockBus`] instances.
#[derive(Default)]
pub struct MockBusProvider {
    buses: Mutex<HashMap<String, Arc<MockBus>>>,
}

impl MockBusProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mock bus under `name`, returning the bus and its
    /// injection handle.
    pub fn add_bus(&self, name: &str) -> (Arc<MockBus>, mpsc::UnboundedSender<BusFrame>) {
        let (bus, inject) = MockBus::new(name);
        self.buses
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&bus));
        (bus, inject)
    }
}

impl BusProvider for MockBusProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn BusTransport>, BusError> {
        match self.buses.lock().unwrap().get(name) {
            Some(bus) => Ok(Arc::clone(bus) as Arc<dyn BusTransport>),
            None => Err(BusError::NotConfigured {
                name: name.to_string(),
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
