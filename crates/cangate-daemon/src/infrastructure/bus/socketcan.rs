//! SocketCAN transport (Linux only).
//!
//! Wraps the async sockets from the `socketcan` crate behind [`BusTransport`].
//! Classic buses use `CAN_RAW` sockets; with `--can-fd` the socket is opened
//! in FD mode and accepts payloads up to 64 bytes.  A non-zero error mask is
//! applied with `CAN_RAW_ERR_FILTER`, after which matching error frames are
//! delivered like data frames (29-bit identifier carrying the error class).

use std::os::fd::{AsRawFd, RawFd};
use std::time::SystemTime;

use async_trait::async_trait;
use cangate_core::can::MAX_EXTENDED_ID;
use cangate_core::{BusFrame, CanId};
use socketcan::tokio::{CanFdSocket, CanSocket};
use socketcan::{
    CanAnyFrame, CanErrorFrame, CanFrame, CanFdFrame, EmbeddedFrame, ExtendedId, Id, StandardId,
};

use super::{BusError, BusOptions, BusTransport};

enum Inner {
    Classic(CanSocket),
    Fd(CanFdSocket),
}

/// One open SocketCAN interface.
pub struct SocketCanBus {
    name: String,
    inner: Inner,
}

impl SocketCanBus {
    /// Opens the named interface with the given options.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Open`] when the socket cannot be created, bound,
    /// or configured.
    pub fn open(name: &str, options: &BusOptions) -> Result<Self, BusError> {
        let open_err = |source: std::io::Error| BusError::Open {
            name: name.to_string(),
            source,
        };

        let inner = if options.fd {
            let socket = CanFdSocket::open(name).map_err(open_err)?;
            if options.error_mask != 0 {
                apply_error_mask(socket.as_raw_fd(), options.error_mask).map_err(open_err)?;
            }
            Inner::Fd(socket)
        } else {
            let socket = CanSocket::open(name).map_err(open_err)?;
            if options.error_mask != 0 {
                apply_error_mask(socket.as_raw_fd(), options.error_mask).map_err(open_err)?;
            }
            Inner::Classic(socket)
        };

        Ok(Self {
            name: name.to_string(),
            inner,
        })
    }
}

#[async_trait]
impl BusTransport for SocketCanBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self) -> Result<(BusFrame, SystemTime), BusError> {
        let frame = match &self.inner {
            Inner::Classic(socket) => {
                let raw = socket.read_frame().await.map_err(|source| BusError::Receive {
                    name: self.name.clone(),
                    source,
                })?;
                from_classic(&raw)
            }
            Inner::Fd(socket) => {
                let raw = socket.read_frame().await.map_err(|source| BusError::Receive {
                    name: self.name.clone(),
                    source,
                })?;
                from_any(&raw)
            }
        };
        Ok((frame, SystemTime::now()))
    }

    async fn send(&self, frame: &BusFrame) -> Result<(), BusError> {
        match &self.inner {
            Inner::Classic(socket) => {
                let raw = to_classic(frame, &self.name)?;
                socket.write_frame(raw).await.map_err(|source| BusError::Send {
                    name: self.name.clone(),
                    source,
                })
            }
            Inner::Fd(socket) => {
                let raw = to_fd(frame, &self.name)?;
                socket
                    .write_frame(&CanAnyFrame::Fd(raw))
                    .await
                    .map_err(|source| BusError::Send {
                        name: self.name.clone(),
                        source,
                    })
            }
        }
    }
}

/// Sets `CAN_RAW_ERR_FILTER` so error frames matching `mask` are delivered.
fn apply_error_mask(fd: RawFd, mask: u32) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_CAN_RAW,
            libc::CAN_RAW_ERR_FILTER,
            &mask as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

// ── Frame conversions ─────────────────────────────────────────────────────────

fn from_embedded<F: EmbeddedFrame>(frame: &F) -> BusFrame {
    let id = match frame.id() {
        Id::Standard(id) => CanId::Standard(id.as_raw()),
        Id::Extended(id) => CanId::Extended(id.as_raw()),
    };
    BusFrame {
        id,
        data: frame.data().to_vec(),
        remote: frame.is_remote_frame(),
    }
}

fn from_error(frame: &CanErrorFrame) -> BusFrame {
    use socketcan::Frame;
    BusFrame {
        id: CanId::Extended(frame.raw_id() & MAX_EXTENDED_ID),
        data: frame.data().to_vec(),
        remote: false,
    }
}

fn from_classic(frame: &CanFrame) -> BusFrame {
    match frame {
        CanFrame::Data(f) => from_embedded(f),
        CanFrame::Remote(f) => from_embedded(f),
        CanFrame::Error(f) => from_error(f),
    }
}

fn from_any(frame: &CanAnyFrame) -> BusFrame {
    match frame {
        CanAnyFrame::Normal(f) => from_embedded(f),
        CanAnyFrame::Remote(f) => from_embedded(f),
        CanAnyFrame::Error(f) => from_error(f),
        CanAnyFrame::Fd(f) => from_embedded(f),
    }
}

fn embedded_id(frame: &BusFrame, name: &str) -> Result<Id, BusError> {
    let id = match frame.id {
        CanId::Standard(raw) => StandardId::new(raw).map(Id::Standard),
        CanId::Extended(raw) => ExtendedId::new(raw).map(Id::Extended),
    };
    id.ok_or_else(|| BusError::InvalidFrame {
        name: name.to_string(),
    })
}

fn to_classic(frame: &BusFrame, name: &str) -> Result<CanFrame, BusError> {
    let id = embedded_id(frame, name)?;
    let raw = if frame.remote {
        CanFrame::new_remote(id, frame.data.len())
    } else {
        CanFrame::new(id, &frame.data)
    };
    raw.ok_or_else(|| BusError::InvalidFrame {
        name: name.to_string(),
    })
}

fn to_fd(frame: &BusFrame, name: &str) -> Result<CanFdFrame, BusError> {
    if frame.remote {
        // CAN FD has no remote frames.
        return Err(BusError::InvalidFrame {
            name: name.to_string(),
        });
    }
    let id = embedded_id(frame, name)?;
    CanFdFrame::new(id, &frame.data).ok_or_else(|| BusError::InvalidFrame {
        name: name.to_string(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
