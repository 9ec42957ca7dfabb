//! Client connection acceptance.
//!
//! The daemon listens either on TCP (bound to a named interface's address)
//! or on a Unix stream socket.  Unix socket names follow the SocketCAN tool
//! convention: a leading `/` means a filesystem socket, anything else lands
//! in Linux's abstract socket namespace.
//!
//! Accepted TCP connections get `TCP_NODELAY` set immediately; when quick-ack
//! mode is enabled each connection also carries an [`AckHint`] that re-arms
//! `TCP_QUICKACK` before every read (the kernel clears it after each ACK).

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Listen backlog for both TCP and Unix listeners.
pub const LISTEN_BACKLOG: u32 = 3;

/// Where the daemon listens for clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEndpoint {
    Tcp(SocketAddr),
    Unix(String),
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEndpoint::Tcp(addr) => write!(f, "{addr}"),
            ListenEndpoint::Unix(name) => write!(f, "unix:{name}"),
        }
    }
}

/// Error type for listener setup.
#[derive(Debug, Error)]
pub enum AcceptorError {
    /// The TCP listener could not be created.
    #[error("failed to bind TCP listener on {addr}: {source}")]
    TcpBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The Unix socket could not be created.
    #[error("failed to bind Unix socket '{name}': {source}")]
    UnixBind {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The Unix socket name exceeds the `sun_path` capacity.
    #[error("Unix socket name '{name}' is too long")]
    NameTooLong { name: String },

    /// Unix sockets are only available on Linux builds.
    #[error("Unix socket listeners are not supported on this platform")]
    Unsupported,
}

// ── Quick-ack hint ────────────────────────────────────────────────────────────

/// Per-connection handle that re-arms `TCP_QUICKACK` before each read.
///
/// The option is one-shot in the kernel, so the session read loop calls
/// [`AckHint::rearm`] every time it is about to wait for client bytes.
/// Disabled hints (Unix sockets, quick-ack off, non-Linux) do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckHint {
    fd: Option<i32>,
}

impl AckHint {
    /// A hint that never touches the socket.
    pub const fn disabled() -> Self {
        Self { fd: None }
    }

    #[cfg(target_os = "linux")]
    fn for_stream(stream: &TcpStream, enabled: bool) -> Self {
        use std::os::fd::AsRawFd;
        if enabled {
            Self {
                fd: Some(stream.as_raw_fd()),
            }
        } else {
            Self::disabled()
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn for_stream(_stream: &TcpStream, _enabled: bool) -> Self {
        Self::disabled()
    }

    /// Re-arms `TCP_QUICKACK` if this connection carries a socket hint.
    pub fn rearm(&self) {
        #[cfg(target_os = "linux")]
        if let Some(fd) = self.fd {
            let one: libc::c_int = 1;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_QUICKACK,
                    &one as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                tracing::trace!(
                    "TCP_QUICKACK re-arm failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = self.fd;
        }
    }
}

// ── Client streams ────────────────────────────────────────────────────────────

/// Object-safe alias for a connected client stream (TCP or Unix).
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

/// One accepted client connection.
pub struct AcceptedClient {
    pub stream: Box<dyn ClientStream>,
    /// Peer description for logs ("192.168.1.5:40212" or "unix").
    pub peer: String,
    pub ack: AckHint,
}

// ── Listener ──────────────────────────────────────────────────────────────────

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(target_os = "linux")]
    Unix(tokio::net::UnixListener),
}

/// Bound listener producing [`AcceptedClient`]s.
pub struct Listener {
    kind: ListenerKind,
    quick_ack: bool,
}

impl Listener {
    /// Binds a listener for `endpoint` with [`LISTEN_BACKLOG`] queued
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] when the socket cannot be created, the name
    /// is too long, or Unix sockets are unsupported on this platform.
    pub fn bind(endpoint: &ListenEndpoint, quick_ack: bool) -> Result<Self, AcceptorError> {
        let kind = match endpoint {
            ListenEndpoint::Tcp(addr) => ListenerKind::Tcp(bind_tcp(*addr)?),
            ListenEndpoint::Unix(name) => bind_unix(name)?,
        };
        Ok(Self { kind, quick_ack })
    }

    /// Waits for the next client connection.
    pub async fn accept(&self) -> std::io::Result<AcceptedClient> {
        match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let ack = AckHint::for_stream(&stream, self.quick_ack);
                Ok(AcceptedClient {
                    stream: Box::new(stream),
                    peer: peer.to_string(),
                    ack,
                })
            }
            #[cfg(target_os = "linux")]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(AcceptedClient {
                    stream: Box::new(stream),
                    peer: "unix".to_string(),
                    ack: AckHint::disabled(),
                })
            }
        }
    }

    /// The local TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(target_os = "linux")]
            ListenerKind::Unix(_) => None,
        }
    }
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, AcceptorError> {
    let bind = || -> std::io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    };
    bind().map_err(|source| AcceptorError::TcpBind { addr, source })
}

#[cfg(target_os = "linux")]
fn bind_unix(name: &str) -> Result<ListenerKind, AcceptorError> {
    use std::os::fd::FromRawFd;

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let path_cap = addr.sun_path.len();
    let bytes = name.as_bytes();

    // Both forms consume one extra byte: the NUL terminator for filesystem
    // paths, the leading NUL marker for abstract names.
    if bytes.len() + 1 > path_cap {
        return Err(AcceptorError::NameTooLong {
            name: name.to_string(),
        });
    }
    let path_len = if name.starts_with('/') {
        for (i, &b) in bytes.iter().enumerate() {
            addr.sun_path[i] = b as libc::c_char;
        }
        // Remove a stale socket left behind by an unclean shutdown.
        let _ = std::fs::remove_file(name);
        bytes.len() + 1
    } else {
        addr.sun_path[0] = 0;
        for (i, &b) in bytes.iter().enumerate() {
            addr.sun_path[i + 1] = b as libc::c_char;
        }
        bytes.len() + 1
    };

    let base = std::mem::size_of::<libc::sockaddr_un>() - path_cap;
    let socklen = (base + path_len) as libc::socklen_t;

    let unix_err = |source: std::io::Error| AcceptorError::UnixBind {
        name: name.to_string(),
        source,
    };

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(unix_err(std::io::Error::last_os_error()));
    }
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            socklen,
        )
    };
    if rc != 0 {
        let source = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(unix_err(source));
    }
    let rc = unsafe { libc::listen(fd, LISTEN_BACKLOG as libc::c_int) };
    if rc != 0 {
        let source = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(unix_err(source));
    }

    // Safety: fd is a freshly created, bound and listening AF_UNIX socket
    // owned by nobody else.
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true).map_err(unix_err)?;
    let listener = tokio::net::UnixListener::from_std(std_listener).map_err(unix_err)?;
    Ok(ListenerKind::Unix(listener))
}

#[cfg(not(target_os = "linux"))]
fn bind_unix(_name: &str) -> Result<ListenerKind, AcceptorError> {
    Err(AcceptorError::Unsupported)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
