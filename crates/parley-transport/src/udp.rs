//! Connected async UDP socket.
//!
//! The protocol talks to exactly one server, so the socket is connected:
//! the kernel filters datagrams from other sources and `send`/`recv` skip
//! the per-call address handling.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::ConnectionError;

/// Socket buffer size; voice bursts are small but frequent
const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// A connected UDP socket with a closed flag.
#[derive(Clone)]
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
}

impl UdpConnection {
    /// Bind an ephemeral local port and connect to `remote`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Io` if socket setup fails.
    pub async fn connect(remote: SocketAddr) -> Result<Self, ConnectionError> {
        let (domain, local) = if remote.is_ipv4() {
            (
                socket2::Domain::IPV4,
                SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0)),
            )
        } else {
            (
                socket2::Domain::IPV6,
                SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
            )
        };

        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(remote).await?;

        Ok(Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Send one datagram to the connected peer.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` after [`close`](Self::close), or
    /// `ConnectionError::Io`.
    pub async fn send(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(self.socket.send(buf).await?)
    }

    /// Receive one datagram from the connected peer.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` after [`close`](Self::close), or
    /// `ConnectionError::Io`.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(self.socket.recv(buf).await?)
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Io`.
    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        Ok(self.socket.local_addr()?)
    }

    /// The connected peer address.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Io`.
    pub fn peer_addr(&self) -> Result<SocketAddr, ConnectionError> {
        Ok(self.socket.peer_addr()?)
    }

    /// Mark the socket closed. Later sends and receives fail fast.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
