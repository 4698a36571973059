//! Loopback TCP transport.
//!
//! The supervisor binds `127.0.0.1:<port>`, hands the port to the test host it
//! launches, and accepts exactly one connection. The test host side connects
//! with [`connect`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Pending connections queued by the kernel before `accept`.
pub const LISTEN_BACKLOG: u32 = 10;

/// Bind a listener on the loopback interface only.
///
/// Port 0 asks the OS for an ephemeral port; read it back with
/// `listener.local_addr()`.
pub fn bind_loopback(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    let socket = TcpSocket::new_v4()?;
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    tracing::debug!(addr = %listener.local_addr()?, backlog = LISTEN_BACKLOG, "Bound loopback listener");
    Ok(listener)
}

/// Accept one peer, optionally giving up after `timeout`.
pub async fn accept_one(
    listener: &TcpListener,
    timeout: Option<Duration>,
) -> io::Result<(TcpStream, SocketAddr)> {
    tracing::trace!(?timeout, "Waiting for test host connection");
    let accepted = match timeout {
        Some(limit) => tokio::time::timeout(limit, listener.accept())
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection within {}ms", limit.as_millis()),
                )
            })??,
        None => listener.accept().await?,
    };
    tracing::trace!(peer = %accepted.1, "Test host connected");
    Ok(accepted)
}

/// Connect from the test host side.
pub async fn connect(port: u16) -> io::Result<TcpStream> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    tracing::trace!(%addr, "Connecting to supervisor");
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
