//! Raw TCP sockets with address and port reuse enabled.
//!
//! Every socket in this module sets both `SO_REUSEADDR` and
//! `SO_REUSEPORT` before binding, which is what allows the connecting
//! and the listening half of a punching run to share one local
//! endpoint. Connected streams are registered with tokio and exposed
//! through the `futures::io` traits, so they can be handed to the TLS
//! layer directly.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::io::{AsyncRead, AsyncWrite};
use socket2::{Domain, Protocol, SockRef, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::error::*;

/// A connected TCP stream bound with address and port reuse.
pub struct Socket {
    inner: Compat<TcpStream>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish()
    }
}

/// A passive socket accepting connections from one expected peer.
pub struct Listener {
    inner: TcpListener,
}

// A stream socket of the right family with both reuse options applied.
// Binding two of these to the same local endpoint is the whole trick;
// either setsockopt failing is fatal for the attempt.
fn reusable(addr: SocketAddr) -> io::Result<socket2::Socket> {
    let sock = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.set_reuse_port(true)?;
    Ok(sock)
}

/// Connects to `remote` from the given local endpoint.
///
/// A fresh socket is used per call, since a failed TCP connect leaves
/// its file descriptor unusable for further attempts. The connect is
/// issued in nonblocking mode and awaited under `deadline`, so a
/// single stuck attempt cannot starve the caller's retry loop.
pub async fn connect(local: SocketAddr, remote: SocketAddr, deadline: Duration) -> Result<Socket> {
    let sock = reusable(local).wrapped(ErrorKind::SocketSetup)?;
    sock.bind(&local.into()).wrapped(ErrorKind::SocketSetup)?;
    sock.set_nonblocking(true).wrapped(ErrorKind::SocketSetup)?;

    match sock.connect(&remote.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(Error::wrapped(ErrorKind::ConnectAttempt, e)),
    }

    let stream = TcpStream::from_std(sock.into()).wrapped(ErrorKind::SocketSetup)?;

    // the socket turns writable once the handshake completes, either
    // way; SO_ERROR distinguishes the outcomes
    match time::timeout(deadline, stream.writable()).await {
        Ok(Ok(())) => match stream.take_error().wrapped(ErrorKind::ConnectAttempt)? {
            None => Ok(Socket {
                inner: stream.compat(),
            }),
            Some(e) => Err(Error::wrapped(ErrorKind::ConnectAttempt, e)),
        },
        Ok(Err(e)) => Err(Error::wrapped(ErrorKind::ConnectAttempt, e)),
        Err(_) => Err(Error::wrapped(ErrorKind::ConnectAttempt, "timed out")),
    }
}

/// Binds a reusable listening socket to `local`.
pub fn listen(local: SocketAddr) -> Result<Listener> {
    let sock = reusable(local).wrapped(ErrorKind::SocketSetup)?;
    sock.bind(&local.into()).wrapped(ErrorKind::SocketSetup)?;
    sock.listen(libc::SOMAXCONN).wrapped(ErrorKind::SocketSetup)?;
    sock.set_nonblocking(true).wrapped(ErrorKind::SocketSetup)?;

    let inner = TcpListener::from_std(sock.into()).wrapped(ErrorKind::SocketSetup)?;
    Ok(Listener { inner })
}

impl Listener {
    /// Accepts one pending connection, promoting it only if its remote
    /// endpoint equals `expected` in both IP and port.
    ///
    /// While a port is being punched, unrelated hosts scanning the
    /// internet occasionally land on it; those are dropped here with a
    /// [`ErrorKind::PeerMismatch`] so the caller can keep looping.
    pub async fn accept_from(&self, expected: SocketAddr) -> Result<Socket> {
        let (stream, remote) = self
            .inner
            .accept()
            .await
            .wrapped(ErrorKind::AcceptAttempt)?;

        if remote.ip() != expected.ip() || remote.port() != expected.port() {
            // the accepted fd drops right here instead of leaking
            return Err(Error::wrapped(
                ErrorKind::PeerMismatch,
                format!("expected {}, got {}", expected, remote),
            ));
        }

        Ok(Socket {
            inner: stream.compat(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Socket {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get_ref().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get_ref().peer_addr()
    }

    /// Enables TCP keepalive probes with the given period.
    pub fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        let keepalive = TcpKeepalive::new()
            .with_time(period)
            .with_interval(period);
        SockRef::from(self.inner.get_ref()).set_tcp_keepalive(&keepalive)
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn reuse_allows_binding_the_same_endpoint_twice() {
        let first = reusable(loopback()).unwrap();
        first.bind(&loopback().into()).unwrap();
        let bound = first.local_addr().unwrap().as_socket().unwrap();

        let second = reusable(bound).unwrap();
        second.bind(&bound.into()).unwrap();
        assert_eq!(second.local_addr().unwrap().as_socket().unwrap(), bound);
    }

    #[tokio::test]
    async fn connect_reaches_a_local_listener() {
        let listener = listen(loopback()).unwrap();
        let bound = listener.local_addr().unwrap();

        let sock = connect(loopback(), bound, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(sock.peer_addr().unwrap(), bound);
    }

    #[tokio::test]
    async fn connect_to_nothing_reports_the_attempt() {
        // no listener on this port; refused or timed out, the kind is
        // the same
        let listener = listen(loopback()).unwrap();
        let vacant = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(loopback(), vacant, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectAttempt);
    }

    #[tokio::test]
    async fn accept_discards_an_unexpected_peer() {
        let listener = listen(loopback()).unwrap();
        let bound = listener.local_addr().unwrap();
        let expected: SocketAddr = "127.0.0.9:1".parse().unwrap();

        let (conn, accepted) =
            tokio::join!(TcpStream::connect(bound), listener.accept_from(expected));

        let _conn = conn.unwrap();
        assert_eq!(accepted.unwrap_err().kind(), ErrorKind::PeerMismatch);
    }
}
