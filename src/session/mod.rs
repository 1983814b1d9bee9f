//! TLS upgrade of the surviving connection, and the duplex session
//! handed to the byte pump.
//!
//! The two peers play fixed TLS roles decided by [`crate::role`]; the
//! server side presents a throwaway identity from [`crate::cert`] and
//! the client side skips chain validation, unless a pinned certificate
//! was shared out of band.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_tls::client::TlsStream as TlsStreamCli;
use async_tls::server::TlsStream as TlsStreamSrv;
use async_tls::{TlsAcceptor, TlsConnector};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use rustls::{ClientConfig, NoClientAuth, ServerConfig};
use tokio::time;

use crate::cert;
use crate::error::*;
use crate::socket::Socket;

// name sent in the SNI extension; peers own no real domain, this only
// satisfies the TLS machinery
const TLS_DOMAIN: &str = "tete";

/// How the client side treats the certificate presented by the peer.
pub enum Verify {
    /// Accept whatever leaf the peer presents.
    ///
    /// Confidential against a passive observer only; an active
    /// attacker who wins the punching race can man-in-the-middle the
    /// handshake.
    AnyPeer,
    /// Accept only a leaf byte-identical to this DER certificate,
    /// shared out of band.
    PinnedCert(Vec<u8>),
}

struct AcceptAnyCert;

impl rustls::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> std::result::Result<rustls::ServerCertVerified, rustls::TLSError> {
        Ok(rustls::ServerCertVerified::assertion())
    }
}

struct AcceptPinnedCert(Vec<u8>);

impl rustls::ServerCertVerifier for AcceptPinnedCert {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        presented_certs: &[rustls::Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> std::result::Result<rustls::ServerCertVerified, rustls::TLSError> {
        match presented_certs.first() {
            Some(cert) if cert.0 == self.0 => Ok(rustls::ServerCertVerified::assertion()),
            _ => Err(rustls::TLSError::General(
                "presented certificate does not match the pinned one".into(),
            )),
        }
    }
}

/// The encrypted stream over the surviving raw connection.
pub enum TlsStream {
    Client(TlsStreamCli<Socket>),
    Server(TlsStreamSrv<Socket>),
}

impl AsyncRead for TlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TlsStream::Client(s) => Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TlsStream::Client(s) => Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TlsStream::Client(s) => Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TlsStream::Client(s) => Pin::new(s).poll_close(cx),
            TlsStream::Server(s) => Pin::new(s).poll_close(cx),
        }
    }
}

/// Drives the TLS handshake over the surviving connection.
///
/// Exactly one peer calls this with `is_client` set; the server role
/// mints a fresh identity for the handshake. Failures here are fatal,
/// the raw connection is not reusable afterwards.
pub async fn secure(sock: Socket, is_client: bool, verify: Verify) -> Result<Session> {
    let laddr = sock.local_addr().wrapped(ErrorKind::SocketSetup)?;
    let raddr = sock.peer_addr().wrapped(ErrorKind::SocketSetup)?;

    let stream = if is_client {
        let mut config = ClientConfig::new();
        let verifier: Arc<dyn rustls::ServerCertVerifier> = match verify {
            Verify::AnyPeer => Arc::new(AcceptAnyCert),
            Verify::PinnedCert(der) => Arc::new(AcceptPinnedCert(der)),
        };
        config.dangerous().set_certificate_verifier(verifier);

        let connector: TlsConnector = config.into();
        let s = connector
            .connect(TLS_DOMAIN, sock)
            .await
            .wrapped(ErrorKind::Handshake)?;
        TlsStream::Client(s)
    } else {
        let identity = cert::generate()?;

        let mut config = ServerConfig::new(NoClientAuth::new());
        config
            .set_single_cert(
                vec![rustls::Certificate(identity.der)],
                rustls::PrivateKey(identity.key_der),
            )
            .wrapped(ErrorKind::Certificate)?;

        let acceptor: TlsAcceptor = config.into();
        let s = acceptor.accept(sock).await.wrapped(ErrorKind::Handshake)?;
        TlsStream::Server(s)
    };

    Ok(Session {
        stream,
        laddr,
        raddr,
        read_timeout: None,
        write_timeout: None,
    })
}

/// A full-duplex byte channel over the established TLS stream.
///
/// Reads and writes are optionally bounded by per-direction timeouts,
/// the async rendition of socket deadlines. `Ok(0)` from [`read`]
/// means the peer closed its side cleanly.
///
/// [`read`]: Session::read
pub struct Session {
    stream: TlsStream,
    laddr: SocketAddr,
    raddr: SocketAddr,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Session {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.read_timeout {
            Some(dur) => match time::timeout(dur, self.stream.read(buf)).await {
                Ok(res) => res.wrapped(ErrorKind::Session),
                Err(e) => Err(Error::wrapped(ErrorKind::Session, e)),
            },
            None => self.stream.read(buf).await.wrapped(ErrorKind::Session),
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.write_timeout {
            Some(dur) => match time::timeout(dur, self.stream.write(buf)).await {
                Ok(res) => res.wrapped(ErrorKind::Session),
                Err(e) => Err(Error::wrapped(ErrorKind::Session, e)),
            },
            None => self.stream.write(buf).await.wrapped(ErrorKind::Session),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.laddr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.raddr
    }

    /// Bounds both directions at once.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
        self.write_timeout = timeout;
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Sends the TLS close_notify and shuts the transport down.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.close().await.wrapped(ErrorKind::Session)
    }

    /// Splits the session into its two pump directions. Timeouts do
    /// not survive the split.
    pub fn split(self) -> (ReadHalf<TlsStream>, WriteHalf<TlsStream>) {
        self.stream.split()
    }
}
