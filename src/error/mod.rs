//! Error related business logic of `tete`.
//!
//! Every fallible operation in this crate reports an [`Error`] tagged
//! with the [`ErrorKind`] of the stage that produced it, so callers can
//! branch on the failure class without inspecting the underlying error.

use std::error;
use std::fmt;
use std::result;

/// The failure classes of a punching session, roughly one per stage.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Addresses or ports rejected before any socket was opened.
    InvalidInput,
    /// The async runtime could not be brought up.
    Runtime,
    /// Socket creation, socket options, bind or listen failed.
    SocketSetup,
    /// A single outbound connect attempt failed or timed out.
    ConnectAttempt,
    /// An accept syscall failed.
    AcceptAttempt,
    /// An accepted connection's remote endpoint is not the configured peer.
    PeerMismatch,
    /// The outbound connect loop consumed its whole attempt budget.
    ConnectExhausted,
    /// The inbound accept loop consumed its whole attempt budget.
    AcceptExhausted,
    /// Generating the ephemeral certificate failed.
    Certificate,
    /// The TLS handshake on the surviving connection failed.
    Handshake,
    /// Read or write on the established session failed.
    Session,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Runtime => "async runtime setup failed",
            ErrorKind::SocketSetup => "socket setup failed",
            ErrorKind::ConnectAttempt => "connect attempt failed",
            ErrorKind::AcceptAttempt => "accept attempt failed",
            ErrorKind::PeerMismatch => "accepted connection from unexpected peer",
            ErrorKind::ConnectExhausted => "Failed to connect to remote peer",
            ErrorKind::AcceptExhausted => "Failed to accept connection from remote peer",
            ErrorKind::Certificate => "certificate generation failed",
            ErrorKind::Handshake => "TLS handshake failed",
            ErrorKind::Session => "session i/o failed",
        }
    }
}

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `tete::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait is
/// used in cases where we want to drop the underlying
/// error type in the `Result`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns an error not wrapping another
    /// error implementation, with kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        let inner = ErrorInner::Simple(kind);
        Error { inner }
    }

    /// Wraps an arbitrary error in an `Error`,
    /// with kind of type `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let inner = ErrorInner::Wrapped(kind, e.into());
        Error { inner }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(fmt, "{}", k.as_str()),
            ErrorInner::Wrapped(k, e) => write!(fmt, "{}: {}", k.as_str(), e),
        }
    }
}

impl error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_wrapping() {
        let e: Result<()> = Err("refused").wrapped(ErrorKind::SocketSetup);
        assert_eq!(e.unwrap_err().kind(), ErrorKind::SocketSetup);

        let e: Result<()> = Err::<(), &str>("refused").simple(ErrorKind::PeerMismatch);
        assert_eq!(e.unwrap_err().kind(), ErrorKind::PeerMismatch);
    }

    #[test]
    fn display_includes_source() {
        let e = Error::wrapped(ErrorKind::Handshake, "bad record mac");
        let s = format!("{}", e);
        assert!(s.contains("TLS handshake failed"));
        assert!(s.contains("bad record mac"));
    }
}
