//! Error types for the socket capability layer.
//!
//! Every failing operation on a capability produces a [`SocketError`] and
//! leaves a copy on the instance itself; [`crate::net::Socket::strerr`]
//! renders the most recent one. Peer closure and would-block are *not*
//! errors — they are reported through [`crate::net::IoOutcome`] — but the
//! peer-closed kinds are still recorded so `strerr()` can explain why a
//! connection ended.

use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// Classification of the most recent failure on a capability instance.
///
/// The accept-stage kinds mirror the establishment pipeline: accepting the
/// underlying TCP connection, creating the TLS session, and completing the
/// handshake each fail distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrorKind {
    /// `accept` on the descriptor failed with a real error.
    Accept,
    /// TLS: the inner plain capability failed while accepting.
    AcceptInner,
    /// TLS: the server session could not be created for the new connection.
    SessionInit,
    /// TLS: the handshake failed fatally.
    Handshake,
    /// A read attempt failed with a real error.
    Read,
    /// The peer closed the connection while we were reading.
    PeerClosedOnRead,
    /// A write attempt failed with a real error.
    Write,
    /// The peer closed the connection while we were writing.
    PeerClosedOnWrite,
    /// `read`/`write` was called on a TLS capability whose handshake has
    /// not completed, or on a closed capability.
    NotEstablished,
    /// `close` was called on an already-closed capability.
    AlreadyClosed,
    /// Closing the descriptor itself failed.
    Close,
}

/// A failure on one capability instance.
///
/// `code` carries the originating `errno` for plain-socket failures and is
/// zero for TLS-layer failures, whose rendering lives in `detail`.
#[derive(Debug, Clone)]
pub struct SocketError {
    pub kind: SocketErrorKind,
    pub fd: RawFd,
    pub code: i32,
    pub detail: Option<String>,
}

impl SocketError {
    /// Build an error from the calling thread's current `errno`.
    pub(crate) fn os(kind: SocketErrorKind, fd: RawFd) -> Self {
        Self {
            kind,
            fd,
            code: io::Error::last_os_error().raw_os_error().unwrap_or(0),
            detail: None,
        }
    }

    /// Build an error from an `io::Error` returned by a transport closure.
    pub(crate) fn io(kind: SocketErrorKind, fd: RawFd, err: &io::Error) -> Self {
        Self {
            kind,
            fd,
            code: err.raw_os_error().unwrap_or(0),
            detail: err.raw_os_error().is_none().then(|| err.to_string()),
        }
    }

    /// Build a TLS-layer error; the rustls rendering goes into `detail`.
    pub(crate) fn tls(kind: SocketErrorKind, fd: RawFd, err: impl fmt::Display) -> Self {
        Self {
            kind,
            fd,
            code: 0,
            detail: Some(err.to_string()),
        }
    }

    /// Build an error with no platform or session detail.
    pub(crate) fn bare(kind: SocketErrorKind, fd: RawFd) -> Self {
        Self {
            kind,
            fd,
            code: 0,
            detail: None,
        }
    }

    /// The platform/session rendering of the failure cause.
    fn cause(&self) -> String {
        match &self.detail {
            Some(d) => d.clone(),
            None if self.code != 0 => io::Error::from_raw_os_error(self.code).to_string(),
            None => "unknown cause".to_string(),
        }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SocketErrorKind::Accept => {
                write!(f, "failed to accept client connection: {}", self.cause())
            }
            SocketErrorKind::AcceptInner => write!(
                f,
                "underlying socket failed while accepting on fd {}: {}",
                self.fd,
                self.cause()
            ),
            SocketErrorKind::SessionInit => write!(
                f,
                "couldn't create tls session for socket {}: {}",
                self.fd,
                self.cause()
            ),
            SocketErrorKind::Handshake => write!(
                f,
                "tls handshake failed on socket {}: {}",
                self.fd,
                self.cause()
            ),
            SocketErrorKind::Read => {
                write!(f, "error reading from socket {}: {}", self.fd, self.cause())
            }
            SocketErrorKind::PeerClosedOnRead => write!(
                f,
                "error reading from socket {}: client has closed connection",
                self.fd
            ),
            SocketErrorKind::Write => {
                write!(f, "error writing to socket {}: {}", self.fd, self.cause())
            }
            SocketErrorKind::PeerClosedOnWrite => write!(
                f,
                "error writing to socket {}: client has closed connection",
                self.fd
            ),
            SocketErrorKind::NotEstablished => {
                write!(f, "socket {} is not established", self.fd)
            }
            SocketErrorKind::AlreadyClosed => {
                write!(f, "socket {} is already closed", self.fd)
            }
            SocketErrorKind::Close => {
                write!(f, "error closing socket {}: {}", self.fd, self.cause())
            }
        }
    }
}

impl std::error::Error for SocketError {}

pub type Result<T> = std::result::Result<T, SocketError>;
