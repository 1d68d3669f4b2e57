//! The socket capability contract and its transports.
//!
//! A *capability* is one connection-scoped object implementing [`Socket`]:
//! the polymorphic contract a reactor drives on readiness notifications.
//! Two transports satisfy it — [`tcp::TcpSocket`] directly over a raw
//! non-blocking descriptor, and [`tls::TlsSocket`] layered on top of an
//! accepted TCP connection with a rustls server session.
//!
//! ```text
//!               ┌────────────────────────────┐
//!               │   Reactor (external)       │
//!               │   fd ──> Box<dyn Socket>   │
//!               └────────┬───────────────────┘
//!             readiness  │  accept / read / write
//!                        ▼
//!     ┌────────────────────────────────────────┐
//!     │        Socket capability trait         │
//!     ├────────────────────┬───────────────────┤
//!     │   TcpSocket        │   TlsSocket       │
//!     │   libc read/write  │   rustls session  │
//!     │   on the raw fd    │   over TcpSocket  │
//!     └────────────────────┴───────────────────┘
//! ```
//!
//! Every operation either completes, partially completes, or signals
//! would-block through its outcome type; nothing suspends and nothing
//! retries internally. The reactor re-invokes the operation when the
//! descriptor is next ready.

pub mod tcp;
pub mod tls;

use std::io;
use std::os::fd::RawFd;

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::{Result, SocketError};

/// Outcome of one `accept` call.
pub enum Accepted {
    /// A new, fully established connection from a listening capability.
    Stream(Box<dyn Socket>),
    /// TLS only: the TCP connection is up but the handshake is not done.
    ///
    /// Register the returned capability's fd with the reactor and call
    /// [`Socket::accept`] *on it* when the fd is next ready; the listener
    /// capability's own `accept` keeps taking new TCP connections.
    Handshake(Box<dyn Socket>),
    /// A handshake previously pending on *this* capability just finished;
    /// the instance is now established in place.
    Complete,
    /// No pending connection, or the pending handshake cannot progress
    /// until the next readiness event.
    WouldBlock,
}

impl std::fmt::Debug for Accepted {
    // Box<dyn Socket> has no Debug; render the variant plus the child fd.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Accepted::Stream(sock) => f.debug_tuple("Stream").field(&sock.fd()).finish(),
            Accepted::Handshake(sock) => f.debug_tuple("Handshake").field(&sock.fd()).finish(),
            Accepted::Complete => f.write_str("Complete"),
            Accepted::WouldBlock => f.write_str("WouldBlock"),
        }
    }
}

/// Outcome of one `read` or `write` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes appended to / flushed from the buffer before the transport
    /// would block or the payload finished. Zero only when a write was
    /// invoked on an already-finished payload.
    Transferred(usize),
    /// The peer closed the connection: a normal termination signal, not an
    /// error. Recorded on the instance so `strerr()` can explain it.
    PeerClosed,
    /// Nothing could be transferred right now; retry after readiness.
    WouldBlock,
}

/// The capability contract every transport satisfies.
///
/// One thread owns one instance at a time; methods take `&mut self` and no
/// internal locking exists. Hard errors are terminal for the connection —
/// the caller is expected to `close()` the instance. The descriptor from
/// [`fd`](Socket::fd) is the identity key for reactor collections.
pub trait Socket {
    /// Transport-specific setup hook. A no-op for both built-in transports.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// One accept attempt (listening capability) or one handshake
    /// resumption step (TLS capability with a pending handshake).
    fn accept(&mut self) -> Result<Accepted>;

    /// Drain `accept` until it would block, collecting every accepted
    /// capability. A terminating hard error is reported alongside whatever
    /// was accepted before it; would-block terminates cleanly.
    fn accept_all(&mut self) -> (Vec<Accepted>, Option<SocketError>) {
        let mut accepted = Vec::new();
        loop {
            match self.accept() {
                Ok(Accepted::WouldBlock) => return (accepted, None),
                Ok(other) => accepted.push(other),
                Err(err) => return (accepted, Some(err)),
            }
        }
    }

    /// Append ready bytes to `buf`, looping until the descriptor would
    /// block. Returns the exact total appended across the loop.
    fn read(&mut self, buf: &mut InputBuffer) -> Result<IoOutcome>;

    /// Flush the buffer's unflushed tail, looping until the payload is
    /// finished or the descriptor would block. Returns the total flushed.
    fn write(&mut self, buf: &mut OutputBuffer) -> Result<IoOutcome>;

    /// Release the transport's resources exactly once. A second call
    /// returns the defined `AlreadyClosed` status and touches nothing.
    fn close(&mut self) -> Result<()>;

    /// The underlying descriptor (TLS delegates to its inner transport).
    fn fd(&self) -> RawFd;

    /// The most recent failure recorded on this instance, if any.
    fn last_error(&self) -> Option<&SocketError>;

    /// Human rendering of the most recent failure.
    fn strerr(&self) -> String {
        match self.last_error() {
            Some(err) => err.to_string(),
            None => "no error".to_string(),
        }
    }
}

/// `Read`/`Write` over a borrowed raw descriptor.
///
/// Does not own the fd; used to hand the descriptor to rustls'
/// `read_tls`/`write_tls` and shared by the plain transport's loops.
pub(crate) struct FdIo(pub(crate) RawFd);

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
