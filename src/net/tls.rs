//! TLS transport layered over an accepted TCP connection.
//!
//! [`TlsSocket`] drives a sans-IO rustls server session against the inner
//! plain capability's descriptor. The handshake is asynchronous and
//! resumable: when it cannot finish inside one `accept` call, the partially
//! handshaken capability is handed back as [`Accepted::Handshake`] and the
//! reactor re-invokes `accept` *on that capability* at the next readiness
//! event until it reports [`Accepted::Complete`].
//!
//! ```text
//! listener.accept()            pending.accept()       established
//!   TCP accept ──> session ──> complete_io ──> ... ──> read / write
//!        │                          │
//!        WouldBlock                 WouldBlock (handshake stalled)
//! ```
//!
//! The shared [`TlsContext`] holds the certificate/key-derived server
//! configuration; it is built once from PEM files, immutable afterwards,
//! and cheap to share across every session.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};
use tracing::{debug, trace};

use super::{Accepted, FdIo, IoOutcome, Socket};
use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::{Result, SocketError, SocketErrorKind};

/// Cap on plaintext queued inside a session. Keeps the output cursor's
/// progress tied to real transport backpressure instead of unbounded
/// internal buffering.
const SESSION_BUFFER_LIMIT: usize = 64 * 1024;

/// Failure while constructing a [`TlsContext`].
#[derive(Debug)]
pub enum TlsContextError {
    CertificateFile(PathBuf, io::Error),
    KeyFile(PathBuf, io::Error),
    NoCertificates(PathBuf),
    NoPrivateKey(PathBuf),
    Rejected(rustls::Error),
}

impl fmt::Display for TlsContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsContextError::CertificateFile(path, e) => {
                write!(f, "couldn't read certificate file {}: {}", path.display(), e)
            }
            TlsContextError::KeyFile(path, e) => {
                write!(f, "couldn't read private key file {}: {}", path.display(), e)
            }
            TlsContextError::NoCertificates(path) => {
                write!(f, "no certificates found in {}", path.display())
            }
            TlsContextError::NoPrivateKey(path) => {
                write!(f, "no private key found in {}", path.display())
            }
            TlsContextError::Rejected(e) => {
                write!(f, "certificate/key pair rejected: {}", e)
            }
        }
    }
}

impl std::error::Error for TlsContextError {}

/// Process-wide server-side TLS configuration.
///
/// Built once from a PEM certificate chain and private key, then shared
/// read-only by every session; safe for concurrent use.
#[derive(Clone, Debug)]
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Load the certificate chain and private key from PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> std::result::Result<Self, TlsContextError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let mut cert_reader = BufReader::new(
            File::open(cert_path)
                .map_err(|e| TlsContextError::CertificateFile(cert_path.into(), e))?,
        );
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TlsContextError::CertificateFile(cert_path.into(), e))?;
        if certs.is_empty() {
            return Err(TlsContextError::NoCertificates(cert_path.into()));
        }

        let mut key_reader = BufReader::new(
            File::open(key_path).map_err(|e| TlsContextError::KeyFile(key_path.into(), e))?,
        );
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| TlsContextError::KeyFile(key_path.into(), e))?
            .ok_or_else(|| TlsContextError::NoPrivateKey(key_path.into()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsContextError::Rejected)?;

        debug!(cert = %cert_path.display(), key = %key_path.display(), "tls context loaded");
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// The underlying rustls server configuration.
    pub fn server_config(&self) -> &Arc<ServerConfig> {
        &self.config
    }
}

/// Lifecycle of one TLS capability instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsState {
    /// Wraps the listening plain capability; `accept` takes connections.
    Listener,
    /// TCP connection up, handshake incomplete; `accept` resumes it.
    Handshaking,
    /// Handshake done; `read`/`write` are valid.
    Established,
    Closed,
}

/// The TLS transport: an exclusively-owned server session driven over the
/// inner plain capability's descriptor.
pub struct TlsSocket {
    inner: Box<dyn Socket>,
    session: Option<ServerConnection>,
    state: TlsState,
    context: TlsContext,
    last_err: Option<SocketError>,
}

impl TlsSocket {
    /// Wrap a listening plain capability. Every connection accepted through
    /// the returned capability carries its own session built from `context`.
    pub fn listener(inner: Box<dyn Socket>, context: TlsContext) -> Self {
        Self {
            inner,
            session: None,
            state: TlsState::Listener,
            context,
            last_err: None,
        }
    }

    fn connection(inner: Box<dyn Socket>, session: ServerConnection, context: TlsContext, state: TlsState) -> Self {
        Self {
            inner,
            session: Some(session),
            state,
            context,
            last_err: None,
        }
    }

    /// Handshake finished and the capability is ready for `read`/`write`?
    pub fn is_established(&self) -> bool {
        self.state == TlsState::Established
    }

    /// Handshake still pending?
    pub fn is_handshaking(&self) -> bool {
        self.state == TlsState::Handshaking
    }

    fn fail(&mut self, err: SocketError) -> SocketError {
        self.last_err = Some(err.clone());
        err
    }

    fn note(&mut self, kind: SocketErrorKind) {
        self.last_err = Some(SocketError::bare(kind, self.fd()));
    }

    /// Accept one TCP connection off the inner listener and start its
    /// handshake.
    fn accept_new(&mut self) -> Result<Accepted> {
        let child = match self.inner.accept() {
            Ok(Accepted::Stream(child)) => child,
            Ok(Accepted::WouldBlock) => return Ok(Accepted::WouldBlock),
            Ok(_) => {
                let fd = self.fd();
                return Err(self.fail(SocketError::tls(
                    SocketErrorKind::AcceptInner,
                    fd,
                    "inner transport must be a plain listening capability",
                )));
            }
            Err(err) => {
                let fd = self.fd();
                let wrapped = SocketError {
                    kind: SocketErrorKind::AcceptInner,
                    fd,
                    code: err.code,
                    detail: Some(err.to_string()),
                };
                return Err(self.fail(wrapped));
            }
        };

        let mut session = match ServerConnection::new(self.context.config.clone()) {
            Ok(session) => session,
            Err(err) => {
                let child_fd = child.fd();
                return Err(self.fail(SocketError::tls(
                    SocketErrorKind::SessionInit,
                    child_fd,
                    err,
                )));
            }
        };
        session.set_buffer_limit(Some(SESSION_BUFFER_LIMIT));

        match drive_handshake(&mut session, child.fd()) {
            Handshaken::Done => {
                trace!(fd = child.fd(), "tls handshake completed on accept");
                Ok(Accepted::Stream(Box::new(TlsSocket::connection(
                    child,
                    session,
                    self.context.clone(),
                    TlsState::Established,
                ))))
            }
            Handshaken::Pending => {
                trace!(fd = child.fd(), "tls handshake pending");
                Ok(Accepted::Handshake(Box::new(TlsSocket::connection(
                    child,
                    session,
                    self.context.clone(),
                    TlsState::Handshaking,
                ))))
            }
            Handshaken::Fatal(err) => {
                debug!(fd = child.fd(), %err, "tls handshake failed");
                let child_fd = child.fd();
                Err(self.fail(SocketError::tls(SocketErrorKind::Handshake, child_fd, err)))
            }
        }
    }

    /// Resume this capability's own pending handshake.
    fn resume_handshake(&mut self) -> Result<Accepted> {
        let fd = self.inner.fd();
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => {
                return Err(self.fail(SocketError::bare(SocketErrorKind::NotEstablished, fd)))
            }
        };
        match drive_handshake(session, fd) {
            Handshaken::Done => {
                trace!(fd, "tls handshake resumed to completion");
                self.state = TlsState::Established;
                Ok(Accepted::Complete)
            }
            Handshaken::Pending => Ok(Accepted::WouldBlock),
            Handshaken::Fatal(err) => {
                debug!(fd, %err, "tls handshake failed during resume");
                Err(self.fail(SocketError::tls(SocketErrorKind::Handshake, fd, err)))
            }
        }
    }
}

impl Socket for TlsSocket {
    fn accept(&mut self) -> Result<Accepted> {
        match self.state {
            TlsState::Listener => self.accept_new(),
            TlsState::Handshaking => self.resume_handshake(),
            TlsState::Established | TlsState::Closed => {
                let fd = self.fd();
                Err(self.fail(SocketError::tls(
                    SocketErrorKind::Accept,
                    fd,
                    "capability is not a listener",
                )))
            }
        }
    }

    fn read(&mut self, buf: &mut InputBuffer) -> Result<IoOutcome> {
        let fd = self.inner.fd();
        if self.state != TlsState::Established {
            return Err(self.fail(SocketError::bare(SocketErrorKind::NotEstablished, fd)));
        }
        // state invariant: Established implies a session
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Err(self.fail(SocketError::bare(SocketErrorKind::NotEstablished, fd))),
        };
        match tls_read_loop(session, fd, buf) {
            Flow::Transferred(n) => Ok(IoOutcome::Transferred(n)),
            Flow::WouldBlock => Ok(IoOutcome::WouldBlock),
            Flow::PeerClosed => {
                trace!(fd, "peer closed tls connection while reading");
                self.note(SocketErrorKind::PeerClosedOnRead);
                Ok(IoOutcome::PeerClosed)
            }
            Flow::Io(err) => {
                debug!(fd, %err, "tls read failed");
                Err(self.fail(SocketError::io(SocketErrorKind::Read, fd, &err)))
            }
            Flow::Tls(err) => {
                debug!(fd, %err, "tls session rejected inbound records");
                Err(self.fail(SocketError::tls(SocketErrorKind::Read, fd, err)))
            }
        }
    }

    fn write(&mut self, buf: &mut OutputBuffer) -> Result<IoOutcome> {
        let fd = self.inner.fd();
        if self.state != TlsState::Established {
            return Err(self.fail(SocketError::bare(SocketErrorKind::NotEstablished, fd)));
        }
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Err(self.fail(SocketError::bare(SocketErrorKind::NotEstablished, fd))),
        };
        match tls_write_loop(session, fd, buf) {
            Flow::Transferred(n) => Ok(IoOutcome::Transferred(n)),
            Flow::WouldBlock => Ok(IoOutcome::WouldBlock),
            Flow::PeerClosed => {
                trace!(fd, "peer closed tls connection while writing");
                self.note(SocketErrorKind::PeerClosedOnWrite);
                Ok(IoOutcome::PeerClosed)
            }
            Flow::Io(err) => {
                debug!(fd, %err, "tls write failed");
                Err(self.fail(SocketError::io(SocketErrorKind::Write, fd, &err)))
            }
            Flow::Tls(err) => {
                debug!(fd, %err, "tls session failed while writing");
                Err(self.fail(SocketError::tls(SocketErrorKind::Write, fd, err)))
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.state == TlsState::Closed {
            let fd = self.fd();
            return Err(self.fail(SocketError::bare(SocketErrorKind::AlreadyClosed, fd)));
        }
        // session first, descriptor second
        if let Some(mut session) = self.session.take() {
            session.send_close_notify();
            let mut io = FdIo(self.inner.fd());
            while session.wants_write() {
                // best effort: the peer may already be gone
                if session.write_tls(&mut io).is_err() {
                    break;
                }
            }
        }
        self.state = TlsState::Closed;
        self.inner.close().map_err(|err| self.fail(err))
    }

    fn fd(&self) -> RawFd {
        self.inner.fd()
    }

    fn last_error(&self) -> Option<&SocketError> {
        self.last_err.as_ref()
    }
}

impl Drop for TlsSocket {
    fn drop(&mut self) {
        if self.state != TlsState::Closed {
            let _ = self.close();
        }
    }
}

/// Where one read/write loop ended up.
enum Flow {
    Transferred(usize),
    WouldBlock,
    PeerClosed,
    Io(io::Error),
    Tls(rustls::Error),
}

enum Handshaken {
    Done,
    Pending,
    Fatal(io::Error),
}

/// Step the handshake until it finishes or the descriptor would block.
fn drive_handshake(session: &mut ServerConnection, fd: RawFd) -> Handshaken {
    let mut io = FdIo(fd);
    while session.is_handshaking() {
        match session.complete_io(&mut io) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Handshaken::Pending,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Handshaken::Fatal(err),
        }
    }
    Handshaken::Done
}

/// Drain buffered plaintext into `buf`, pulling ciphertext off the wire as
/// the session asks for it, until the descriptor would block.
fn tls_read_loop(session: &mut ServerConnection, fd: RawFd, buf: &mut InputBuffer) -> Flow {
    let mut io = FdIo(fd);
    let mut total = 0usize;
    loop {
        match buf.read_with(|tail| session.reader().read(tail)) {
            // clean close_notify from the peer
            Ok(0) => return Flow::PeerClosed,
            Ok(n) => total += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // no buffered plaintext; pull more records
                match session.read_tls(&mut io) {
                    // TCP EOF, with or without close_notify
                    Ok(0) => return Flow::PeerClosed,
                    Ok(_) => {
                        if let Err(tls_err) = session.process_new_packets() {
                            return Flow::Tls(tls_err);
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return if total > 0 {
                            Flow::Transferred(total)
                        } else {
                            Flow::WouldBlock
                        };
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Flow::Io(err),
                }
            }
            Err(err) => return Flow::Io(err),
        }
    }
}

/// Feed the unflushed payload through the session and flush its records,
/// until the payload finishes or the descriptor would block.
fn tls_write_loop(session: &mut ServerConnection, fd: RawFd, buf: &mut OutputBuffer) -> Flow {
    let mut io = FdIo(fd);
    let mut total = 0usize;
    loop {
        if !buf.finished() {
            // the session buffer limit makes partial progress real: the
            // writer takes only what fits until records are flushed
            match buf.write_with(|tail| session.writer().write(tail)) {
                Ok(n) => total += n,
                Err(err) => return Flow::Io(err),
            }
        }
        while session.wants_write() {
            match session.write_tls(&mut io) {
                Ok(0) => return Flow::PeerClosed,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return if total > 0 {
                        Flow::Transferred(total)
                    } else {
                        Flow::WouldBlock
                    };
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Flow::Io(err),
            }
        }
        if buf.finished() {
            return Flow::Transferred(total);
        }
    }
}
