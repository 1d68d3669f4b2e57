//! Plain TCP transport over a raw non-blocking descriptor.
//!
//! [`TcpSocket`] adopts an already-open, already-non-blocking fd — socket
//! creation, binding, and listening belong to the caller. The same type
//! serves both roles: a listening capability whose `accept` produces
//! connection capabilities, and a connection capability whose `read`/
//! `write` loop over the descriptor until it would block. A non-blocking
//! descriptor may satisfy several consecutive reads before it truly
//! blocks, so the loops accumulate and report exact totals.

use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::{io, ptr};

use tracing::{debug, trace};

use super::{Accepted, FdIo, IoOutcome, Socket};
use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::{Result, SocketError, SocketErrorKind};

/// The plain transport: one raw non-blocking descriptor, no sub-resources.
pub struct TcpSocket {
    fd: RawFd,
    closed: bool,
    last_err: Option<SocketError>,
}

impl TcpSocket {
    /// Adopt an already-open descriptor. The caller must have put it in
    /// non-blocking mode; the capability takes over closing it.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd,
            closed: false,
            last_err: None,
        }
    }

    /// Record a failure on this instance and hand it back for propagation.
    fn fail(&mut self, err: SocketError) -> SocketError {
        self.last_err = Some(err.clone());
        err
    }

    fn note(&mut self, kind: SocketErrorKind) {
        self.last_err = Some(SocketError::bare(kind, self.fd));
    }

    fn guard_open(&mut self) -> Result<()> {
        if self.closed {
            return Err(self.fail(SocketError::bare(
                SocketErrorKind::NotEstablished,
                self.fd,
            )));
        }
        Ok(())
    }
}

impl Socket for TcpSocket {
    fn accept(&mut self) -> Result<Accepted> {
        self.guard_open()?;
        let fd = self.fd;
        match accept_loop(|| {
            // SOCK_NONBLOCK puts the child in non-blocking mode atomically,
            // no separate fcntl step.
            let child = unsafe {
                libc::accept4(
                    fd,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if child >= 0 {
                Ok(child)
            } else {
                Err(io::Error::last_os_error())
            }
        }) {
            AcceptFlow::Child(child) => {
                trace!(listener = fd, child, "accepted connection");
                Ok(Accepted::Stream(Box::new(TcpSocket::from_raw_fd(child))))
            }
            AcceptFlow::WouldBlock => Ok(Accepted::WouldBlock),
            AcceptFlow::Failed(err) => {
                debug!(listener = fd, %err, "accept failed");
                Err(self.fail(SocketError::io(SocketErrorKind::Accept, fd, &err)))
            }
        }
    }

    fn read(&mut self, buf: &mut InputBuffer) -> Result<IoOutcome> {
        self.guard_open()?;
        match read_loop(&mut FdIo(self.fd), buf) {
            Flow::Transferred(n) => Ok(IoOutcome::Transferred(n)),
            Flow::WouldBlock => Ok(IoOutcome::WouldBlock),
            Flow::PeerClosed => {
                trace!(fd = self.fd, "peer closed while reading");
                self.note(SocketErrorKind::PeerClosedOnRead);
                Ok(IoOutcome::PeerClosed)
            }
            Flow::Failed(err) => {
                debug!(fd = self.fd, %err, "read failed");
                Err(self.fail(SocketError::io(SocketErrorKind::Read, self.fd, &err)))
            }
        }
    }

    fn write(&mut self, buf: &mut OutputBuffer) -> Result<IoOutcome> {
        self.guard_open()?;
        match write_loop(&mut FdIo(self.fd), buf) {
            Flow::Transferred(n) => Ok(IoOutcome::Transferred(n)),
            Flow::WouldBlock => Ok(IoOutcome::WouldBlock),
            Flow::PeerClosed => {
                trace!(fd = self.fd, "peer closed while writing");
                self.note(SocketErrorKind::PeerClosedOnWrite);
                Ok(IoOutcome::PeerClosed)
            }
            Flow::Failed(err) => {
                debug!(fd = self.fd, %err, "write failed");
                Err(self.fail(SocketError::io(SocketErrorKind::Write, self.fd, &err)))
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(self.fail(SocketError::bare(SocketErrorKind::AlreadyClosed, self.fd)));
        }
        self.closed = true;
        trace!(fd = self.fd, "closing socket");
        let rc = unsafe { libc::close(self.fd) };
        if rc < 0 {
            return Err(self.fail(SocketError::os(SocketErrorKind::Close, self.fd)));
        }
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn last_error(&self) -> Option<&SocketError> {
        self.last_err.as_ref()
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

/// Where one accept attempt ended up.
enum AcceptFlow {
    Child(RawFd),
    WouldBlock,
    Failed(io::Error),
}

/// Where one read/write loop ended up.
enum Flow {
    Transferred(usize),
    WouldBlock,
    PeerClosed,
    Failed(io::Error),
}

/// One accept attempt; EINTR retries transparently.
fn accept_loop(mut accept: impl FnMut() -> io::Result<RawFd>) -> AcceptFlow {
    loop {
        return match accept() {
            Ok(child) => AcceptFlow::Child(child),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => AcceptFlow::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => AcceptFlow::Failed(err),
        };
    }
}

/// Append ready bytes to `buf` until the source would block, accumulating
/// the exact total across consecutive ready chunks. EINTR retries
/// transparently.
fn read_loop<R: Read>(src: &mut R, buf: &mut InputBuffer) -> Flow {
    let mut total = 0usize;
    loop {
        match buf.read_with(|tail| src.read(tail)) {
            Ok(0) => return Flow::PeerClosed,
            Ok(n) => total += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return if total > 0 {
                    Flow::Transferred(total)
                } else {
                    Flow::WouldBlock
                };
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Flow::Failed(err),
        }
    }
}

/// Flush the unflushed tail until the payload finishes or the sink would
/// block. EINTR retries transparently.
fn write_loop<W: Write>(dst: &mut W, buf: &mut OutputBuffer) -> Flow {
    let mut total = 0usize;
    loop {
        if buf.finished() {
            return Flow::Transferred(total);
        }
        match buf.write_with(|tail| dst.write(tail)) {
            Ok(0) => return Flow::PeerClosed,
            Ok(n) => total += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return if total > 0 {
                    Flow::Transferred(total)
                } else {
                    Flow::WouldBlock
                };
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Flow::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::{Duration, Instant};

    fn nonblocking_listener() -> (TcpSocket, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        (TcpSocket::from_raw_fd(listener.into_raw_fd()), addr)
    }

    fn nonblocking_pair() -> (TcpSocket, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (TcpSocket::from_raw_fd(ours.into_raw_fd()), theirs)
    }

    /// Retry `f` until it yields `Some` or the deadline passes.
    fn eventually<T>(mut f: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(v) = f() {
                return v;
            }
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn accept_without_pending_connection_would_blocks() {
        let (mut listener, _addr) = nonblocking_listener();
        match listener.accept().unwrap() {
            Accepted::WouldBlock => {}
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }

    #[test]
    fn accept_yields_established_stream() {
        let (mut listener, addr) = nonblocking_listener();
        let _client = TcpStream::connect(addr).unwrap();

        let child = eventually(|| match listener.accept().unwrap() {
            Accepted::Stream(sock) => Some(sock),
            Accepted::WouldBlock => None,
            other => panic!("unexpected outcome {other:?}"),
        });
        assert!(child.fd() >= 0);
        assert_ne!(child.fd(), listener.fd());
    }

    #[test]
    fn accept_all_drains_every_pending_connection() {
        let (mut listener, addr) = nonblocking_listener();
        let _clients: Vec<_> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();

        let mut collected = 0;
        eventually(|| {
            let (accepted, err) = listener.accept_all();
            assert!(err.is_none(), "unexpected accept error: {err:?}");
            collected += accepted.len();
            (collected == 3).then_some(())
        });

        // fully drained: the next attempt blocks again
        match listener.accept().unwrap() {
            Accepted::WouldBlock => {}
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }

    #[test]
    fn read_accumulates_consecutive_ready_chunks() {
        let (mut sock, mut peer) = nonblocking_pair();
        peer.write_all(b"first-").unwrap();
        peer.write_all(b"second-").unwrap();
        peer.write_all(b"third").unwrap();

        let mut buf = InputBuffer::default();
        let total = eventually(|| match sock.read(&mut buf).unwrap() {
            IoOutcome::Transferred(n) => Some(n),
            IoOutcome::WouldBlock => None,
            other => panic!("unexpected outcome {other:?}"),
        });
        assert_eq!(total, b"first-second-third".len());
        assert_eq!(buf.get(), b"first-second-third");
    }

    #[test]
    fn read_on_quiet_socket_would_blocks() {
        let (mut sock, _peer) = nonblocking_pair();
        let mut buf = InputBuffer::default();
        assert_eq!(sock.read(&mut buf).unwrap(), IoOutcome::WouldBlock);
        assert!(buf.is_empty());
    }

    #[test]
    fn read_reports_peer_close_not_would_block() {
        let (mut sock, peer) = nonblocking_pair();
        drop(peer);

        let mut buf = InputBuffer::default();
        let outcome = eventually(|| match sock.read(&mut buf).unwrap() {
            IoOutcome::WouldBlock => None,
            outcome => Some(outcome),
        });
        assert_eq!(outcome, IoOutcome::PeerClosed);
        assert_eq!(
            sock.last_error().unwrap().kind,
            SocketErrorKind::PeerClosedOnRead
        );
        assert!(sock.strerr().contains("closed connection"));
    }

    #[test]
    fn write_flushes_whole_payload_when_transport_keeps_up() {
        let (mut sock, mut peer) = nonblocking_pair();
        let mut out = OutputBuffer::new(b"hello over the pair".to_vec());

        match sock.write(&mut out).unwrap() {
            IoOutcome::Transferred(n) => assert_eq!(n, out.len()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(out.finished());

        let mut echoed = vec![0u8; out.len()];
        peer.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, b"hello over the pair");
    }

    #[test]
    fn partial_write_advances_cursor_and_resumes() {
        let (mut sock, peer) = nonblocking_pair();

        // 4 MiB against an undrained socketpair: guaranteed to block partway.
        let payload = vec![0xA5u8; 4 * 1024 * 1024];
        let mut out = OutputBuffer::new(payload.clone());

        let first = match sock.write(&mut out).unwrap() {
            IoOutcome::Transferred(n) => n,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert!(first > 0 && first < payload.len());
        assert_eq!(out.offset(), first);
        assert!(!out.finished());

        // drain the peer on a thread, then finish the flush
        let reader = thread::spawn(move || {
            let mut peer = peer;
            let mut sink = Vec::new();
            peer.read_to_end(&mut sink).unwrap();
            sink
        });

        let mut flushed = first;
        eventually(|| {
            match sock.write(&mut out).unwrap() {
                IoOutcome::Transferred(n) => flushed += n,
                IoOutcome::WouldBlock => {}
                other => panic!("unexpected outcome {other:?}"),
            }
            out.finished().then_some(())
        });
        assert_eq!(flushed, payload.len());

        sock.close().unwrap();
        let drained = reader.join().unwrap();
        assert_eq!(drained.len(), payload.len());
        assert!(drained.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn close_is_guarded_against_double_release() {
        let (mut sock, _peer) = nonblocking_pair();
        sock.close().unwrap();

        let err = sock.close().unwrap_err();
        assert_eq!(err.kind, SocketErrorKind::AlreadyClosed);
        assert!(sock.strerr().contains("already closed"));

        // I/O on a closed capability is refused, not attempted
        let mut buf = InputBuffer::default();
        let err = sock.read(&mut buf).unwrap_err();
        assert_eq!(err.kind, SocketErrorKind::NotEstablished);
    }

    #[test]
    fn strerr_reports_no_error_initially() {
        let (sock, _peer) = nonblocking_pair();
        assert_eq!(sock.strerr(), "no error");
    }

    /// Scripted source: each call pops the next step; exhausted means
    /// would-block, like a drained non-blocking descriptor.
    struct Scripted(std::vec::IntoIter<io::Result<Vec<u8>>>);

    impl Scripted {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Self(steps.into_iter())
        }
    }

    impl Read for Scripted {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            match self.0.next() {
                Some(Ok(bytes)) => {
                    out[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(err)) => Err(err),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Scripted sink: each call pops how many bytes to take (capped to
    /// what was offered); exhausted means would-block.
    struct ScriptedSink {
        steps: std::vec::IntoIter<io::Result<usize>>,
        taken: Vec<u8>,
    }

    impl ScriptedSink {
        fn new(steps: Vec<io::Result<usize>>) -> Self {
            Self {
                steps: steps.into_iter(),
                taken: Vec::new(),
            }
        }
    }

    impl Write for ScriptedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.steps.next() {
                Some(Ok(n)) => {
                    let n = n.min(buf.len());
                    self.taken.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(Err(err)) => Err(err),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn interrupted_read_retries_and_accumulates() {
        let mut src = Scripted::new(vec![
            Err(io::ErrorKind::Interrupted.into()),
            Ok(b"before-".to_vec()),
            Err(io::ErrorKind::Interrupted.into()),
            Ok(b"after".to_vec()),
        ]);
        let mut buf = InputBuffer::default();

        match read_loop(&mut src, &mut buf) {
            Flow::Transferred(n) => assert_eq!(n, b"before-after".len()),
            _ => panic!("signal interruption must not surface"),
        }
        assert_eq!(buf.get(), b"before-after");
    }

    #[test]
    fn interrupted_write_retries_until_flushed() {
        let payload = b"interrupted midway";
        let mut sink = ScriptedSink::new(vec![
            Ok(6),
            Err(io::ErrorKind::Interrupted.into()),
            Ok(payload.len()),
        ]);
        let mut out = OutputBuffer::new(payload.to_vec());

        match write_loop(&mut sink, &mut out) {
            Flow::Transferred(n) => assert_eq!(n, payload.len()),
            _ => panic!("signal interruption must not surface"),
        }
        assert!(out.finished());
        assert_eq!(sink.taken, payload);
    }

    #[test]
    fn interrupted_accept_retries_until_a_child_arrives() {
        let mut attempts = 0;
        let flow = accept_loop(|| {
            attempts += 1;
            if attempts < 3 {
                Err(io::ErrorKind::Interrupted.into())
            } else {
                Ok(42)
            }
        });
        match flow {
            AcceptFlow::Child(fd) => assert_eq!(fd, 42),
            _ => panic!("signal interruption must not surface"),
        }
        assert_eq!(attempts, 3);
    }
}
