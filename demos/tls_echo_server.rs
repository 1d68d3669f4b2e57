//! TLS echo server over the same reactor shape as `echo_server`, with the
//! extra wrinkle the handshake brings: an accepted capability may come back
//! still handshaking, so the reactor parks it and calls `accept` again on
//! its own readiness until the handshake completes.
//!
//! Run with `cargo run --example tls_echo_server [cert.pem key.pem]`
//! (defaults to the checked-in fixtures), then:
//! `openssl s_client -connect 127.0.0.1:8443 -CAfile fixtures/ca.pem`

use anyhow::{Context, Result};
use kiln_net::prelude::*;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::IntoRawFd;
use std::path::PathBuf;

const LISTENER: Token = Token(0);

struct Connection {
    sock: Box<dyn Socket>,
    /// Still mid-handshake; drive `accept` instead of `read`/`write`.
    pending: bool,
    input: InputBuffer,
    reply: OutputBuffer,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let cert = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fixtures/chain.pem"));
    let key = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fixtures/server.key"));
    let context = TlsContext::from_pem_files(&cert, &key)
        .with_context(|| format!("loading identity from {} / {}", cert.display(), key.display()))?;

    let listener = TcpListener::bind("127.0.0.1:8443")?;
    listener.set_nonblocking(true)?;
    let inner = TcpSocket::from_raw_fd(listener.into_raw_fd());
    let mut listener = TlsSocket::listener(Box::new(inner), context);
    println!("[INFO] TLS echo server listening on 127.0.0.1:8443");

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut SourceFd(&listener.fd()), LISTENER, Interest::READABLE)?;

    let mut events = Events::with_capacity(1024);
    let mut connections: HashMap<Token, Connection> = HashMap::new();

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                LISTENER => {
                    let (accepted, err) = listener.accept_all();
                    if let Some(err) = err {
                        eprintln!("[ERROR] accept: {err}");
                    }
                    for outcome in accepted {
                        let (sock, pending) = match outcome {
                            Accepted::Stream(sock) => (sock, false),
                            Accepted::Handshake(sock) => (sock, true),
                            _ => continue,
                        };
                        let token = Token(sock.fd() as usize);
                        println!(
                            "[INFO] New connection on fd {} ({})",
                            sock.fd(),
                            if pending { "handshaking" } else { "established" }
                        );
                        poll.registry().register(
                            &mut SourceFd(&sock.fd()),
                            token,
                            Interest::READABLE | Interest::WRITABLE,
                        )?;
                        connections.insert(
                            token,
                            Connection {
                                sock,
                                pending,
                                input: InputBuffer::default(),
                                reply: OutputBuffer::default(),
                            },
                        );
                    }
                }
                token => {
                    let done = match connections.get_mut(&token) {
                        Some(conn) => drive(conn, event.is_readable(), event.is_writable()),
                        None => false,
                    };
                    if done {
                        if let Some(mut conn) = connections.remove(&token) {
                            let _ = poll.registry().deregister(&mut SourceFd(&conn.sock.fd()));
                            let _ = conn.sock.close();
                            println!("[INFO] Connection closed");
                        }
                    }
                }
            }
        }
    }
}

/// Advance one connection on a readiness event. Returns true when the
/// connection is finished.
fn drive(conn: &mut Connection, readable: bool, writable: bool) -> bool {
    if conn.pending {
        match conn.sock.accept() {
            Ok(Accepted::Complete) => {
                println!("[INFO] Handshake complete on fd {}", conn.sock.fd());
                conn.pending = false;
            }
            Ok(Accepted::WouldBlock) => return false,
            Ok(_) => return false,
            Err(err) => {
                eprintln!("[ERROR] handshake: {err}");
                return true;
            }
        }
    }
    let mut done = false;
    if readable {
        done = echo_read(conn);
    }
    if !done && writable && !conn.reply.finished() {
        done = flush_reply(conn);
    }
    done
}

fn echo_read(conn: &mut Connection) -> bool {
    match conn.sock.read(&mut conn.input) {
        Ok(IoOutcome::Transferred(_)) => {
            if conn.reply.finished() {
                conn.reply.reset(conn.input.get().to_vec());
                conn.input.clear();
            }
            flush_reply(conn)
        }
        Ok(IoOutcome::WouldBlock) => false,
        Ok(IoOutcome::PeerClosed) => true,
        Err(_) => {
            eprintln!("[ERROR] read: {}", conn.sock.strerr());
            true
        }
    }
}

fn flush_reply(conn: &mut Connection) -> bool {
    match conn.sock.write(&mut conn.reply) {
        Ok(IoOutcome::Transferred(_)) | Ok(IoOutcome::WouldBlock) => false,
        Ok(IoOutcome::PeerClosed) => true,
        Err(_) => {
            eprintln!("[ERROR] write: {}", conn.sock.strerr());
            true
        }
    }
}
