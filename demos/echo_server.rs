//! Plain TCP echo server: a minimal single-threaded mio poll loop acting
//! as the external reactor, driving kiln-net capabilities by fd readiness.
//!
//! Run with `cargo run --example echo_server`, then `nc 127.0.0.1 8080`.

use anyhow::Result;
use kiln_net::prelude::*;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::IntoRawFd;

const LISTENER: Token = Token(0);

/// Per-connection state the reactor tracks: the capability plus the two
/// progress-tracking buffers.
struct Connection {
    sock: Box<dyn Socket>,
    input: InputBuffer,
    reply: OutputBuffer,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:8080")?;
    listener.set_nonblocking(true)?;
    let mut listener = TcpSocket::from_raw_fd(listener.into_raw_fd());
    println!("[INFO] Echo server listening on 127.0.0.1:8080");

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
                        if let Accepted::Stream(sock) = outcome {
                            let token = Token(sock.fd() as usize);
                            println!("[INFO] New connection on fd {}", sock.fd());
                            poll.registry().register(
                                &mut SourceFd(&sock.fd()),
                                token,
                                Interest::READABLE | Interest::WRITABLE,
                            )?;
                            connections.insert(
                                token,
                                Connection {
                                    sock,
                                    input: InputBuffer::default(),
                                    reply: OutputBuffer::default(),
                                },
                            );
                        }
                    }
                }
                token => {
                    let done = match connections.get_mut(&token) {
                        Some(conn) => {
                            let mut done = false;
                            if event.is_readable() {
                                done = echo_read(conn);
                            }
                            if !done && event.is_writable() && !conn.reply.finished() {
                                done = flush_reply(conn);
                            }
                            done
                        }
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

/// Read everything ready and queue it back as the reply. Returns true when
/// the connection is finished (peer closed or hard error).
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

/// Push the unflushed reply tail. Returns true on a terminal condition.
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
