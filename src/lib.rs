//! # Kiln-Net
//! A transport-agnostic, non-blocking socket capability layer for
//! reactor-style servers, without an async runtime.
//! Kiln-Net lets an event loop treat a plain TCP connection and a
//! TLS-wrapped connection identically: both implement one [`net::Socket`]
//! contract that internally manages partial reads/writes, growable receive
//! buffers, and a resumable asynchronous TLS handshake.
//! ## Core Philosophy
//! Kiln-Net was designed for servers that require:
//! - **Readiness-driven control**: the reactor decides *when*, the
//!   capability decides *how far* — every call runs until the descriptor
//!   would block and then returns
//! - **Runtime-agnostic architecture** that doesn't force async/await
//!   patterns; "asynchrony" is expressed entirely through typed outcomes
//! - **Bounded memory** per connection via capped geometric buffer growth
//! - **One contract, many transports**: plain TCP over a raw descriptor
//!   and rustls-backed TLS behind the same trait object
//! ## Architecture Overview
//! ```text
//! ┌──────────────┐   readiness   ┌───────────────────────┐
//! │   Reactor    │──────────────▶│  Box<dyn net::Socket> │
//! │  (external)  │   accept /    ├───────────┬───────────┤
//! └──────────────┘   read/write  │ TcpSocket │ TlsSocket │
//!                                └─────┬─────┴─────┬─────┘
//!                                      ▼           ▼
//!                              ┌─────────────┐ ┌──────────────┐
//!                              │ libc on fd  │ │rustls session│
//!                              └─────────────┘ └──────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use kiln_net::buffer::{InputBuffer, OutputBuffer};
//! use kiln_net::net::{tcp::TcpSocket, Accepted, IoOutcome, Socket};
//! use std::net::TcpListener;
//! use std::os::fd::IntoRawFd;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Socket creation/binding stays with the caller; the capability
//!     // adopts an already-open, already-non-blocking descriptor.
//!     let listener = TcpListener::bind("127.0.0.1:8080")?;
//!     listener.set_nonblocking(true)?;
//!     let mut listener = TcpSocket::from_raw_fd(listener.into_raw_fd());
//!
//!     // In a real server a reactor invokes this on readiness.
//!     loop {
//!         match listener.accept()? {
//!             Accepted::Stream(mut conn) => {
//!                 let mut input = InputBuffer::default();
//!                 if let IoOutcome::Transferred(n) = conn.read(&mut input)? {
//!                     let mut reply = OutputBuffer::new(input.get().to_vec());
//!                     conn.write(&mut reply)?;
//!                     println!("echoed {n} bytes");
//!                 }
//!             }
//!             Accepted::WouldBlock => continue, // wait for the next readiness event
//!             _ => {}
//!         }
//!     }
//! }
//! ```
//!
//! For TLS, wrap the listening capability in a
//! [`net::tls::TlsSocket`] built from a shared [`net::tls::TlsContext`];
//! incomplete handshakes come back as [`net::Accepted::Handshake`] and are
//! resumed by calling `accept()` on the returned capability.
//!
//! - [`net`]: the [`net::Socket`] capability contract and both transports
//! - [`buffer`]: the growable input buffer and cursor output buffer
//! - [`error`]: per-instance error records and the failure taxonomy
//!
//! Runnable servers live under `demos/` (`cargo run --example echo_server`,
//! `cargo run --example tls_echo_server`).

pub mod buffer;
pub mod error;
pub mod net;

pub use buffer::{InputBuffer, OutputBuffer};
pub use error::{Result, SocketError, SocketErrorKind};
pub use net::{Accepted, IoOutcome, Socket};

/// A convenient prelude module that re-exports commonly used types and
/// traits.
///
/// ```rust
/// use kiln_net::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::{InputBuffer, OutputBuffer};
    pub use crate::error::{SocketError, SocketErrorKind};
    pub use crate::net::tcp::TcpSocket;
    pub use crate::net::tls::{TlsContext, TlsSocket};
    pub use crate::net::{Accepted, IoOutcome, Socket};
}
