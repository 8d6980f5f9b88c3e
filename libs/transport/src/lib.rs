//! Framed, mutually-authenticated TLS transport.
//!
//! The wire protocol is a stream of frames, each `len: u16 big-endian ||
//! payload[len]`, carried over TLS 1.2+. A zero-length frame is a keepalive
//! and never reaches the consumer; a length field exceeding the negotiated
//! maximum is a protocol break that terminates the session.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod frame;
mod session;
mod tls;

use std::io;
use std::time::Duration;

pub use frame::{FrameCodec, DEFAULT_MAX_FRAME};
pub use session::{
    Listener, PeerIdentity, Session, SessionReader, SessionWriter, Timeouts, connect, listen,
};
pub use tls::{MinTlsVersion, TlsMaterial, TlsSettings};

/// The production stream type: TLS over TCP.
pub type TlsTcpStream = tokio_rustls::TlsStream<tokio::net::TcpStream>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("TLS handshake failed")]
    TlsHandshake(#[source] io::Error),
    #[error("peer failed authentication: {0}")]
    Auth(String),
    #[error("connection refused")]
    ConnectionRefused,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt frame header: length {len} exceeds maximum {max}")]
    Corrupt { len: u16, max: u16 },
    #[error("the session is closed")]
    Closed,
    #[error(transparent)]
    Io(io::Error),
    #[error("invalid TLS configuration")]
    Tls(#[from] rustls::Error),
    #[error("failed to load `{path}`: {reason}")]
    Pem { path: String, reason: String },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err),
        }
    }
}
