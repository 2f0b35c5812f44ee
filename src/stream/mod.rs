use mio::net::TcpStream;
use mio::Evented;
use std::io::{Read, Write};

#[cfg(feature = "native-tls")]
use crate::Result;

/// A stream that is still performing its own (non-AMQP) handshake; the I/O
/// loop drives it with readiness events until it yields the real stream.
#[cfg(feature = "native-tls")]
pub(crate) trait HandshakeStream: Evented + Send + 'static {
    type Stream: IoStream;

    fn progress_handshake(&mut self) -> Result<Option<Self::Stream>>;
}

/// A full-duplex byte pipe the I/O loop can own: readable, writable, and
/// pollable. The transport is exclusively owned by the I/O loop; no other
/// component touches the socket.
pub trait IoStream: Read + Write + Evented + Send + 'static {}

impl IoStream for TcpStream {}

#[cfg(feature = "native-tls")]
mod native_tls;

#[cfg(feature = "native-tls")]
pub use self::native_tls::TlsConnector;
