use snafu::Snafu;
use std::fmt;
use std::io;
use std::sync::Arc;
use url::Url;

/// A type alias for handling errors throughout coney.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Cloneable wrapper around `io::Error`.
///
/// Errors fan out to every consumer and handler attached to a dying channel
/// or connection, so all error values must be `Clone`.
#[derive(Debug, Clone)]
pub struct IoSource(Arc<io::Error>);

impl fmt::Display for IoSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for IoSource {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

impl From<io::Error> for IoSource {
    fn from(err: io::Error) -> IoSource {
        IoSource(Arc::new(err))
    }
}

/// Specific error cases returned by coney.
#[derive(Clone, Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// URL parsing failed.
    #[snafu(display("could not parse url: {}", source))]
    UrlParseError { source: url::ParseError },

    /// URL could not be decoded into an AMQP or AMQPS connection string.
    #[snafu(display("invalid url: {}", url))]
    InvalidUrl { url: Url },

    /// An insecure URL was supplied to [`Connection::open`](struct.Connection.html#method.open),
    /// which only allows `amqps://...` URLs.
    #[snafu(display("insecure URL passed to method that only allows secure connections"))]
    InsecureUrl,

    /// A TLS connection was requested (e.g., via URL), but coney was built without TLS support.
    #[snafu(display("coney built without TLS support"))]
    TlsFeatureNotEnabled,

    /// Timeout occurred while performing the initial TCP connection.
    #[snafu(display("timeout occurred while waiting for TCP connection"))]
    ConnectionTimeout,

    /// Could not open a TCP connection to the server.
    #[snafu(display("failed to connect: {}", source))]
    FailedToConnect {
        #[snafu(source(from(io::Error, IoSource::from)))]
        source: IoSource,
    },

    /// The TLS handshake failed.
    #[cfg(feature = "native-tls")]
    #[snafu(display("TLS handshake failed: {}", message))]
    TlsHandshake { message: String },

    /// Failed to create the polling handle backing the I/O loop.
    #[snafu(display("could not create I/O polling handle: {}", source))]
    CreatePollHandle {
        #[snafu(source(from(io::Error, IoSource::from)))]
        source: IoSource,
    },

    /// Failed to register an event source with the I/O polling handle.
    #[snafu(display("could not register with I/O polling handle: {}", source))]
    RegisterWithPollHandle {
        #[snafu(source(from(io::Error, IoSource::from)))]
        source: IoSource,
    },

    /// Failed to deregister an event source from the I/O polling handle.
    #[snafu(display("could not deregister with I/O polling handle: {}", source))]
    DeregisterWithPollHandle {
        #[snafu(source(from(io::Error, IoSource::from)))]
        source: IoSource,
    },

    /// Polling for I/O readiness failed.
    #[snafu(display("failed to poll for I/O readiness: {}", source))]
    FailedToPoll {
        #[snafu(source(from(io::Error, IoSource::from)))]
        source: IoSource,
    },

    /// Spawning the I/O thread failed.
    #[snafu(display("fork failed: {}", source))]
    ForkFailed {
        #[snafu(source(from(io::Error, IoSource::from)))]
        source: IoSource,
    },

    /// The underlying socket was closed.
    #[snafu(display("underlying socket closed unexpectedly"))]
    UnexpectedSocketClose,

    /// We received data that could not be parsed as an AMQP frame.
    #[snafu(display("received malformed data - expected AMQP frame"))]
    ReceivedMalformedData,

    /// An I/O error occurred while reading or writing the socket.
    #[snafu(display("I/O error: {}", source))]
    Io {
        #[snafu(source(from(io::Error, IoSource::from)))]
        source: IoSource,
    },

    /// Serializing an outgoing frame failed; this indicates a bug in the frame codec.
    #[snafu(display("internal serialization error"))]
    InternalSerializationError,

    /// The server speaks a different AMQP protocol version.
    #[snafu(display("server requires AMQP protocol version {}-{}-x", major, minor))]
    ProtocolVersionMismatch { major: u8, minor: u8 },

    /// The server does not support the requested auth mechanism.
    #[snafu(display(
        "requested auth mechanism {} unavailable (available = {})",
        requested,
        available
    ))]
    UnsupportedAuthMechanism { available: String, requested: String },

    /// The server does not support the requested locale.
    #[snafu(display("requested locale {} unavailable (available = {})", requested, available))]
    UnsupportedLocale { available: String, requested: String },

    /// The server requested a Secure/Secure-Ok exchange, which are currently unsupported.
    #[snafu(display("SASL secure/secure-ok exchanges are not supported"))]
    SaslSecureNotSupported,

    /// The supplied authentication credentials were not accepted by the server.
    #[snafu(display("invalid credentials"))]
    InvalidCredentials,

    /// The server refused access to the requested virtual host.
    #[snafu(display("server refused access to virtual host"))]
    AccessRefused,

    /// The requested frame size is smaller than the minimum required by AMQP.
    #[snafu(display("requested frame max {} is too small (min = {})", requested, min))]
    FrameMaxTooSmall { min: u32, requested: u32 },

    /// A handshake step did not receive the server's reply in time.
    #[snafu(display("timed out waiting for server handshake reply"))]
    HandshakeTimedOut,

    /// The server missed too many successive heartbeats.
    #[snafu(display("missed heartbeats from server"))]
    MissedServerHeartbeats,

    /// The server closed the connection with the given reply code and text.
    #[snafu(display("server closed connection (code={} message={})", code, message))]
    ServerClosedConnection { code: u16, message: String },

    /// The client closed the connection.
    #[snafu(display("client closed connection"))]
    ClientClosedConnection,

    /// The server closed the given channel with the given reply code and text.
    #[snafu(display(
        "server closed channel {} (code={}, message={})",
        channel_id,
        code,
        message
    ))]
    ServerClosedChannel {
        channel_id: u16,
        code: u16,
        message: String,
    },

    /// The channel is closing; no new requests are accepted.
    #[snafu(display("channel has been closed"))]
    ClientClosedChannel,

    /// Closing a channel timed out waiting for the server's close-ok.
    #[snafu(display("timed out waiting for close-ok on channel {}", channel_id))]
    TimedOutWaitingCloseOk { channel_id: u16 },

    /// Closing the connection timed out before all channels flushed and the
    /// server acknowledged the close.
    #[snafu(display("timed out waiting for connection close to complete"))]
    TimedOutClosingConnection,

    /// No more channels can be opened because all channel numbers up to the
    /// negotiated channel_max are in use.
    #[snafu(display("no more channel ids are available"))]
    ExhaustedChannelIds,

    /// An explicit channel number was requested, but that channel is unavailable for use (e.g.,
    /// because there is another open channel with the same number).
    #[snafu(display("requested channel id {} is unavailable", channel_id))]
    UnavailableChannelId { channel_id: u16 },

    /// The server sent frames for a channel number we don't know about.
    #[snafu(display("received frame for nonexistent channel {}", channel_id))]
    ReceivedFrameWithBogusChannelId { channel_id: u16 },

    /// The method has a dedicated operation on `Channel` and may not be sent
    /// through the generic `call`/`cast` interface.
    #[snafu(display("{} must be sent via its dedicated channel operation", method))]
    UseDedicatedOperation { method: String },

    /// Connection-class methods may not be sent on a non-zero channel.
    #[snafu(display("connection methods are not allowed on channels"))]
    ConnectionMethodNotAllowed,

    /// The server paused content-bearing traffic on this channel via channel.flow.
    #[snafu(display("channel is blocked by server-requested flow control"))]
    ChannelBlocked,

    /// `wait_for_confirms` was called on a channel that never sent confirm.select.
    #[snafu(display("channel is not in publisher-confirm mode"))]
    NotInConfirmMode,

    /// `wait_for_confirms` gave up waiting for outstanding publisher confirms.
    #[snafu(display("timed out waiting for publisher confirms"))]
    ConfirmsTimedOut,

    /// A consumer with the requested tag already exists on this channel.
    #[snafu(display(
        "consumer tag already in use on channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    ConsumerTagAlreadyInUse {
        channel_id: u16,
        consumer_tag: String,
    },

    /// The server sent us a consumer tag that is equal to another consumer tag we already have on
    /// the same channel.
    #[snafu(display(
        "server sent duplicate consumer tag for channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    DuplicateConsumerTag {
        channel_id: u16,
        consumer_tag: String,
    },

    /// We received a valid AMQP frame but not one we expected; e.g., receiving an incorrect
    /// response to an AMQP method call.
    #[snafu(display("AMQP protocol error - received unexpected frame"))]
    FrameUnexpected,

    /// A destination string could not be parsed.
    #[snafu(display("malformed destination: {}", destination))]
    MalformedDestination { destination: String },

    /// The I/O loop attempted to send a message to a caller that did not exist. This indicates
    /// either a bug in coney or a connection that is in a bad state and in the process of tearing
    /// down.
    #[snafu(display("i/o loop thread tried to communicate with a nonexistent client"))]
    EventLoopClientDropped,

    /// The I/O loop has dropped the sending side of a channel, typically because it has exited due
    /// to another error.
    #[snafu(display("i/o loop dropped sending side of a channel"))]
    EventLoopDropped,

    /// The I/O thread panicked.
    #[snafu(display("I/O thread panicked: {}", message))]
    IoThreadPanic { message: String },

    /// The client sent an AMQP exception to the server and closed the connection.
    #[snafu(display("internal client exception - received unhandled frames from server"))]
    ClientException,
}

impl From<url::ParseError> for Error {
    fn from(source: url::ParseError) -> Error {
        Error::UrlParseError { source }
    }
}

impl Error {
    /// True if the closure this error describes is a clean one: an
    /// application-initiated close, or a server close with reply code 200.
    pub fn is_normal_shutdown(&self) -> bool {
        match self {
            Error::ClientClosedConnection | Error::ClientClosedChannel => true,
            Error::ServerClosedConnection { code, .. }
            | Error::ServerClosedChannel { code, .. } => *code == 200,
            _ => false,
        }
    }
}
