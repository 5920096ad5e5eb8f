//! Logical byte channels between the tester and an ECU
//!
//! A [DiagChannel] carries one complete UDS PDU per send/receive, no
//! matter how the underlying link segments it. Concrete implementations
//! live in [crate::transport].

use std::sync::Arc;
use std::time::Duration;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO error with the channel
    #[error("IO error: {0}")]
    IOError(#[source] Arc<std::io::Error>),
    /// Timeout when reading from the channel
    #[error("timeout reading from channel")]
    ReadTimeout,
    /// Timeout when writing to the channel
    #[error("timeout writing to channel")]
    WriteTimeout,
    /// The peer closed the connection, possibly mid-transfer
    #[error("connection closed by peer")]
    Disconnected,
    /// The interface is not open
    #[error("channel interface is not open")]
    InterfaceNotOpen,
    /// A protocol-level handshake (e.g. DoIP routing activation) failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// Bytes on the wire did not form a valid frame for this transport
    #[error("invalid frame on the wire: {0}")]
    InvalidFrame(String),
    /// The channel does not support the request
    #[error("unsupported channel request")]
    UnsupportedRequest,
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ChannelError::ReadTimeout
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ChannelError::Disconnected,
            _ => ChannelError::IOError(Arc::new(e)),
        }
    }
}

impl ChannelError {
    /// Returns true if the channel is unusable and must be reconnected
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::ReadTimeout | ChannelError::WriteTimeout)
    }
}

/// A PDU-oriented channel to an ECU.
///
/// One `send` call transmits exactly one UDS request, one `recv` call
/// returns exactly one complete response. Implementations must report a
/// mid-transfer disconnect as [ChannelError::Disconnected], never return
/// partial data. Dropping a channel closes it.
pub trait DiagChannel: Send {
    /// Opens the interface. Must be called before any IO
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes and destroys the channel
    fn close(&mut self) -> ChannelResult<()>;

    /// Writes one complete PDU to the channel
    fn send(&mut self, payload: &[u8]) -> ChannelResult<()>;

    /// Reads one complete PDU from the channel, waiting at most `timeout`.
    /// Fails with [ChannelError::ReadTimeout] if the deadline elapses.
    fn recv(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>>;

    /// Maximum PDU size this channel can carry
    fn mtu(&self) -> usize;
}
