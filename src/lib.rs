#![warn(
    missing_docs,
    missing_debug_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for security testing of automotive ECUs over the UDS
//! (ISO 14229) diagnostic protocol.
//!
//! The crate is built out of five layers:
//!
//! * [pdu] - encoding and decoding of UDS request/response frames
//! * [channel]/[transport] - byte channels over ISO-TP, DoIP, a newline
//!   delimited TCP framing ("tcp-lines") and raw CAN
//! * [client] - the client side session/security state machine with
//!   NRC driven retry and a TesterPresent keepalive
//! * [scan] - parameter space scanners (sessions, services, identifiers,
//!   memory, reset timing, security seeds) with checkpoint/resume
//! * [vecu] - a deterministic virtual ECU used as a test peer
//!
//! A typical probing session looks like this:
//!
//! ```no_run
//! use udscan::client::{UdsClient, UdsClientConfig};
//! use udscan::target::EcuTarget;
//!
//! let target: EcuTarget = "tcp-lines://127.0.0.1:20162".parse().unwrap();
//! let client = UdsClient::connect(&target, UdsClientConfig::default()).unwrap();
//! let resp = client.request(0x10u8, Some(0x03), &[]).unwrap();
//! println!("ECU answered: {resp:?}");
//! ```

use channel::ChannelError;

pub mod channel;
pub mod client;
pub mod pdu;
pub mod scan;
pub mod target;
pub mod transport;
pub mod vecu;

pub use automotive_diag::ByteWrapper::*;

/// Diagnostic operation result
pub type DiagServerResult<T> = Result<T, DiagError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Diagnostic operation error
pub enum DiagError {
    /// Error with the underlying communication channel. Covers refused
    /// connections, link-down conditions and mid-transfer disconnects.
    #[error("communication channel error")]
    Channel(
        #[from]
        #[source]
        ChannelError,
    ),
    /// The ECU did not answer within the per-request deadline
    #[error("ECU did not respond within the deadline")]
    Timeout,
    /// The retry budget for a retryable negative response was exhausted
    #[error("retry budget exhausted after {attempts} attempts")]
    TimeoutExceeded {
        /// Number of attempts that were made before giving up
        attempts: u32,
    },
    /// The ECU refused a request where a positive response was required.
    /// Protocol-level refusals during scanning are recorded as findings
    /// instead and never surface as this error.
    #[error("ECU negative response, NRC 0x{nrc:02X} ({desc})")]
    EcuError {
        /// Raw negative response code
        nrc: u8,
        /// NRC definition according to ISO 14229
        desc: String,
    },
    /// The ECU sent bytes that do not decode as a UDS response
    #[error("undecodable ECU response: {0:02X?}")]
    MalformedResponse(Vec<u8>),
    /// The ECU response implies a state transition the state machine
    /// did not expect (e.g. a service echo for a different request)
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Request frame does not fit the transport's negotiated MTU
    #[error("request of {len} bytes exceeds the negotiated MTU of {mtu}")]
    EncodingError {
        /// Encoded frame length
        len: usize,
        /// Negotiated maximum transmission unit
        mtu: usize,
    },
    /// The target URI could not be parsed or validated
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// The configured starting session could not be entered before a scan
    #[error("could not reach starting session 0x{0:02X} before scanning")]
    StartSessionUnreachable(u8),
    /// The scan engine exhausted its reconnect budget
    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of reconnect attempts that were made
        attempts: u32,
    },
    /// The background channel worker terminated before the request
    #[error("channel worker was terminated before the request")]
    ServerNotRunning,
}

impl DiagError {
    /// Returns true if the error indicates the link to the ECU is gone
    /// and a reconnect is worth attempting.
    pub fn is_connection_error(&self) -> bool {
        match self {
            DiagError::Channel(e) => e.is_fatal(),
            DiagError::ServerNotRunning => true,
            _ => false,
        }
    }
}
