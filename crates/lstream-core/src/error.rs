//! Error types for the LSTREAM core protocol.

use crate::packet::ErrorCode;
use lstream_crypto::CryptoError;
use lstream_transport::{CodecError, TransportError};
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Packet parsing error
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Stream error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Checked arithmetic failures
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticError {
    /// Result exceeds `u64::MAX`
    #[error("arithmetic overflow")]
    Overflow,

    /// Divisor is zero
    #[error("division by zero")]
    DivisionByZero,
}

/// Packet-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Version byte is not supported
    #[error("unsupported packet version: {0}")]
    UnsupportedVersion(u8),

    /// Packet type byte is not Prepare, Fulfill or Reject
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// Fewer frames than the header declared
    #[error("packet declares {declared} frames but only {parsed} are present")]
    InconsistentFrameCount {
        /// Count from the header
        declared: u64,
        /// Frames actually found
        parsed: u64,
    },

    /// A known frame's contents could not be parsed
    #[error("invalid frame 0x{frame_type:02X}: {source}")]
    InvalidFrame {
        /// Frame type tag
        frame_type: u8,
        /// Underlying decode failure
        source: CodecError,
    },

    /// Unknown error code in a close frame
    #[error("unknown error code: {0}")]
    UnknownErrorCode(u8),

    /// Malformed header
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Packet does not fit in the maximum packet size
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Serialized size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Packet could not be decrypted
    #[error("packet not accepted: {0}")]
    Decrypt(#[from] CryptoError),
}

/// Stream-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Stream is closed
    #[error("stream is closed")]
    Closed,

    /// New send limit is below what was already sent or is in flight
    #[error("send max {limit} is below the {committed} already sent or in flight")]
    SendMaxTooLow {
        /// Requested limit
        limit: u64,
        /// Sent plus held
        committed: u64,
    },

    /// New receive limit is below what was already received
    #[error("receive max {limit} is below the {received} already received")]
    ReceiveMaxTooLow {
        /// Requested limit
        limit: u64,
        /// Already received
        received: u64,
    },

    /// Incoming money would exceed the receive limit
    #[error("incoming amount {amount} exceeds the remaining receive headroom {headroom}")]
    ExceedsReceiveMax {
        /// Amount offered
        amount: u64,
        /// Room left under the limit
        headroom: u64,
    },

    /// Incoming data beyond the advertised window
    #[error("data up to offset {end} exceeds the flow control limit {max_offset}")]
    FlowControl {
        /// End offset of the offending data
        end: u64,
        /// Advertised maximum
        max_offset: u64,
    },

    /// `send_total` / `receive_total` did not complete in time
    #[error("timed out waiting for stream progress")]
    Timeout,

    /// Closed locally or by the peer with an error
    #[error("stream closed with {code:?}: {message}")]
    Reset {
        /// Error code
        code: ErrorCode,
        /// Reason
        message: String,
    },

    /// The owning connection closed
    #[error("connection closed")]
    ConnectionClosed,
}

/// Connection-level errors
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    /// Connection is closed
    #[error("connection is closed")]
    Closed,

    /// All stream ids allowed by the peer are in use
    #[error("peer allows stream ids up to {remote_max}")]
    StreamIdsExhausted {
        /// Peer's maximum stream id
        remote_max: u64,
    },

    /// Peer used a stream id with the wrong parity or above our maximum
    #[error("invalid stream id {stream_id} (maximum {max_stream_id})")]
    InvalidStreamId {
        /// Offending id
        stream_id: u64,
        /// Local maximum
        max_stream_id: u64,
    },

    /// The connection sent its last allowed packet
    #[error("sequence numbers exhausted")]
    SequenceExhausted,

    /// Rate probing failed
    #[error("exchange rate unavailable: {0}")]
    ExchangeRateUnavailable(String),

    /// The receiver got less than the minimum acceptable amount
    #[error("exchange rate too low: receiver got {received}, minimum was {minimum}")]
    ExchangeRateTooLow {
        /// Amount the receiver reported
        received: u64,
        /// Minimum destination amount requested
        minimum: u64,
    },

    /// The path cannot carry any value
    #[error("path maximum packet amount is zero")]
    MaxPacketAmountZero,

    /// A final reject the connection cannot recover from
    #[error("unexpected reject {code}: {message}")]
    UnexpectedReject {
        /// Reject code
        code: String,
        /// Reject message
        message: String,
    },

    /// Peer closed the connection with an error
    #[error("peer closed the connection with {code:?}: {message}")]
    RemoteClosed {
        /// Error code
        code: ErrorCode,
        /// Reason
        message: String,
    },

    /// Peer violated flow control
    #[error("flow control violation: {0}")]
    FlowControl(String),

    /// Peer sent something the protocol forbids
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No activity within the idle timeout
    #[error("connection idle timeout")]
    IdleTimeout,

    /// Handshake failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Underlying transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Packet could not be built or read
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Closed by the application with an error
    #[error("destroyed: {0}")]
    Destroyed(String),
}

impl ConnectionError {
    /// Code reported to the peer in a `ConnectionClose` frame.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Closed => ErrorCode::NoError,
            Self::StreamIdsExhausted { .. } | Self::InvalidStreamId { .. } => {
                ErrorCode::StreamIdError
            }
            Self::FlowControl(_) => ErrorCode::FlowControlError,
            Self::Packet(_) => ErrorCode::FrameFormatError,
            Self::ProtocolViolation(_) | Self::SequenceExhausted => ErrorCode::ProtocolViolation,
            Self::Destroyed(_) => ErrorCode::ApplicationError,
            Self::RemoteClosed { code, .. } => *code,
            _ => ErrorCode::InternalError,
        }
    }

    /// Whether the error ends the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::StreamIdsExhausted { .. })
    }
}
