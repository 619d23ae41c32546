//! Transport and codec error types.

use thiserror::Error;

/// Errors from decoding binary data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Ran out of input
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes required by the field being read
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Length prefix is malformed or absurdly large
    #[error("invalid length prefix")]
    InvalidLengthPrefix,

    /// Variable-length integer has a zero-byte body
    #[error("variable-length integer has no content")]
    EmptyVarUInt,

    /// Variable-length integer does not fit in 64 bits
    #[error("variable-length integer of {0} bytes does not fit in a u64")]
    VarUIntTooLarge(usize),

    /// String is not valid UTF-8
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Unknown ledger packet type
    #[error("unknown ledger packet type: {0}")]
    UnknownPacketType(u8),

    /// Reject code is not three ASCII characters
    #[error("invalid reject code")]
    InvalidErrorCode,

    /// Trailing bytes after a complete structure
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Transport layer errors
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// Transport is not connected
    #[error("transport is not connected")]
    NotConnected,

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// A handler is already registered
    #[error("a data handler is already registered")]
    HandlerAlreadyRegistered,

    /// Malformed packet handed to the transport
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport-specific error
    #[error("transport error: {0}")]
    Other(String),
}
