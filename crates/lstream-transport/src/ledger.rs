//! Ledger packets: the Prepare / Fulfill / Reject exchange that carries
//! STREAM packets as opaque data.
//!
//! Wire format:
//!
//! ```text
//! packet  = type(1) ‖ VarOctetString(body)
//! Prepare = amount u64 ‖ expires_at u64 (unix ms) ‖ condition(32)
//!           ‖ VarString destination ‖ VarOctetString data
//! Fulfill = fulfillment(32) ‖ VarOctetString data
//! Reject  = code(3) ‖ VarString triggered_by ‖ VarString message
//!           ‖ VarOctetString data
//! ```

use crate::error::CodecError;
use crate::oer::{OerBufExt, OerBufMutExt};
use bytes::Buf;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Ledger packet type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Conditional value transfer request
    Prepare = 12,
    /// Value transfer executed
    Fulfill = 13,
    /// Value transfer refused
    Reject = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            12 => Ok(Self::Prepare),
            13 => Ok(Self::Fulfill),
            14 => Ok(Self::Reject),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

/// Reject code class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// `F..`: retrying the same packet will not help
    Final,
    /// `T..`: may succeed if retried later
    Temporary,
    /// `R..`: relative to the packet (e.g. expired)
    Relative,
}

/// Three-character reject code, e.g. `F08`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode([u8; 3]);

impl ErrorCode {
    /// Generic final error
    pub const F00_BAD_REQUEST: Self = Self(*b"F00");
    /// Packet data could not be parsed or understood
    pub const F01_INVALID_PACKET: Self = Self(*b"F01");
    /// Destination unreachable
    pub const F02_UNREACHABLE: Self = Self(*b"F02");
    /// Fulfillment did not match the condition
    pub const F05_WRONG_CONDITION: Self = Self(*b"F05");
    /// Receiver did not expect this payment
    pub const F06_UNEXPECTED_PAYMENT: Self = Self(*b"F06");
    /// Amount exceeds what the path allows per packet
    pub const F08_AMOUNT_TOO_LARGE: Self = Self(*b"F08");
    /// Application-level rejection (STREAM receivers use this)
    pub const F99_APPLICATION_ERROR: Self = Self(*b"F99");
    /// Temporary internal error
    pub const T00_INTERNAL_ERROR: Self = Self(*b"T00");
    /// Next hop unreachable
    pub const T01_PEER_UNREACHABLE: Self = Self(*b"T01");
    /// Peer is busy
    pub const T03_CONNECTOR_BUSY: Self = Self(*b"T03");
    /// Not enough liquidity on the path
    pub const T04_INSUFFICIENT_LIQUIDITY: Self = Self(*b"T04");
    /// Sender is being rate limited
    pub const T05_RATE_LIMITED: Self = Self(*b"T05");
    /// Packet expired before it was fulfilled
    pub const R00_TRANSFER_TIMED_OUT: Self = Self(*b"R00");

    /// Create from three ASCII bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidErrorCode` unless the bytes are an uppercase
    /// letter followed by two alphanumerics.
    pub fn new(code: [u8; 3]) -> Result<Self, CodecError> {
        if !code[0].is_ascii_uppercase()
            || !code[1].is_ascii_alphanumeric()
            || !code[2].is_ascii_alphanumeric()
        {
            return Err(CodecError::InvalidErrorCode);
        }
        Ok(Self(code))
    }

    /// Raw code bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }

    /// Code as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    /// Class derived from the leading letter
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self.0[0] {
            b'T' => ErrorClass::Temporary,
            b'R' => ErrorClass::Relative,
            _ => ErrorClass::Final,
        }
    }

    /// Whether this is a temporary (`T..`) error
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.class() == ErrorClass::Temporary
    }

    /// Whether this is a final (`F..`) error
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.class() == ErrorClass::Final
    }

    /// Whether this is a relative (`R..`) error
    #[must_use]
    pub fn is_relative(&self) -> bool {
        self.class() == ErrorClass::Relative
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({})", self.as_str())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditional value transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    /// Amount in the sender's units at this hop
    pub amount: u64,
    /// Expiry time
    pub expires_at: SystemTime,
    /// SHA-256 of the fulfillment that unlocks the value
    pub execution_condition: [u8; 32],
    /// Destination address
    pub destination: String,
    /// Opaque application data
    pub data: Vec<u8>,
}

/// Value transfer executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfill {
    /// Preimage of the Prepare's condition
    pub fulfillment: [u8; 32],
    /// Opaque application data
    pub data: Vec<u8>,
}

/// Value transfer refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// Reject code
    pub code: ErrorCode,
    /// Address of the node that produced the reject
    pub triggered_by: String,
    /// Human readable message
    pub message: String,
    /// Opaque application data
    pub data: Vec<u8>,
}

impl Reject {
    /// Build a reject with no data.
    #[must_use]
    pub fn new(code: ErrorCode, triggered_by: &str, message: &str) -> Self {
        Self {
            code,
            triggered_by: triggered_by.to_string(),
            message: message.to_string(),
            data: Vec::new(),
        }
    }

    /// Attach application data.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// Any ledger packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerPacket {
    /// Request
    Prepare(Prepare),
    /// Success response
    Fulfill(Fulfill),
    /// Failure response
    Reject(Reject),
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl LedgerPacket {
    /// Type byte of this packet
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Prepare(_) => PacketType::Prepare,
            Self::Fulfill(_) => PacketType::Fulfill,
            Self::Reject(_) => PacketType::Reject,
        }
    }

    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Self::Prepare(p) => {
                body.extend_from_slice(&p.amount.to_be_bytes());
                body.extend_from_slice(&millis_since_epoch(p.expires_at).to_be_bytes());
                body.extend_from_slice(&p.execution_condition);
                body.write_var_string(&p.destination);
                body.write_var_octet_string(&p.data);
            }
            Self::Fulfill(f) => {
                body.extend_from_slice(&f.fulfillment);
                body.write_var_octet_string(&f.data);
            }
            Self::Reject(r) => {
                body.extend_from_slice(r.code.as_bytes());
                body.write_var_string(&r.triggered_by);
                body.write_var_string(&r.message);
                body.write_var_octet_string(&r.data);
            }
        }

        let mut out = Vec::with_capacity(body.len() + 4);
        out.push(self.packet_type() as u8);
        out.write_var_octet_string(&body);
        out
    }

    /// Parse from bytes.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if the packet is truncated, has an unknown type
    /// or carries trailing bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = data;
        let packet_type = PacketType::try_from(reader.read_u8()?)?;
        let body = reader.read_var_octet_string()?;
        if reader.has_remaining() {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }

        let mut reader = &body[..];
        let packet = match packet_type {
            PacketType::Prepare => {
                let amount = reader.read_u64()?;
                let expires_at = UNIX_EPOCH + Duration::from_millis(reader.read_u64()?);
                let execution_condition = reader.read_array::<32>()?;
                let destination = reader.read_var_string()?;
                let data = reader.read_var_octet_string()?;
                Self::Prepare(Prepare {
                    amount,
                    expires_at,
                    execution_condition,
                    destination,
                    data,
                })
            }
            PacketType::Fulfill => {
                let fulfillment = reader.read_array::<32>()?;
                let data = reader.read_var_octet_string()?;
                Self::Fulfill(Fulfill { fulfillment, data })
            }
            PacketType::Reject => {
                let code = ErrorCode::new(reader.read_array::<3>()?)?;
                let triggered_by = reader.read_var_string()?;
                let message = reader.read_var_string()?;
                let data = reader.read_var_octet_string()?;
                Self::Reject(Reject {
                    code,
                    triggered_by,
                    message,
                    data,
                })
            }
        };
        if reader.has_remaining() {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }
        Ok(packet)
    }
}

impl From<Prepare> for LedgerPacket {
    fn from(p: Prepare) -> Self {
        Self::Prepare(p)
    }
}

impl From<Fulfill> for LedgerPacket {
    fn from(f: Fulfill) -> Self {
        Self::Fulfill(f)
    }
}

impl From<Reject> for LedgerPacket {
    fn from(r: Reject) -> Self {
        Self::Reject(r)
    }
}

/// Data attached to an `F08 Amount Too Large` reject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountTooLargeData {
    /// Amount the rejecting hop received
    pub received_amount: u64,
    /// Largest amount the rejecting hop accepts
    pub maximum_amount: u64,
}

impl AmountTooLargeData {
    /// Encoded length
    pub const SIZE: usize = 16;

    /// Serialize to 16 bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.received_amount.to_be_bytes());
        out.extend_from_slice(&self.maximum_amount.to_be_bytes());
        out
    }

    /// Parse from reject data.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnexpectedEof` if the data is shorter than 16 bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = data;
        Ok(Self {
            received_amount: reader.read_u64()?,
            maximum_amount: reader.read_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prepare() -> Prepare {
        Prepare {
            amount: 1_000,
            expires_at: UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
            execution_condition: [7u8; 32],
            destination: "test.receiver.abc".to_string(),
            data: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_prepare_roundtrip() {
        let packet = LedgerPacket::Prepare(sample_prepare());
        let bytes = packet.to_bytes();
        assert_eq!(bytes[0], 12);
        assert_eq!(LedgerPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_reject_roundtrip() {
        let packet: LedgerPacket = Reject::new(ErrorCode::F08_AMOUNT_TOO_LARGE, "test.a", "too big")
            .with_data(
                AmountTooLargeData {
                    received_amount: 2000,
                    maximum_amount: 1500,
                }
                .to_bytes(),
            )
            .into();
        let decoded = LedgerPacket::from_bytes(&packet.to_bytes()).unwrap();
        let LedgerPacket::Reject(reject) = decoded else {
            panic!("expected reject");
        };
        assert_eq!(reject.code, ErrorCode::F08_AMOUNT_TOO_LARGE);
        let data = AmountTooLargeData::from_bytes(&reject.data).unwrap();
        assert_eq!(data.received_amount, 2000);
        assert_eq!(data.maximum_amount, 1500);
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            LedgerPacket::from_bytes(&[99, 0]),
            Err(CodecError::UnknownPacketType(99))
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = LedgerPacket::Fulfill(Fulfill {
            fulfillment: [0; 32],
            data: vec![],
        })
        .to_bytes();
        bytes.push(0);
        assert!(matches!(
            LedgerPacket::from_bytes(&bytes),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_error_code_classes() {
        assert!(ErrorCode::T04_INSUFFICIENT_LIQUIDITY.is_temporary());
        assert!(ErrorCode::F08_AMOUNT_TOO_LARGE.is_final());
        assert!(ErrorCode::R00_TRANSFER_TIMED_OUT.is_relative());
        assert_eq!(ErrorCode::F99_APPLICATION_ERROR.to_string(), "F99");
        assert!(ErrorCode::new(*b"x00").is_err());
    }
}
