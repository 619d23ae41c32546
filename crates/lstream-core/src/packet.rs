//! STREAM packet and frame encoding.
//!
//! Wire layout:
//!
//! ```text
//! version(1) ‖ type(1) ‖ VarUInt sequence ‖ VarUInt prepare_amount
//!            ‖ VarUInt frame_count ‖ frame* ‖ zero padding*
//! frame = type(1) ‖ VarOctetString contents
//! ```
//!
//! Frame contents are laid out field by field in declaration order. Unknown
//! frame types are skipped, and anything after the declared number of frames
//! is ignored so that padding and future extensions parse cleanly. Numeric
//! frame fields wider than 64 bits saturate to `u64::MAX`.

use crate::error::PacketError;
use lstream_crypto::StreamKeys;
use lstream_crypto::aead::ENCRYPTION_OVERHEAD;
use lstream_transport::ledger::PacketType;
use lstream_transport::oer::{OerBufExt, OerBufMutExt, var_octet_string_size, var_uint_size};
use lstream_transport::CodecError;
use tracing::trace;

/// Current protocol version
pub const VERSION: u8 = 1;

/// Protocol-level error codes carried in close frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Graceful close
    NoError = 0x01,
    /// Endpoint hit an internal error
    InternalError = 0x02,
    /// Endpoint cannot accept more work
    EndpointBusy = 0x03,
    /// Flow control limits were exceeded
    FlowControlError = 0x04,
    /// Stream id was invalid or above the limit
    StreamIdError = 0x05,
    /// Frame arrived for a stream in the wrong state
    StreamStateError = 0x06,
    /// Frame could not be parsed
    FrameFormatError = 0x07,
    /// Generic protocol violation
    ProtocolViolation = 0x08,
    /// Application-defined error
    ApplicationError = 0x09,
}

impl TryFrom<u8> for ErrorCode {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::NoError),
            0x02 => Ok(Self::InternalError),
            0x03 => Ok(Self::EndpointBusy),
            0x04 => Ok(Self::FlowControlError),
            0x05 => Ok(Self::StreamIdError),
            0x06 => Ok(Self::StreamStateError),
            0x07 => Ok(Self::FrameFormatError),
            0x08 => Ok(Self::ProtocolViolation),
            0x09 => Ok(Self::ApplicationError),
            _ => Err(PacketError::UnknownErrorCode(value)),
        }
    }
}

/// Frame type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Connection close or error
    ConnectionClose = 0x01,
    /// Sender's address
    ConnectionNewAddress = 0x02,
    /// Connection-level data limit
    ConnectionMaxData = 0x03,
    /// Blocked on the connection-level data limit
    ConnectionDataBlocked = 0x04,
    /// Highest stream id the sender accepts
    ConnectionMaxStreamId = 0x05,
    /// Blocked on the peer's stream id limit
    ConnectionStreamIdBlocked = 0x06,
    /// Sender's asset
    ConnectionAssetDetails = 0x07,
    /// Stream close or error
    StreamClose = 0x10,
    /// Share of the packet amount
    StreamMoney = 0x11,
    /// Receive limit and total
    StreamMaxMoney = 0x12,
    /// Blocked on the peer's receive limit
    StreamMoneyBlocked = 0x13,
    /// Stream bytes
    StreamData = 0x14,
    /// Stream data limit
    StreamMaxData = 0x15,
    /// Blocked on the peer's data limit
    StreamDataBlocked = 0x16,
    /// Payment receipt
    StreamReceipt = 0x17,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::ConnectionClose),
            0x02 => Ok(Self::ConnectionNewAddress),
            0x03 => Ok(Self::ConnectionMaxData),
            0x04 => Ok(Self::ConnectionDataBlocked),
            0x05 => Ok(Self::ConnectionMaxStreamId),
            0x06 => Ok(Self::ConnectionStreamIdBlocked),
            0x07 => Ok(Self::ConnectionAssetDetails),
            0x10 => Ok(Self::StreamClose),
            0x11 => Ok(Self::StreamMoney),
            0x12 => Ok(Self::StreamMaxMoney),
            0x13 => Ok(Self::StreamMoneyBlocked),
            0x14 => Ok(Self::StreamData),
            0x15 => Ok(Self::StreamMaxData),
            0x16 => Ok(Self::StreamDataBlocked),
            0x17 => Ok(Self::StreamReceipt),
            other => Err(other),
        }
    }
}

/// One typed unit inside a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Close the connection, gracefully or with an error
    ConnectionClose {
        /// Reason code
        code: ErrorCode,
        /// Human-readable reason
        message: String,
    },
    /// Announce the sender's address
    ConnectionNewAddress {
        /// Address to send packets to
        source_account: String,
    },
    /// Total bytes the sender accepts across all streams
    ConnectionMaxData {
        /// Maximum offset
        max_offset: u64,
    },
    /// Sender is blocked on the peer's connection data limit
    ConnectionDataBlocked {
        /// Limit it is blocked at
        max_offset: u64,
    },
    /// Highest stream id the sender accepts
    ConnectionMaxStreamId {
        /// Maximum stream id
        max_stream_id: u64,
    },
    /// Sender wants to open more streams than allowed
    ConnectionStreamIdBlocked {
        /// Limit it is blocked at
        max_stream_id: u64,
    },
    /// Sender's asset
    ConnectionAssetDetails {
        /// Asset code, e.g. `"USD"`
        source_asset_code: String,
        /// Decimal scale
        source_asset_scale: u8,
    },
    /// Close one stream
    StreamClose {
        /// Stream id
        stream_id: u64,
        /// Reason code
        code: ErrorCode,
        /// Human-readable reason
        message: String,
    },
    /// Credit a share of the packet amount to a stream
    StreamMoney {
        /// Stream id
        stream_id: u64,
        /// Relative share
        shares: u64,
    },
    /// Sender's receive limit for a stream
    StreamMaxMoney {
        /// Stream id
        stream_id: u64,
        /// Receive limit
        receive_max: u64,
        /// Total received so far
        total_received: u64,
    },
    /// Sender has money to send but the peer's limit blocks it
    StreamMoneyBlocked {
        /// Stream id
        stream_id: u64,
        /// Sender's send limit
        send_max: u64,
        /// Total sent so far
        total_sent: u64,
    },
    /// Stream bytes at an offset
    StreamData {
        /// Stream id
        stream_id: u64,
        /// Offset of the first byte
        offset: u64,
        /// Payload
        data: Vec<u8>,
    },
    /// Highest offset the sender accepts on a stream
    StreamMaxData {
        /// Stream id
        stream_id: u64,
        /// Maximum offset
        max_offset: u64,
    },
    /// Sender has data to send but the peer's window blocks it
    StreamDataBlocked {
        /// Stream id
        stream_id: u64,
        /// Limit it is blocked at
        max_offset: u64,
    },
    /// Receipt proving the receiver's total
    StreamReceipt {
        /// Stream id
        stream_id: u64,
        /// Encoded receipt
        receipt: Vec<u8>,
    },
}

impl Frame {
    /// The frame's type tag.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::ConnectionClose { .. } => FrameType::ConnectionClose,
            Self::ConnectionNewAddress { .. } => FrameType::ConnectionNewAddress,
            Self::ConnectionMaxData { .. } => FrameType::ConnectionMaxData,
            Self::ConnectionDataBlocked { .. } => FrameType::ConnectionDataBlocked,
            Self::ConnectionMaxStreamId { .. } => FrameType::ConnectionMaxStreamId,
            Self::ConnectionStreamIdBlocked { .. } => FrameType::ConnectionStreamIdBlocked,
            Self::ConnectionAssetDetails { .. } => FrameType::ConnectionAssetDetails,
            Self::StreamClose { .. } => FrameType::StreamClose,
            Self::StreamMoney { .. } => FrameType::StreamMoney,
            Self::StreamMaxMoney { .. } => FrameType::StreamMaxMoney,
            Self::StreamMoneyBlocked { .. } => FrameType::StreamMoneyBlocked,
            Self::StreamData { .. } => FrameType::StreamData,
            Self::StreamMaxData { .. } => FrameType::StreamMaxData,
            Self::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
            Self::StreamReceipt { .. } => FrameType::StreamReceipt,
        }
    }

    /// Stream the frame refers to, if it is a stream-level frame.
    #[must_use]
    pub fn stream_id(&self) -> Option<u64> {
        match self {
            Self::StreamClose { stream_id, .. }
            | Self::StreamMoney { stream_id, .. }
            | Self::StreamMaxMoney { stream_id, .. }
            | Self::StreamMoneyBlocked { stream_id, .. }
            | Self::StreamData { stream_id, .. }
            | Self::StreamMaxData { stream_id, .. }
            | Self::StreamDataBlocked { stream_id, .. }
            | Self::StreamReceipt { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    /// Size of the frame's contents, without the type byte or length prefix.
    #[must_use]
    pub fn contents_len(&self) -> usize {
        match self {
            Self::ConnectionClose { message, .. } => 1 + var_octet_string_size(message.len()),
            Self::ConnectionNewAddress { source_account } => {
                var_octet_string_size(source_account.len())
            }
            Self::ConnectionMaxData { max_offset }
            | Self::ConnectionDataBlocked { max_offset } => var_uint_size(*max_offset),
            Self::ConnectionMaxStreamId { max_stream_id }
            | Self::ConnectionStreamIdBlocked { max_stream_id } => var_uint_size(*max_stream_id),
            Self::ConnectionAssetDetails {
                source_asset_code, ..
            } => var_octet_string_size(source_asset_code.len()) + 1,
            Self::StreamClose {
                stream_id, message, ..
            } => var_uint_size(*stream_id) + 1 + var_octet_string_size(message.len()),
            Self::StreamMoney { stream_id, shares } => {
                var_uint_size(*stream_id) + var_uint_size(*shares)
            }
            Self::StreamMaxMoney {
                stream_id,
                receive_max,
                total_received,
            } => var_uint_size(*stream_id) + var_uint_size(*receive_max) + var_uint_size(*total_received),
            Self::StreamMoneyBlocked {
                stream_id,
                send_max,
                total_sent,
            } => var_uint_size(*stream_id) + var_uint_size(*send_max) + var_uint_size(*total_sent),
            Self::StreamData {
                stream_id,
                offset,
                data,
            } => var_uint_size(*stream_id) + var_uint_size(*offset) + var_octet_string_size(data.len()),
            Self::StreamMaxData {
                stream_id,
                max_offset,
            }
            | Self::StreamDataBlocked {
                stream_id,
                max_offset,
            } => var_uint_size(*stream_id) + var_uint_size(*max_offset),
            Self::StreamReceipt { stream_id, receipt } => {
                var_uint_size(*stream_id) + var_octet_string_size(receipt.len())
            }
        }
    }

    /// Encoded size of the whole frame.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + var_octet_string_size(self.contents_len())
    }

    fn write_contents(&self, buf: &mut Vec<u8>) {
        match self {
            Self::ConnectionClose { code, message } => {
                buf.push(*code as u8);
                buf.write_var_string(message);
            }
            Self::ConnectionNewAddress { source_account } => buf.write_var_string(source_account),
            Self::ConnectionMaxData { max_offset } | Self::ConnectionDataBlocked { max_offset } => {
                buf.write_var_uint(*max_offset);
            }
            Self::ConnectionMaxStreamId { max_stream_id }
            | Self::ConnectionStreamIdBlocked { max_stream_id } => buf.write_var_uint(*max_stream_id),
            Self::ConnectionAssetDetails {
                source_asset_code,
                source_asset_scale,
            } => {
                buf.write_var_string(source_asset_code);
                buf.push(*source_asset_scale);
            }
            Self::StreamClose {
                stream_id,
                code,
                message,
            } => {
                buf.write_var_uint(*stream_id);
                buf.push(*code as u8);
                buf.write_var_string(message);
            }
            Self::StreamMoney { stream_id, shares } => {
                buf.write_var_uint(*stream_id);
                buf.write_var_uint(*shares);
            }
            Self::StreamMaxMoney {
                stream_id,
                receive_max,
                total_received,
            } => {
                buf.write_var_uint(*stream_id);
                buf.write_var_uint(*receive_max);
                buf.write_var_uint(*total_received);
            }
            Self::StreamMoneyBlocked {
                stream_id,
                send_max,
                total_sent,
            } => {
                buf.write_var_uint(*stream_id);
                buf.write_var_uint(*send_max);
                buf.write_var_uint(*total_sent);
            }
            Self::StreamData {
                stream_id,
                offset,
                data,
            } => {
                buf.write_var_uint(*stream_id);
                buf.write_var_uint(*offset);
                buf.write_var_octet_string(data);
            }
            Self::StreamMaxData {
                stream_id,
                max_offset,
            }
            | Self::StreamDataBlocked {
                stream_id,
                max_offset,
            } => {
                buf.write_var_uint(*stream_id);
                buf.write_var_uint(*max_offset);
            }
            Self::StreamReceipt { stream_id, receipt } => {
                buf.write_var_uint(*stream_id);
                buf.write_var_octet_string(receipt);
            }
        }
    }

    fn read_contents(frame_type: FrameType, mut contents: &[u8]) -> Result<Self, PacketError> {
        let invalid = |source: CodecError| PacketError::InvalidFrame {
            frame_type: frame_type as u8,
            source,
        };
        let r = &mut contents;
        let frame = match frame_type {
            FrameType::ConnectionClose => Self::ConnectionClose {
                code: ErrorCode::try_from(r.read_u8().map_err(invalid)?)?,
                message: r.read_var_string().map_err(invalid)?,
            },
            FrameType::ConnectionNewAddress => Self::ConnectionNewAddress {
                source_account: r.read_var_string().map_err(invalid)?,
            },
            FrameType::ConnectionMaxData => Self::ConnectionMaxData {
                max_offset: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::ConnectionDataBlocked => Self::ConnectionDataBlocked {
                max_offset: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::ConnectionMaxStreamId => Self::ConnectionMaxStreamId {
                max_stream_id: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::ConnectionStreamIdBlocked => Self::ConnectionStreamIdBlocked {
                max_stream_id: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::ConnectionAssetDetails => Self::ConnectionAssetDetails {
                source_asset_code: r.read_var_string().map_err(invalid)?,
                source_asset_scale: r.read_u8().map_err(invalid)?,
            },
            FrameType::StreamClose => Self::StreamClose {
                stream_id: r.read_var_uint_saturating().map_err(invalid)?,
                code: ErrorCode::try_from(r.read_u8().map_err(invalid)?)?,
                message: r.read_var_string().map_err(invalid)?,
            },
            FrameType::StreamMoney => Self::StreamMoney {
                stream_id: r.read_var_uint_saturating().map_err(invalid)?,
                shares: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::StreamMaxMoney => Self::StreamMaxMoney {
                stream_id: r.read_var_uint_saturating().map_err(invalid)?,
                receive_max: r.read_var_uint_saturating().map_err(invalid)?,
                total_received: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::StreamMoneyBlocked => Self::StreamMoneyBlocked {
                stream_id: r.read_var_uint_saturating().map_err(invalid)?,
                send_max: r.read_var_uint_saturating().map_err(invalid)?,
                total_sent: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::StreamData => Self::StreamData {
                stream_id: r.read_var_uint_saturating().map_err(invalid)?,
                offset: r.read_var_uint_saturating().map_err(invalid)?,
                data: r.read_var_octet_string().map_err(invalid)?,
            },
            FrameType::StreamMaxData => Self::StreamMaxData {
                stream_id: r.read_var_uint_saturating().map_err(invalid)?,
                max_offset: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::StreamDataBlocked => Self::StreamDataBlocked {
                stream_id: r.read_var_uint_saturating().map_err(invalid)?,
                max_offset: r.read_var_uint_saturating().map_err(invalid)?,
            },
            FrameType::StreamReceipt => Self::StreamReceipt {
                stream_id: r.read_var_uint_saturating().map_err(invalid)?,
                receipt: r.read_var_octet_string().map_err(invalid)?,
            },
        };
        Ok(frame)
    }
}

/// One STREAM packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Correlates a request with its response
    pub sequence: u64,
    /// Mirrors the carrying ledger packet's type
    pub packet_type: PacketType,
    /// Minimum destination amount (requests) or amount received (responses)
    pub prepare_amount: u64,
    /// Frames in order
    pub frames: Vec<Frame>,
}

impl Packet {
    /// Create a packet.
    #[must_use]
    pub fn new(sequence: u64, packet_type: PacketType, prepare_amount: u64, frames: Vec<Frame>) -> Self {
        Self {
            sequence,
            packet_type,
            prepare_amount,
            frames,
        }
    }

    /// Exact serialized size, computed without allocating.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        2 + var_uint_size(self.sequence)
            + var_uint_size(self.prepare_amount)
            + var_uint_size(self.frames.len() as u64)
            + self.frames.iter().map(Frame::encoded_len).sum::<usize>()
    }

    /// Serialize the packet.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(VERSION);
        buf.push(self.packet_type as u8);
        buf.write_var_uint(self.sequence);
        buf.write_var_uint(self.prepare_amount);
        buf.write_var_uint(self.frames.len() as u64);
        let mut contents = Vec::new();
        for frame in &self.frames {
            contents.clear();
            frame.write_contents(&mut contents);
            buf.push(frame.frame_type() as u8);
            buf.write_var_octet_string(&contents);
        }
    }

    /// Parse a packet.
    ///
    /// # Errors
    /// Returns `PacketError` on a version mismatch, a truncated or malformed
    /// frame, or fewer frames than the header declares.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        let mut r = data;
        let version = r.read_u8()?;
        if version != VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let type_byte = r.read_u8()?;
        let packet_type =
            PacketType::try_from(type_byte).map_err(|_| PacketError::InvalidPacketType(type_byte))?;
        let sequence = r.read_var_uint()?;
        let prepare_amount = r.read_var_uint_saturating()?;
        let declared = r.read_var_uint()?;

        let mut frames = Vec::new();
        for parsed in 0..declared {
            if r.is_empty() {
                return Err(PacketError::InconsistentFrameCount { declared, parsed });
            }
            let tag = r.read_u8()?;
            let contents = r.read_var_octet_string().map_err(|source| PacketError::InvalidFrame {
                frame_type: tag,
                source,
            })?;
            match FrameType::try_from(tag) {
                Ok(frame_type) => frames.push(Frame::read_contents(frame_type, &contents)?),
                Err(unknown) => trace!(frame_type = unknown, "skipping unknown frame"),
            }
        }

        Ok(Self {
            sequence,
            packet_type,
            prepare_amount,
            frames,
        })
    }

    /// Serialize, pad with zeros to `pad_to` bytes of ciphertext if given,
    /// and encrypt.
    ///
    /// # Errors
    /// Returns `PacketError::Decrypt` if encryption fails.
    pub fn encrypt(&self, keys: &StreamKeys, pad_to: Option<usize>) -> Result<Vec<u8>, PacketError> {
        let mut plaintext = self.to_bytes();
        if let Some(target) = pad_to {
            let target_plaintext = target.saturating_sub(ENCRYPTION_OVERHEAD);
            if plaintext.len() < target_plaintext {
                plaintext.resize(target_plaintext, 0);
            }
        }
        Ok(keys.encryption_key().encrypt(&plaintext)?)
    }

    /// Decrypt and parse.
    ///
    /// # Errors
    /// Returns `PacketError::Decrypt` if authentication fails, or any parse error.
    pub fn decrypt(keys: &StreamKeys, data: &[u8]) -> Result<Self, PacketError> {
        let plaintext = keys.encryption_key().decrypt(data)?;
        Self::from_bytes(&plaintext)
    }
}
