//! OER binary primitives.
//!
//! Extension traits over [`bytes::Buf`] / [`bytes::BufMut`] for the
//! encodings used by both ledger packets and STREAM packets:
//!
//! - Length prefix: one byte if `< 128`, otherwise `0x80 | n` followed by an
//!   `n`-byte big-endian length
//! - VarUInt: length prefix followed by the minimal big-endian bytes
//!   (at least one)
//! - VarOctetString: length prefix followed by the raw bytes
//!
//! The `*_size` functions predict encoded sizes without allocating.

use crate::error::CodecError;
use bytes::{Buf, BufMut};

type Result<T> = std::result::Result<T, CodecError>;

/// Number of bytes needed for the big-endian body of `value` (at least one).
#[must_use]
pub fn var_uint_body_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Encoded size of a length prefix for `len`.
#[must_use]
pub fn length_prefix_size(len: usize) -> usize {
    if len < 0x80 {
        1
    } else {
        1 + var_uint_body_len(len as u64)
    }
}

/// Encoded size of a VarUInt.
#[must_use]
pub fn var_uint_size(value: u64) -> usize {
    let body = var_uint_body_len(value);
    length_prefix_size(body) + body
}

/// Encoded size of a VarOctetString of `len` bytes.
#[must_use]
pub fn var_octet_string_size(len: usize) -> usize {
    length_prefix_size(len) + len
}

fn ensure<B: Buf + ?Sized>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CodecError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Reading OER primitives from a buffer.
pub trait OerBufExt: Buf {
    /// Read one byte.
    fn read_u8(&mut self) -> Result<u8> {
        ensure(self, 1)?;
        Ok(self.get_u8())
    }

    /// Read a fixed-width big-endian `u64`.
    fn read_u64(&mut self) -> Result<u64> {
        ensure(self, 8)?;
        Ok(self.get_u64())
    }

    /// Read exactly `len` bytes.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        ensure(self, len)?;
        let mut out = vec![0u8; len];
        self.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Read a fixed-size array.
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        ensure(self, N)?;
        let mut out = [0u8; N];
        self.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Skip `len` bytes.
    fn skip(&mut self, len: usize) -> Result<()> {
        ensure(self, len)?;
        self.advance(len);
        Ok(())
    }

    /// Read a length prefix.
    fn read_length_prefix(&mut self) -> Result<usize> {
        let first = self.read_u8()?;
        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }
        let count = usize::from(first & 0x7F);
        if count == 0 || count > std::mem::size_of::<usize>() {
            return Err(CodecError::InvalidLengthPrefix);
        }
        ensure(self, count)?;
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | usize::from(self.get_u8());
        }
        Ok(len)
    }

    /// Read a length-prefixed byte string.
    fn read_var_octet_string(&mut self) -> Result<Vec<u8>> {
        let len = self.read_length_prefix()?;
        self.read_bytes(len)
    }

    /// Read a length-prefixed UTF-8 string.
    fn read_var_string(&mut self) -> Result<String> {
        let raw = self.read_var_octet_string()?;
        String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a VarUInt, failing if it does not fit in 64 bits.
    fn read_var_uint(&mut self) -> Result<u64> {
        let len = self.read_length_prefix()?;
        if len == 0 {
            return Err(CodecError::EmptyVarUInt);
        }
        if len > 8 {
            return Err(CodecError::VarUIntTooLarge(len));
        }
        ensure(self, len)?;
        let mut value = 0u64;
        for _ in 0..len {
            value = (value << 8) | u64::from(self.get_u8());
        }
        Ok(value)
    }

    /// Read a VarUInt, saturating to `u64::MAX` if it is wider than 64 bits.
    fn read_var_uint_saturating(&mut self) -> Result<u64> {
        let len = self.read_length_prefix()?;
        if len == 0 {
            return Err(CodecError::EmptyVarUInt);
        }
        ensure(self, len)?;
        let mut value = 0u64;
        let mut overflow = false;
        for _ in 0..len {
            let byte = self.get_u8();
            if value >> 56 != 0 {
                overflow = true;
            }
            value = (value << 8) | u64::from(byte);
        }
        Ok(if overflow { u64::MAX } else { value })
    }
}

impl<T: Buf + ?Sized> OerBufExt for T {}

/// Writing OER primitives into a buffer.
pub trait OerBufMutExt: BufMut {
    /// Write a length prefix.
    fn write_length_prefix(&mut self, len: usize) {
        if len < 0x80 {
            // fits in 7 bits
            self.put_u8(len as u8);
        } else {
            let bytes = (len as u64).to_be_bytes();
            let count = var_uint_body_len(len as u64);
            self.put_u8(0x80 | count as u8);
            self.put_slice(&bytes[8 - count..]);
        }
    }

    /// Write a VarUInt.
    fn write_var_uint(&mut self, value: u64) {
        let bytes = value.to_be_bytes();
        let count = var_uint_body_len(value);
        self.write_length_prefix(count);
        self.put_slice(&bytes[8 - count..]);
    }

    /// Write a length-prefixed byte string.
    fn write_var_octet_string(&mut self, data: &[u8]) {
        self.write_length_prefix(data.len());
        self.put_slice(data);
    }

    /// Write a length-prefixed UTF-8 string.
    fn write_var_string(&mut self, s: &str) {
        self.write_var_octet_string(s.as_bytes());
    }
}

impl<T: BufMut + ?Sized> OerBufMutExt for T {}
