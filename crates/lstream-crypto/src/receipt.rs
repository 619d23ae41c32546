//! Payment receipts.
//!
//! A receipt proves to a third party (who knows the receipt secret) how much a
//! receiver has credited to one stream:
//!
//! ```text
//! ┌─────────┬───────────┬───────────┬────────────────────┬────────────┐
//! │ ver (1) │ nonce(16) │ stream(1) │ total_received (8) │ HMAC (32)  │
//! └─────────┴───────────┴───────────┴────────────────────┴────────────┘
//! ```
//!
//! The HMAC covers the first 26 bytes. Length and version are checked before
//! the HMAC is recomputed.

use crate::keys::{hmac_sha256, verify_hmac_sha256};
use crate::{CryptoError, Result};

/// Current receipt version
pub const RECEIPT_VERSION: u8 = 1;

/// Receipt nonce size
pub const RECEIPT_NONCE_SIZE: usize = 16;

/// Length of the HMAC-covered receipt body
pub const RECEIPT_BODY_SIZE: usize = 1 + RECEIPT_NONCE_SIZE + 1 + 8;

/// Total receipt length
pub const RECEIPT_SIZE: usize = RECEIPT_BODY_SIZE + 32;

/// A verified receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Receipt format version
    pub version: u8,
    /// Nonce chosen by whoever asked for receipts
    pub nonce: [u8; RECEIPT_NONCE_SIZE],
    /// Stream the receipt is for
    pub stream_id: u64,
    /// Total amount received on the stream
    pub total_received: u64,
}

/// Create a receipt for `total_received` on `stream_id`.
///
/// # Errors
///
/// Returns [`CryptoError::ReceiptStreamIdTooLarge`] if the stream id does not
/// fit in a single byte.
pub fn create_receipt(
    nonce: &[u8; RECEIPT_NONCE_SIZE],
    stream_id: u64,
    total_received: u64,
    secret: &[u8],
) -> Result<[u8; RECEIPT_SIZE]> {
    let stream_byte =
        u8::try_from(stream_id).map_err(|_| CryptoError::ReceiptStreamIdTooLarge(stream_id))?;

    let mut receipt = [0u8; RECEIPT_SIZE];
    receipt[0] = RECEIPT_VERSION;
    receipt[1..17].copy_from_slice(nonce);
    receipt[17] = stream_byte;
    receipt[18..26].copy_from_slice(&total_received.to_be_bytes());

    let mac = hmac_sha256(secret, &receipt[..RECEIPT_BODY_SIZE]);
    receipt[RECEIPT_BODY_SIZE..].copy_from_slice(&mac);
    Ok(receipt)
}

/// Decode a receipt without checking its HMAC.
///
/// # Errors
///
/// Returns an error if the length or version is wrong.
pub fn decode_receipt(receipt: &[u8]) -> Result<Receipt> {
    if receipt.len() != RECEIPT_SIZE {
        return Err(CryptoError::InvalidReceiptLength {
            expected: RECEIPT_SIZE,
            actual: receipt.len(),
        });
    }
    if receipt[0] != RECEIPT_VERSION {
        return Err(CryptoError::InvalidReceiptVersion(receipt[0]));
    }

    let mut nonce = [0u8; RECEIPT_NONCE_SIZE];
    nonce.copy_from_slice(&receipt[1..17]);
    let mut total = [0u8; 8];
    total.copy_from_slice(&receipt[18..26]);

    Ok(Receipt {
        version: receipt[0],
        nonce,
        stream_id: u64::from(receipt[17]),
        total_received: u64::from_be_bytes(total),
    })
}

/// Verify a receipt against the receipt secret and decode it.
///
/// # Errors
///
/// Returns a length or version error before checking the HMAC, and
/// [`CryptoError::InvalidReceiptHmac`] if the HMAC does not match.
pub fn verify_receipt(receipt: &[u8], secret: &[u8]) -> Result<Receipt> {
    let decoded = decode_receipt(receipt)?;
    if !verify_hmac_sha256(
        secret,
        &receipt[..RECEIPT_BODY_SIZE],
        &receipt[RECEIPT_BODY_SIZE..],
    ) {
        return Err(CryptoError::InvalidReceiptHmac);
    }
    Ok(decoded)
}
