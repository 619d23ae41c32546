//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure or truncated input)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Receipt has the wrong length
    #[error("invalid receipt length: expected {expected}, got {actual}")]
    InvalidReceiptLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Receipt version is not supported
    #[error("unsupported receipt version: {0}")]
    InvalidReceiptVersion(u8),

    /// Receipt stream id does not fit in one byte
    #[error("stream id {0} cannot be encoded in a receipt")]
    ReceiptStreamIdTooLarge(u64),

    /// Receipt HMAC did not verify
    #[error("invalid receipt: HMAC mismatch")]
    InvalidReceiptHmac,

    /// Invalid connection token
    #[error("invalid connection token: {0}")]
    InvalidToken(String),
}
