//! # LSTREAM Crypto
//!
//! Cryptographic primitives for the LSTREAM protocol.
//!
//! This crate provides:
//! - Key derivation from the connection's shared secret
//! - `AES-256-GCM` AEAD encryption of STREAM packets
//! - Fulfillment / condition generation for ledger packets
//! - Shared-secret derivation from a server secret and connection token
//! - Payment receipts authenticated with `HMAC-SHA256`
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Output |
//! |----------|-----------|--------|
//! | KDF | HMAC-SHA256 with context string | 32 bytes |
//! | AEAD | AES-256-GCM | nonce(12) ‖ tag(16) ‖ ciphertext |
//! | Fulfillment | HMAC-SHA256(fulfillment key, ciphertext) | 32 bytes |
//! | Condition | SHA-256(fulfillment) | 32 bytes |
//! | Receipt MAC | HMAC-SHA256(receipt secret, receipt body) | 32 bytes |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod keys;
pub mod random;
pub mod receipt;

pub use aead::AeadKey;
pub use error::CryptoError;
pub use keys::{StreamKeys, generate_condition, hmac_sha256, sha256};
pub use receipt::{Receipt, create_receipt, verify_receipt};

/// Shared secret size
pub const SHARED_SECRET_SIZE: usize = 32;

/// Fulfillment (preimage) size
pub const FULFILLMENT_SIZE: usize = 32;

/// Condition (hash) size
pub const CONDITION_SIZE: usize = 32;

/// Result alias for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
