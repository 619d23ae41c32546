//! `AES-256-GCM` AEAD encryption.
//!
//! STREAM packets are encrypted with `AES-256-GCM` under the connection's
//! derived encryption key:
//! - 256-bit keys
//! - 96-bit random nonces
//! - 128-bit authentication tags
//!
//! The encrypted form is laid out as:
//!
//! ```text
//! ┌───────────┬──────────┬─────────────────┐
//! │ nonce(12) │ tag(16)  │ ciphertext (N)  │
//! └───────────┴──────────┴─────────────────┘
//! ```
//!
//! Decryption never returns partial plaintext: a truncated input or a tag
//! mismatch fails with [`CryptoError::DecryptionFailed`].

use crate::CryptoError;
use aes_gcm::{
    Aes256Gcm, Key, Nonce as GcmNonce, Tag as GcmTag,
    aead::{AeadInPlace, KeyInit},
};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// AES-GCM nonce size (12 bytes / 96 bits).
pub const NONCE_SIZE: usize = 12;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Bytes added to a plaintext by [`AeadKey::encrypt`].
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// AEAD encryption key (32 bytes).
///
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with extreme care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Encrypt a plaintext under a fresh random nonce.
    ///
    /// Returns `nonce ‖ tag ‖ ciphertext` (`plaintext.len()` + 28 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` if no nonce can be generated, or
    /// `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce: [u8; NONCE_SIZE] = crate::random::random_bytes()?;
        self.encrypt_with_nonce(&nonce, plaintext)
    }

    /// Encrypt with a caller-chosen nonce.
    ///
    /// The nonce must never be reused with the same key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher()
            .encrypt_in_place_detached(GcmNonce::from_slice(nonce), b"", &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(ENCRYPTION_OVERHEAD + buffer.len());
        output.extend_from_slice(nonce);
        output.extend_from_slice(tag.as_slice());
        output.extend_from_slice(&buffer);
        Ok(output)
    }

    /// Decrypt `nonce ‖ tag ‖ ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` if the input is shorter than
    /// the nonce and tag or if authentication fails.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < ENCRYPTION_OVERHEAD {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, rest) = data.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let mut buffer = ciphertext.to_vec();
        self.cipher()
            .decrypt_in_place_detached(
                GcmNonce::from_slice(nonce),
                b"",
                &mut buffer,
                GcmTag::from_slice(tag),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}
