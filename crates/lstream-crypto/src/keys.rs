//! HMAC-SHA256 key derivation, fulfillments and conditions.
//!
//! Every STREAM connection is bound to one 32-byte shared secret. Two
//! independent keys are derived from it with fixed context strings:
//!
//! ```text
//! encryption_key  = HMAC-SHA256(shared_secret, "ilp_stream_encryption")
//! fulfillment_key = HMAC-SHA256(shared_secret, "ilp_stream_fulfillment")
//! ```
//!
//! The fulfillment for a packet is `HMAC-SHA256(fulfillment_key, ciphertext)`
//! and its condition is `SHA-256(fulfillment)`, so only a holder of the
//! shared secret can unlock the value attached to a packet.

use crate::aead::AeadKey;
use crate::{CryptoError, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

type HmacSha256 = Hmac<Sha256>;

/// Context string for the AEAD key
pub const ENCRYPTION_KEY_STRING: &[u8] = b"ilp_stream_encryption";

/// Context string for the fulfillment-generation key
pub const FULFILLMENT_GENERATION_STRING: &[u8] = b"ilp_stream_fulfillment";

/// Context string for deriving per-connection shared secrets on a server
pub const SHARED_SECRET_GENERATION_STRING: &[u8] = b"ilp_stream_shared_secret";

/// Number of random bytes in a connection token
pub const TOKEN_NONCE_SIZE: usize = 18;

/// Separator between the token nonce and an application connection tag
pub const CONNECTION_TAG_SEPARATOR: char = '~';

/// Compute `HMAC-SHA256(key, message)`.
#[must_use]
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Verify `HMAC-SHA256(key, message) == tag` in constant time.
#[must_use]
pub fn verify_hmac_sha256(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.verify_slice(tag).is_ok()
}

/// Compute `SHA-256(data)`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Condition committing to a fulfillment.
#[must_use]
pub fn generate_condition(fulfillment: &[u8; 32]) -> [u8; 32] {
    sha256(fulfillment)
}

/// Keys derived from a connection's shared secret.
#[derive(Clone, ZeroizeOnDrop)]
pub struct StreamKeys {
    encryption: AeadKey,
    fulfillment: [u8; 32],
}

impl StreamKeys {
    /// Derive both keys from a shared secret.
    #[must_use]
    pub fn derive(shared_secret: &[u8]) -> Self {
        Self {
            encryption: AeadKey::new(hmac_sha256(shared_secret, ENCRYPTION_KEY_STRING)),
            fulfillment: hmac_sha256(shared_secret, FULFILLMENT_GENERATION_STRING),
        }
    }

    /// AEAD key for STREAM packets.
    #[must_use]
    pub fn encryption_key(&self) -> &AeadKey {
        &self.encryption
    }

    /// Fulfillment for the given encrypted packet data.
    #[must_use]
    pub fn fulfillment(&self, data: &[u8]) -> [u8; 32] {
        hmac_sha256(&self.fulfillment, data)
    }

    /// Condition for the given encrypted packet data.
    #[must_use]
    pub fn condition(&self, data: &[u8]) -> [u8; 32] {
        generate_condition(&self.fulfillment(data))
    }
}

impl std::fmt::Debug for StreamKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamKeys").finish_non_exhaustive()
    }
}

/// Derive the shared secret a server uses for the connection named by `token`.
#[must_use]
pub fn derive_shared_secret(server_secret: &[u8], token: &[u8]) -> [u8; 32] {
    let generator = hmac_sha256(server_secret, SHARED_SECRET_GENERATION_STRING);
    hmac_sha256(&generator, token)
}

/// Generate a fresh connection token, optionally carrying an application tag.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidToken`] if the tag contains characters
/// outside `[A-Za-z0-9_~-]`, or [`CryptoError::RandomFailed`] if the CSPRNG fails.
pub fn generate_token(tag: Option<&str>) -> Result<String> {
    let nonce: [u8; TOKEN_NONCE_SIZE] = crate::random::random_bytes()?;
    let mut token = URL_SAFE_NO_PAD.encode(nonce);
    if let Some(tag) = tag {
        if !is_valid_tag(tag) {
            return Err(CryptoError::InvalidToken(format!(
                "connection tag contains invalid characters: {tag}"
            )));
        }
        token.push(CONNECTION_TAG_SEPARATOR);
        token.push_str(tag);
    }
    Ok(token)
}

/// Split a token into its nonce part and optional connection tag.
#[must_use]
pub fn split_token(token: &str) -> (&str, Option<&str>) {
    match token.split_once(CONNECTION_TAG_SEPARATOR) {
        Some((nonce, tag)) => (nonce, Some(tag)),
        None => (token, None),
    }
}

fn is_valid_tag(tag: &str) -> bool {
    tag.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '~'))
}
