//! Cryptographic test vectors from published standards (RFC 4231, the GCM paper).
//!
//! This module contains test vectors from:
//! - RFC 4231 (HMAC-SHA256)
//! - FIPS 180-2 (SHA-256)
//! - The GCM specification test cases 13 and 14 (AES-256-GCM)
//!
//! These vectors ensure our implementations match the published values exactly.

use lstream_crypto::aead::{AeadKey, NONCE_SIZE, TAG_SIZE};
use lstream_crypto::{hmac_sha256, sha256};

// Helper function to decode hex strings
fn decode_hex(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

// ============================================================================
// RFC 4231 Test Vectors (HMAC-SHA256)
// ============================================================================

#[test]
fn test_hmac_sha256_rfc4231_case_1() {
    let key = [0x0b; 20];
    let expected =
        decode_hex("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7");
    assert_eq!(hmac_sha256(&key, b"Hi There").to_vec(), expected);
}

#[test]
fn test_hmac_sha256_rfc4231_case_2() {
    let expected =
        decode_hex("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
    assert_eq!(
        hmac_sha256(b"Jefe", b"what do ya want for nothing?").to_vec(),
        expected
    );
}

// ============================================================================
// FIPS 180-2 Test Vectors (SHA-256)
// ============================================================================

#[test]
fn test_sha256_abc() {
    let expected =
        decode_hex("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    assert_eq!(sha256(b"abc").to_vec(), expected);
}

#[test]
fn test_sha256_empty() {
    let expected =
        decode_hex("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    assert_eq!(sha256(b"").to_vec(), expected);
}

// ============================================================================
// GCM Specification Test Vectors (AES-256-GCM)
// ============================================================================

#[test]
fn test_aes256gcm_case_13_empty_plaintext() {
    let key = AeadKey::new([0u8; 32]);
    let nonce = [0u8; NONCE_SIZE];
    let output = key.encrypt_with_nonce(&nonce, b"").unwrap();

    assert_eq!(output.len(), NONCE_SIZE + TAG_SIZE);
    assert_eq!(
        output[NONCE_SIZE..].to_vec(),
        decode_hex("530f8afbc74536b9a963b4f1c4cb738b")
    );
}

#[test]
fn test_aes256gcm_case_14_zero_block() {
    let key = AeadKey::new([0u8; 32]);
    let nonce = [0u8; NONCE_SIZE];
    let output = key.encrypt_with_nonce(&nonce, &[0u8; 16]).unwrap();

    let tag = &output[NONCE_SIZE..NONCE_SIZE + TAG_SIZE];
    let ciphertext = &output[NONCE_SIZE + TAG_SIZE..];
    assert_eq!(tag.to_vec(), decode_hex("d0d1c8a799996bf0265b98b5d48ab919"));
    assert_eq!(
        ciphertext.to_vec(),
        decode_hex("cea7403d4d606b6e074ec5d3baf39d18")
    );

    assert_eq!(key.decrypt(&output).unwrap(), vec![0u8; 16]);
}
