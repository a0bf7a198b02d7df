//! Authenticated payload encryption using ChaCha20-Poly1305.
//!
//! ChaCha20-Poly1305 takes a 256-bit key and a 96-bit nonce and appends a
//! 128-bit Poly1305 tag. Nonces are drawn at random for every call, so
//! uniqueness under one key is probabilistic (birthday bound over 2^96);
//! rotate keys long before that matters.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305,
};

use crate::keys::DataKey;
use mediaguard_common::{Error, Result};

/// Nonce size for ChaCha20-Poly1305 (12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Smallest blob `decrypt` will look at: an empty plaintext.
pub const MIN_BLOB_SIZE: usize = NONCE_SIZE + TAG_SIZE;

/// Generate a fresh per-resource key.
pub fn generate_key() -> DataKey {
    DataKey::generate()
}

/// Encrypt plaintext under a per-resource key.
///
/// # Postconditions
/// - Returns nonce || ciphertext || tag
/// - The nonce is freshly generated for this call
/// - The output length is plaintext length + NONCE_SIZE + TAG_SIZE
pub fn encrypt(plaintext: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    encrypt_with_aad(plaintext, b"", key)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// # Errors
/// - `Error::Integrity` if the blob is shorter than MIN_BLOB_SIZE
/// - `Error::Integrity` if the tag does not verify (wrong key, flipped bits
///   anywhere, truncation, appended bytes)
pub fn decrypt(blob: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    decrypt_with_aad(blob, b"", key)
}

/// Encrypt with associated data bound into the tag.
pub fn encrypt_with_aad(plaintext: &[u8], aad: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| Error::Validation("Plaintext too large for a single blob".to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt a blob whose tag covers `aad`.
pub fn decrypt_with_aad(blob: &[u8], aad: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    if blob.len() < MIN_BLOB_SIZE {
        return Err(Error::Integrity);
    }

    let (nonce_bytes, encrypted) = blob.split_at(NONCE_SIZE);
    let nonce = GenericArray::from_slice(nonce_bytes);

    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));

    cipher
        .decrypt(nonce, Payload { msg: encrypted, aad })
        .map_err(|_| Error::Integrity)
}
