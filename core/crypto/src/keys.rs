//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::aead::{rand_core::RngCore, OsRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use mediaguard_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of a root key fingerprint in bytes.
pub const FINGERPRINT_LENGTH: usize = 8;

/// Fill `buf` from the operating system CSPRNG.
pub(crate) fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Per-resource data key.
///
/// This is the key that touches payload bytes. It is never persisted in
/// the clear; the key store only keeps it wrapped under a [`RootKey`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; KEY_LENGTH],
}

impl DataKey {
    /// Generate a random data key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        fill_random(&mut key);
        Self { key }
    }

    /// Create a data key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Create a data key from a slice.
    ///
    /// # Errors
    /// - Returns error if the slice is not exactly KEY_LENGTH bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
            Error::Validation(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        self.key[..].ct_eq(&other.key[..]).into()
    }
}

impl Eq for DataKey {}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

/// Root key under which data keys are wrapped.
///
/// Supplied to the process as opaque key material (configuration, env, or a
/// passphrase run through the KDF) and injected into the key wrapper. The
/// root key itself never encrypts payload bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    key: [u8; KEY_LENGTH],
}

impl RootKey {
    /// Create a root key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Generate a random root key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        fill_random(&mut key);
        Self { key }
    }

    /// Decode a root key from standard base64.
    ///
    /// # Errors
    /// - Returns error if the text is not base64 or not KEY_LENGTH bytes
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("Root key is not valid base64: {}", e)))?;
        let result = <[u8; KEY_LENGTH]>::try_from(decoded.as_slice())
            .map(Self::from_bytes)
            .map_err(|_| {
                Error::Config(format!(
                    "Root key must be {} bytes, got {}",
                    KEY_LENGTH,
                    decoded.len()
                ))
            });
        decoded.zeroize();
        result
    }

    /// Encode the root key as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.key)
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Short, non-reversible identifier for logs and diagnostics.
    pub fn fingerprint(&self) -> String {
        use blake2::digest::consts::U8;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U8>::new();
        hasher.update(b"mediaguard-root-fingerprint");
        hasher.update(self.key);
        let digest = hasher.finalize();

        let mut out = String::with_capacity(FINGERPRINT_LENGTH * 2);
        for byte in digest.iter() {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// Derive the subkey used for wrapping data keys and shares.
    ///
    /// Uses blake2b with a domain separation label so the root key bytes are
    /// never fed to the cipher directly.
    pub(crate) fn derive_wrapping_key(&self) -> DataKey {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(b"mediaguard-keywrap-v1");

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        DataKey::from_bytes(derived)
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootKey({})", self.fingerprint())
    }
}

/// Salt for passphrase-based root key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; 32]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; 32];
        fill_random(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
