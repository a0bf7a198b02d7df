//! Envelope wrapping of data keys under a root key.
//!
//! A wrapped token is self-authenticating: `version(1) || nonce || ct || tag`,
//! where the version byte is bound into the tag as associated data. Any
//! failure to open a token, whether from a different root key or a damaged
//! token, surfaces as the same [`Error::WrongRootKey`].

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::aead::{decrypt_with_aad, encrypt_with_aad};
use crate::keys::{DataKey, RootKey};
use mediaguard_common::{Error, Result, SensitiveBytes};

/// Current token format version.
pub const TOKEN_VERSION: u8 = 1;

const TOKEN_AAD_LABEL: &[u8] = b"mediaguard-wrapped-token";

/// Opaque wrapped-key token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedToken(Vec<u8>);

impl WrappedToken {
    /// Build a token from raw bytes (as persisted).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// URL-safe text form for transport and text columns.
    pub fn to_text(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    /// Parse the text form.
    ///
    /// # Errors
    /// - `Error::Validation` if the text is not URL-safe base64
    pub fn from_text(text: &str) -> Result<Self> {
        URL_SAFE_NO_PAD
            .decode(text.trim())
            .map(Self)
            .map_err(|e| Error::Validation(format!("Malformed token text: {}", e)))
    }

    /// Token length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the token is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for WrappedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedToken({} bytes)", self.0.len())
    }
}

fn token_aad(version: u8) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + TOKEN_AAD_LABEL.len());
    aad.push(version);
    aad.extend_from_slice(TOKEN_AAD_LABEL);
    aad
}

/// Wraps and unwraps key material under an injected root key.
pub struct KeyWrapper {
    wrapping_key: DataKey,
    fingerprint: String,
}

impl KeyWrapper {
    /// Create a wrapper bound to `root`.
    pub fn new(root: &RootKey) -> Self {
        Self {
            wrapping_key: root.derive_wrapping_key(),
            fingerprint: root.fingerprint(),
        }
    }

    /// Fingerprint of the root key this wrapper is bound to.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Wrap arbitrary key material.
    pub fn wrap(&self, raw: &[u8]) -> Result<WrappedToken> {
        let aad = token_aad(TOKEN_VERSION);
        let sealed = encrypt_with_aad(raw, &aad, &self.wrapping_key)?;

        let mut token = Vec::with_capacity(1 + sealed.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&sealed);
        Ok(WrappedToken(token))
    }

    /// Unwrap a token produced by [`KeyWrapper::wrap`].
    ///
    /// # Errors
    /// - `Error::WrongRootKey` for any authentication failure, including an
    ///   unknown version byte or a truncated token
    pub fn unwrap(&self, token: &WrappedToken) -> Result<SensitiveBytes> {
        let Some((&version, sealed)) = token.0.split_first() else {
            return Err(Error::WrongRootKey);
        };
        if version != TOKEN_VERSION {
            warn!(root = %self.fingerprint, "Token failed authentication");
            return Err(Error::WrongRootKey);
        }

        decrypt_with_aad(sealed, &token_aad(version), &self.wrapping_key)
            .map(SensitiveBytes::new)
            .map_err(|_| {
                warn!(root = %self.fingerprint, "Token failed authentication");
                Error::WrongRootKey
            })
    }

    /// Wrap a data key.
    pub fn wrap_key(&self, key: &DataKey) -> Result<WrappedToken> {
        self.wrap(key.as_bytes())
    }

    /// Unwrap a token that must contain a data key.
    pub fn unwrap_key(&self, token: &WrappedToken) -> Result<DataKey> {
        let raw = self.unwrap(token)?;
        DataKey::from_slice(raw.as_bytes()).map_err(|_| Error::WrongRootKey)
    }
}

impl fmt::Debug for KeyWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyWrapper")
            .field("root", &self.fingerprint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let wrapper = KeyWrapper::new(&RootKey::generate());
        let key = DataKey::generate();

        let token = wrapper.wrap_key(&key).unwrap();
        let restored = wrapper.unwrap_key(&token).unwrap();

        assert_eq!(restored, key);
    }

    #[test]
    fn test_wrong_root_key() {
        let wrapper_a = KeyWrapper::new(&RootKey::from_bytes([1u8; KEY_LENGTH]));
        let wrapper_b = KeyWrapper::new(&RootKey::from_bytes([2u8; KEY_LENGTH]));

        let token = wrapper_a.wrap(b"share bytes").unwrap();

        assert!(matches!(wrapper_b.unwrap(&token), Err(Error::WrongRootKey)));
    }

    #[test]
    fn test_tampered_token_same_error() {
        let wrapper = KeyWrapper::new(&RootKey::generate());
        let token = wrapper.wrap_key(&DataKey::generate()).unwrap();

        for idx in [0, 1, token.len() / 2, token.len() - 1] {
            let mut bytes = token.as_bytes().to_vec();
            bytes[idx] ^= 0x01;
            let tampered = WrappedToken::from_bytes(bytes);
            assert!(matches!(wrapper.unwrap(&tampered), Err(Error::WrongRootKey)));
        }

        let empty = WrappedToken::from_bytes(Vec::new());
        assert!(matches!(wrapper.unwrap(&empty), Err(Error::WrongRootKey)));
    }

    #[test]
    fn test_token_text_roundtrip() {
        let wrapper = KeyWrapper::new(&RootKey::generate());
        let token = wrapper.wrap(b"abc").unwrap();

        let text = token.to_text();
        assert!(!text.contains('+') && !text.contains('/'));

        let parsed = WrappedToken::from_text(&text).unwrap();
        assert_eq!(parsed, token);
        assert_eq!(wrapper.unwrap(&parsed).unwrap().as_bytes(), b"abc");
    }

    #[test]
    fn test_tokens_are_randomized() {
        let wrapper = KeyWrapper::new(&RootKey::generate());
        let key = DataKey::generate();

        let t1 = wrapper.wrap_key(&key).unwrap();
        let t2 = wrapper.wrap_key(&key).unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_unwrap_key_rejects_non_key_payload() {
        let wrapper = KeyWrapper::new(&RootKey::generate());
        let token = wrapper.wrap(b"too short").unwrap();

        assert!(matches!(wrapper.unwrap_key(&token), Err(Error::WrongRootKey)));
    }
}
