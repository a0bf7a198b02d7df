//! Cryptographic primitives for MediaGuard.
//!
//! This module provides:
//! - Authenticated payload encryption using ChaCha20-Poly1305
//! - Envelope wrapping of per-resource keys under a root key
//! - Threshold secret sharing over GF(257)
//! - Root key derivation from a passphrase using Argon2id
//! - Chunked encryption for large media payloads
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Every tamper class collapses into one error per primitive

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod shamir;
pub mod stream;
pub mod wrap;

pub use aead::{decrypt, encrypt, generate_key};
pub use kdf::{derive_root_key, KdfParams};
pub use keys::{DataKey, RootKey, Salt, KEY_LENGTH};
pub use shamir::{reconstruct, split, Share};
pub use stream::{DecryptingStream, EncryptingStream};
pub use wrap::{KeyWrapper, WrappedToken};
