//! Root key derivation from an operator passphrase using Argon2id.
//!
//! Deployments that cannot inject raw key material can instead configure a
//! passphrase and salt; the derived key is used exactly like a raw root key.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::keys::{RootKey, Salt, KEY_LENGTH};
use mediaguard_common::{Error, Result};

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Parameters for a service that derives the root key once at startup.
    pub fn interactive() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Higher cost for long-lived production root keys.
    pub fn sensitive() -> Self {
        Self {
            memory_cost: 262144, // 256 MiB
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Cheap parameters for tests and constrained hosts.
    pub fn moderate() -> Self {
        Self {
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive a root key from a passphrase and salt.
///
/// # Errors
/// - `Error::Validation` if the passphrase is empty
/// - `Error::Config` if the Argon2id parameters are rejected
pub fn derive_root_key(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> Result<RootKey> {
    if passphrase.is_empty() {
        return Err(Error::Validation("Passphrase cannot be empty".to_string()));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::Config(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    let outcome = argon2
        .hash_password_into(passphrase, salt.as_bytes(), &mut key_bytes)
        .map_err(|e| Error::Config(format!("Key derivation failed: {}", e)));

    let root = outcome.map(|_| RootKey::from_bytes(key_bytes));
    key_bytes.zeroize();
    root
}
