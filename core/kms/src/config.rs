//! Key-management configuration.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use mediaguard_common::{Error, Result};
use mediaguard_crypto::shamir;
use mediaguard_crypto::{derive_root_key, KdfParams, RootKey, Salt};

/// Environment variable that overrides the configured root key (base64).
pub const ROOT_KEY_ENV: &str = "MEDIAGUARD_ROOT_KEY";

/// Default database file name.
pub const DEFAULT_DATABASE: &str = "mediaguard.db";

/// Threshold split parameters: any `threshold` of `total` shares reconstruct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitParams {
    pub total: usize,
    pub threshold: usize,
}

impl SplitParams {
    pub fn new(total: usize, threshold: usize) -> Self {
        Self { total, threshold }
    }

    /// # Errors
    /// - `Error::Validation` unless `2 <= threshold <= total <= 255`
    pub fn validate(&self) -> Result<()> {
        shamir::validate_params(self.total, self.threshold)
    }
}

/// Where the root key comes from.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RootKeySource {
    /// Key material inline, standard base64.
    Raw { key_b64: String },
    /// Argon2id over a passphrase read from `passphrase_env`.
    Passphrase {
        salt_b64: String,
        #[serde(default)]
        kdf: KdfParams,
        passphrase_env: String,
    },
    /// Key material in an environment variable, standard base64.
    Env { var: String },
}

impl RootKeySource {
    /// Produce the root key.
    ///
    /// # Errors
    /// - `Error::Config` if the variable is unset or the material is malformed
    pub fn resolve(&self) -> Result<RootKey> {
        match self {
            RootKeySource::Raw { key_b64 } => RootKey::from_base64(key_b64),
            RootKeySource::Env { var } => RootKey::from_base64(&read_env(var)?),
            RootKeySource::Passphrase {
                salt_b64,
                kdf,
                passphrase_env,
            } => {
                let salt = decode_salt(salt_b64)?;
                let passphrase = read_env(passphrase_env)?;
                derive_root_key(passphrase.as_bytes(), &salt, kdf)
            }
        }
    }

    /// A passphrase source with a fresh random salt.
    pub fn new_passphrase(passphrase_env: impl Into<String>, kdf: KdfParams) -> Self {
        RootKeySource::Passphrase {
            salt_b64: STANDARD.encode(Salt::generate().as_bytes()),
            kdf,
            passphrase_env: passphrase_env.into(),
        }
    }
}

impl fmt::Debug for RootKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootKeySource::Raw { .. } => f.write_str("Raw([REDACTED])"),
            RootKeySource::Passphrase { passphrase_env, .. } => f
                .debug_struct("Passphrase")
                .field("passphrase_env", passphrase_env)
                .finish_non_exhaustive(),
            RootKeySource::Env { var } => f.debug_struct("Env").field("var", var).finish(),
        }
    }
}

fn read_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| Error::Config(format!("Environment variable {} is not set", var)))
}

fn decode_salt(salt_b64: &str) -> Result<Salt> {
    let bytes = STANDARD
        .decode(salt_b64.trim())
        .map_err(|e| Error::Config(format!("Salt is not valid base64: {}", e)))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map(Salt::from_bytes)
        .map_err(|_| Error::Config(format!("Salt must be 32 bytes, got {}", bytes.len())))
}

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE)
}

/// Key-management configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmsConfig {
    pub root_key: RootKeySource,
    /// Fingerprint the resolved root key must match, if set.
    #[serde(default)]
    pub root_fingerprint: Option<String>,
    /// Split applied when a caller does not choose one.
    #[serde(default)]
    pub default_split: Option<SplitParams>,
    #[serde(default = "default_database")]
    pub database_path: PathBuf,
}

impl KmsConfig {
    pub fn new(root_key: RootKeySource) -> Self {
        Self {
            root_key,
            root_fingerprint: None,
            default_split: None,
            database_path: default_database(),
        }
    }

    /// Use [`ROOT_KEY_ENV`] as the root key source when it is set.
    pub fn from_env_or(fallback: KmsConfig) -> Self {
        if std::env::var_os(ROOT_KEY_ENV).is_some() {
            Self {
                root_key: RootKeySource::Env {
                    var: ROOT_KEY_ENV.to_string(),
                },
                ..fallback
            }
        } else {
            fallback
        }
    }

    /// Resolve the root key and check it against the pinned fingerprint.
    ///
    /// # Errors
    /// - `Error::Config` if resolution fails or the fingerprint differs
    pub fn resolve_root_key(&self) -> Result<RootKey> {
        let key = self.root_key.resolve()?;
        if let Some(expected) = &self.root_fingerprint {
            if key.fingerprint() != *expected {
                return Err(Error::Config(format!(
                    "Root key fingerprint {} does not match configured {}",
                    key.fingerprint(),
                    expected
                )));
            }
        }
        Ok(key)
    }

    /// Check the split default.
    pub fn validate(&self) -> Result<()> {
        if let Some(split) = self.default_split {
            split
                .validate()
                .map_err(|e| Error::Config(format!("default_split: {}", e)))?;
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::from_json(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
