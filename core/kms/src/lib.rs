//! Key management for MediaGuard resources.
//!
//! [`KeyStore`] owns the lifecycle of each resource's data key:
//! `none -> active -> revoked`, with rotation replacing one active record by
//! another in a single repository commit. Keys are stored wrapped under the
//! root key, optionally split into threshold shares that are wrapped again.

pub mod config;
pub mod keystore;
pub mod records;
pub mod repository;

pub use config::{KmsConfig, RootKeySource, SplitParams, ROOT_KEY_ENV};
pub use keystore::KeyStore;
pub use records::{KeyInfo, KeyRecord, KeyShare, KeyStatus, ShareInfo};
pub use repository::{KeyRepository, MemoryKeyRepository};
