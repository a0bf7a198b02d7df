//! Error taxonomy for MediaGuard operations.

use thiserror::Error;

/// Top-level error type for MediaGuard operations.
///
/// Cryptographic failures are deliberately coarse: every tamper class on a
/// payload collapses into [`Error::Integrity`], and every token failure into
/// [`Error::WrongRootKey`].
#[derive(Debug, Error)]
pub enum Error {
    /// Bad parameters or malformed input, rejected before any crypto runs.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication tag verification failed on a payload.
    #[error("Integrity check failed")]
    Integrity,

    /// A wrapped-key token failed authentication under the supplied root key.
    #[error("Wrapped key could not be authenticated under this root key")]
    WrongRootKey,

    /// Fewer distinct shares than the reconstruction threshold.
    #[error("Insufficient shares: {provided} of {required} required")]
    InsufficientShares { required: usize, provided: usize },

    /// The key for this resource has been revoked.
    #[error("Key revoked for resource {0}")]
    Revoked(String),

    /// Access was refused by policy.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// Persistence collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be loaded or resolved.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
