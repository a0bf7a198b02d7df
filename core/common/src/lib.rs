//! Common types shared across the MediaGuard key-management core.
//!
//! This crate holds the error taxonomy every other crate reports through,
//! the identifier newtypes that keep resource, user and record ids from
//! being mixed up at call sites, and the per-resource lock table.

pub mod error;
pub mod locks;
pub mod types;

pub use error::{Error, Result};
pub use locks::ResourceLocks;
pub use types::{PolicyId, RecordId, ResourceId, Role, SensitiveBytes, UserId};
