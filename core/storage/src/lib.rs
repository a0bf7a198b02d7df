//! SQLite persistence for MediaGuard.
//!
//! [`SqliteStore`] implements the key repository, the policy repository and
//! the audit sink over a single database file, so one store can back both
//! the key store and the policy engine.
//!
//! # Design Principles
//! - Multi-row changes (record plus shares, rotation) run in one transaction
//! - At most one active key record per resource is enforced by the schema
//! - The audit table is append-only

pub mod sqlite;

pub use sqlite::SqliteStore;
