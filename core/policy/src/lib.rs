//! Access policy decisions for MediaGuard resources.
//!
//! This crate provides:
//! - A closed policy model with one typed payload per policy kind
//! - A deterministic, short-circuit decision engine that audits every call
//! - A registry of named custom rules so persisted custom policies can be rebuilt
//! - Sharing and policy-management operations over a pluggable repository

pub mod audit;
pub mod engine;
pub mod model;
pub mod registry;
pub mod repository;
pub mod sharing;

pub use audit::{AuditSink, MemoryAuditLog};
pub use engine::{EngineConfig, ExpiredScope, PolicyEngine};
pub use model::{
    AccessRequest, CustomRule, Decision, Evaluation, Policy, PolicyKind, PolicyLogEntry,
    PolicyRecord, PolicySpec, RuleVerdict,
};
pub use registry::{create_default_registry, RuleRegistry};
pub use repository::{MemoryPolicyStore, PolicyRepository};
pub use sharing::PolicyManager;
