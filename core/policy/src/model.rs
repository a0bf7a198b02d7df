//! Policy model: kinds, requests, decisions and audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::registry::RuleRegistry;
use mediaguard_common::{Error, PolicyId, ResourceId, Result, Role, UserId};

/// Outcome of a custom rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerdict {
    Allow,
    Deny,
    /// The rule has no opinion; evaluation continues.
    Abstain,
}

/// Injectable evaluator carried by [`PolicyKind::Custom`].
pub trait CustomRule: Send + Sync {
    /// Registry name used to rebuild the rule from storage.
    fn name(&self) -> &str;

    /// Parameters the rule was built from.
    fn config(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Decide on a request.
    fn evaluate(&self, request: &AccessRequest, now: DateTime<Utc>) -> RuleVerdict;
}

/// Kind-specific policy payload.
#[derive(Clone)]
pub enum PolicyKind {
    OwnerOnly,
    AdminOverride,
    Shared {
        user_ids: BTreeSet<UserId>,
    },
    /// Access window; an unexpired window grants the listed users.
    TimeLimited {
        expires_at: DateTime<Utc>,
        user_ids: BTreeSet<UserId>,
    },
    /// Requires `threshold` approvals. An empty approver set accepts any approver.
    MultiParty {
        threshold: usize,
        approver_ids: BTreeSet<UserId>,
    },
    Custom(Arc<dyn CustomRule>),
}

impl PolicyKind {
    /// A sharing grant for `users`.
    pub fn shared(users: impl IntoIterator<Item = UserId>) -> Self {
        PolicyKind::Shared {
            user_ids: users.into_iter().collect(),
        }
    }

    /// A time-limited grant for `users`, valid until `expires_at`.
    pub fn time_limited(expires_at: DateTime<Utc>, users: impl IntoIterator<Item = UserId>) -> Self {
        PolicyKind::TimeLimited {
            expires_at,
            user_ids: users.into_iter().collect(),
        }
    }

    /// A multi-party approval requirement.
    ///
    /// # Errors
    /// - `Error::Validation` if `threshold` is zero or exceeds a non-empty approver set
    pub fn multi_party(
        threshold: usize,
        approvers: impl IntoIterator<Item = UserId>,
    ) -> Result<Self> {
        let approver_ids: BTreeSet<UserId> = approvers.into_iter().collect();
        if threshold == 0 {
            return Err(Error::Validation(
                "Multi-party threshold must be at least 1".to_string(),
            ));
        }
        if !approver_ids.is_empty() && threshold > approver_ids.len() {
            return Err(Error::Validation(format!(
                "Multi-party threshold {} exceeds {} approvers",
                threshold,
                approver_ids.len()
            )));
        }
        Ok(PolicyKind::MultiParty {
            threshold,
            approver_ids,
        })
    }

    /// Wrap a custom rule.
    pub fn custom(rule: Arc<dyn CustomRule>) -> Self {
        PolicyKind::Custom(rule)
    }

    /// Short name of the kind, used in logs and storage.
    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::OwnerOnly => "owner_only",
            PolicyKind::AdminOverride => "admin_override",
            PolicyKind::Shared { .. } => "shared",
            PolicyKind::TimeLimited { .. } => "time_limited",
            PolicyKind::MultiParty { .. } => "multi_party",
            PolicyKind::Custom(_) => "custom",
        }
    }

    /// Serializable description of this kind.
    pub fn to_spec(&self) -> PolicySpec {
        match self {
            PolicyKind::OwnerOnly => PolicySpec::OwnerOnly,
            PolicyKind::AdminOverride => PolicySpec::AdminOverride,
            PolicyKind::Shared { user_ids } => PolicySpec::Shared {
                user_ids: user_ids.clone(),
            },
            PolicyKind::TimeLimited {
                expires_at,
                user_ids,
            } => PolicySpec::TimeLimited {
                expires_at: *expires_at,
                user_ids: user_ids.clone(),
            },
            PolicyKind::MultiParty {
                threshold,
                approver_ids,
            } => PolicySpec::MultiParty {
                threshold: *threshold,
                approver_ids: approver_ids.clone(),
            },
            PolicyKind::Custom(rule) => PolicySpec::Custom {
                rule: rule.name().to_string(),
                config: rule.config(),
            },
        }
    }

    /// Rebuild a kind from its description, resolving custom rules by name.
    pub fn from_spec(spec: PolicySpec, registry: &RuleRegistry) -> Result<Self> {
        match spec {
            PolicySpec::OwnerOnly => Ok(PolicyKind::OwnerOnly),
            PolicySpec::AdminOverride => Ok(PolicyKind::AdminOverride),
            PolicySpec::Shared { user_ids } => Ok(PolicyKind::Shared { user_ids }),
            PolicySpec::TimeLimited {
                expires_at,
                user_ids,
            } => Ok(PolicyKind::TimeLimited {
                expires_at,
                user_ids,
            }),
            PolicySpec::MultiParty {
                threshold,
                approver_ids,
            } => PolicyKind::multi_party(threshold, approver_ids),
            PolicySpec::Custom { rule, config } => {
                Ok(PolicyKind::Custom(registry.build(&rule, &config)?))
            }
        }
    }
}

impl fmt::Debug for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Custom(rule) => f.debug_tuple("Custom").field(&rule.name()).finish(),
            other => write!(f, "{:?}", other.to_spec()),
        }
    }
}

/// Serializable mirror of [`PolicyKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySpec {
    OwnerOnly,
    AdminOverride,
    Shared {
        user_ids: BTreeSet<UserId>,
    },
    TimeLimited {
        expires_at: DateTime<Utc>,
        #[serde(default)]
        user_ids: BTreeSet<UserId>,
    },
    MultiParty {
        threshold: usize,
        #[serde(default)]
        approver_ids: BTreeSet<UserId>,
    },
    Custom {
        rule: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

/// An access rule attached to one resource.
#[derive(Debug, Clone)]
pub struct Policy {
    pub id: PolicyId,
    pub resource_id: ResourceId,
    pub kind: PolicyKind,
    /// Higher priorities are considered first within a step.
    pub priority: i32,
    pub enabled: bool,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Policy {
    /// An enabled policy with default priority, created now.
    pub fn new(resource_id: ResourceId, kind: PolicyKind) -> Self {
        Self {
            id: PolicyId::new(),
            resource_id,
            kind,
            priority: 0,
            enabled: true,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_creator(mut self, user: UserId) -> Self {
        self.created_by = Some(user);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Persisted form.
    pub fn to_record(&self) -> PolicyRecord {
        PolicyRecord {
            id: self.id,
            resource_id: self.resource_id,
            spec: self.kind.to_spec(),
            priority: self.priority,
            enabled: self.enabled,
            created_by: self.created_by,
            created_at: self.created_at,
        }
    }

    /// Rebuild from the persisted form.
    ///
    /// # Errors
    /// - `Error::NotFound` if a custom rule name is not registered
    /// - `Error::Validation` if the payload is inconsistent
    pub fn from_record(record: PolicyRecord, registry: &RuleRegistry) -> Result<Self> {
        Ok(Self {
            id: record.id,
            resource_id: record.resource_id,
            kind: PolicyKind::from_spec(record.spec, registry)?,
            priority: record.priority,
            enabled: record.enabled,
            created_by: record.created_by,
            created_at: record.created_at,
        })
    }
}

/// Persisted form of a [`Policy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: PolicyId,
    pub resource_id: ResourceId,
    pub spec: PolicySpec,
    pub priority: i32,
    pub enabled: bool,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl PolicyRecord {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// A request to access a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub resource_id: ResourceId,
    pub requester_id: UserId,
    pub role: Role,
    pub owner_id: UserId,
    /// Users who have approved this request, for multi-party policies.
    pub approvals: BTreeSet<UserId>,
}

impl AccessRequest {
    pub fn new(resource_id: ResourceId, requester_id: UserId, role: Role, owner_id: UserId) -> Self {
        Self {
            resource_id,
            requester_id,
            role,
            owner_id,
            approvals: BTreeSet::new(),
        }
    }

    pub fn with_approvals(mut self, approvers: impl IntoIterator<Item = UserId>) -> Self {
        self.approvals.extend(approvers);
        self
    }
}

/// Result of an access evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Allow,
    Deny,
    /// Access needs this many more approvals.
    RequireShares(usize),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::Deny => write!(f, "deny"),
            Decision::RequireShares(missing) => write!(f, "require_shares:{}", missing),
        }
    }
}

impl FromStr for Decision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(Decision::Allow),
            "deny" => Ok(Decision::Deny),
            other => other
                .strip_prefix("require_shares:")
                .and_then(|n| n.parse().ok())
                .map(Decision::RequireShares)
                .ok_or_else(|| Error::Validation(format!("Unknown decision: {}", other))),
        }
    }
}

/// A decision with the reason and the policy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub reason: String,
    pub policy_id: Option<PolicyId>,
}

impl Evaluation {
    pub(crate) fn new(decision: Decision, reason: impl Into<String>, policy_id: Option<PolicyId>) -> Self {
        Self {
            decision,
            reason: reason.into(),
            policy_id,
        }
    }
}

/// Immutable audit record of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLogEntry {
    pub requester_id: UserId,
    pub resource_id: ResourceId,
    pub policy_id: Option<PolicyId>,
    pub decision: Decision,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl PolicyLogEntry {
    pub fn from_evaluation(request: &AccessRequest, evaluation: &Evaluation, at: DateTime<Utc>) -> Self {
        Self {
            requester_id: request.requester_id,
            resource_id: request.resource_id,
            policy_id: evaluation.policy_id,
            decision: evaluation.decision,
            reason: evaluation.reason.clone(),
            timestamp: at,
        }
    }
}
