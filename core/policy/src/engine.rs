//! Access decision engine.
//!
//! Evaluation is an ordered short-circuit chain over the enabled policies of
//! the requested resource:
//!
//! 1. admin role allows
//! 2. ownership allows
//! 3. an expired time-limited window denies (scope set by [`ExpiredScope`])
//! 4. a shared grant, or an unexpired time-limited grant, listing the requester allows
//! 5. custom rules, first non-abstaining verdict wins
//! 6. a multi-party policy requires its outstanding approvals
//! 7. otherwise deny
//!
//! Within a step policies are considered by descending priority, then
//! creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audit::AuditSink;
use crate::model::{
    AccessRequest, Decision, Evaluation, Policy, PolicyKind, PolicyLogEntry, RuleVerdict,
};
use mediaguard_common::{PolicyId, Result, Role};

/// How far an expired time-limited window reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredScope {
    /// Any expired window denies the whole resource, before other grants are consulted.
    #[default]
    Resource,
    /// An expired window only stops granting; other grants still apply.
    PolicyOnly,
}

/// Engine configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub expired_scope: ExpiredScope,
}

/// Evaluates access requests and audits every decision.
pub struct PolicyEngine {
    config: EngineConfig,
    audit: Arc<dyn AuditSink>,
}

fn first_matching(
    policies: &[&Policy],
    pred: impl Fn(&PolicyKind) -> bool,
) -> Option<PolicyId> {
    policies.iter().find(|p| pred(&p.kind)).map(|p| p.id)
}

impl PolicyEngine {
    /// Create an engine with the default configuration.
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self::with_config(EngineConfig::default(), audit)
    }

    pub fn with_config(config: EngineConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self { config, audit }
    }

    /// Evaluate a request and record exactly one audit entry.
    ///
    /// # Errors
    /// - Propagates audit sink failures; no decision is returned unaudited
    pub fn evaluate(
        &self,
        request: &AccessRequest,
        policies: &[Policy],
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let evaluation = self.decide(request, policies, now);

        let entry = PolicyLogEntry::from_evaluation(request, &evaluation, now);
        self.audit.record(&entry)?;

        if evaluation.decision.is_allow() {
            debug!(
                resource = %request.resource_id,
                requester = %request.requester_id,
                reason = %evaluation.reason,
                "Access allowed"
            );
        } else {
            warn!(
                resource = %request.resource_id,
                requester = %request.requester_id,
                decision = %evaluation.decision,
                reason = %evaluation.reason,
                "Access not granted"
            );
        }
        Ok(evaluation)
    }

    /// Compute the decision without auditing it.
    pub fn decide(
        &self,
        request: &AccessRequest,
        policies: &[Policy],
        now: DateTime<Utc>,
    ) -> Evaluation {
        let mut applicable: Vec<&Policy> = policies
            .iter()
            .filter(|p| p.enabled && p.resource_id == request.resource_id)
            .collect();
        applicable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        if request.role == Role::Admin {
            let id = first_matching(&applicable, |k| matches!(k, PolicyKind::AdminOverride));
            return Evaluation::new(Decision::Allow, "admin override", id);
        }

        if request.requester_id == request.owner_id {
            let id = first_matching(&applicable, |k| matches!(k, PolicyKind::OwnerOnly));
            return Evaluation::new(Decision::Allow, "ownership", id);
        }

        if self.config.expired_scope == ExpiredScope::Resource {
            let expired = first_matching(&applicable, |k| {
                matches!(k, PolicyKind::TimeLimited { expires_at, .. } if now > *expires_at)
            });
            if expired.is_some() {
                return Evaluation::new(Decision::Deny, "access window expired", expired);
            }
        }

        for policy in &applicable {
            match &policy.kind {
                PolicyKind::Shared { user_ids } if user_ids.contains(&request.requester_id) => {
                    return Evaluation::new(Decision::Allow, "shared grant", Some(policy.id));
                }
                PolicyKind::TimeLimited {
                    expires_at,
                    user_ids,
                } if now <= *expires_at && user_ids.contains(&request.requester_id) => {
                    return Evaluation::new(
                        Decision::Allow,
                        "time-limited grant",
                        Some(policy.id),
                    );
                }
                _ => {}
            }
        }

        for policy in &applicable {
            if let PolicyKind::Custom(rule) = &policy.kind {
                match rule.evaluate(request, now) {
                    RuleVerdict::Allow => {
                        return Evaluation::new(
                            Decision::Allow,
                            format!("custom rule '{}' allowed", rule.name()),
                            Some(policy.id),
                        );
                    }
                    RuleVerdict::Deny => {
                        return Evaluation::new(
                            Decision::Deny,
                            format!("custom rule '{}' denied", rule.name()),
                            Some(policy.id),
                        );
                    }
                    RuleVerdict::Abstain => {}
                }
            }
        }

        let multi_party = applicable.iter().find_map(|p| match &p.kind {
            PolicyKind::MultiParty {
                threshold,
                approver_ids,
            } => Some((p.id, *threshold, approver_ids)),
            _ => None,
        });
        if let Some((id, threshold, approver_ids)) = multi_party {
            let approvals = request
                .approvals
                .iter()
                .filter(|u| approver_ids.is_empty() || approver_ids.contains(*u))
                .count();
            let reason = format!("multi-party: {} of {} approvals", approvals, threshold);
            return if approvals < threshold {
                Evaluation::new(Decision::RequireShares(threshold - approvals), reason, Some(id))
            } else {
                Evaluation::new(Decision::Allow, reason, Some(id))
            };
        }

        Evaluation::new(Decision::Deny, "default deny", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::registry::{AllowUsers, DenyUsers};
    use chrono::Duration;
    use mediaguard_common::{Error, ResourceId, UserId};
    use proptest::prelude::*;

    const RESOURCE: ResourceId = ResourceId(10);
    const OWNER: UserId = UserId(3);

    fn engine() -> (PolicyEngine, Arc<MemoryAuditLog>) {
        let log = Arc::new(MemoryAuditLog::new());
        (PolicyEngine::new(log.clone()), log)
    }

    fn user(requester: u64) -> AccessRequest {
        AccessRequest::new(RESOURCE, UserId(requester), Role::User, OWNER)
    }

    fn policy(kind: PolicyKind) -> Policy {
        Policy::new(RESOURCE, kind)
    }

    #[test]
    fn test_owner_only() {
        let (engine, _) = engine();
        let policies = vec![policy(PolicyKind::OwnerOnly)];
        let now = Utc::now();

        let stranger = engine.evaluate(&user(7), &policies, now).unwrap();
        assert_eq!(stranger.decision, Decision::Deny);
        assert_eq!(stranger.reason, "default deny");

        let owner = engine.evaluate(&user(3), &policies, now).unwrap();
        assert_eq!(owner.decision, Decision::Allow);
        assert_eq!(owner.policy_id, Some(policies[0].id));
    }

    #[test]
    fn test_admin_override() {
        let (engine, _) = engine();
        let request = AccessRequest::new(RESOURCE, UserId(8), Role::Admin, OWNER);
        let expired = policy(PolicyKind::time_limited(
            Utc::now() - Duration::days(1),
            [UserId(8)],
        ));

        let evaluation = engine.evaluate(&request, &[expired], Utc::now()).unwrap();
        assert_eq!(evaluation.decision, Decision::Allow);
        assert_eq!(evaluation.reason, "admin override");
    }

    #[test]
    fn test_multi_party_threshold() {
        let (engine, _) = engine();
        let policies = vec![policy(PolicyKind::multi_party(2, []).unwrap())];
        let now = Utc::now();

        let one = user(7).with_approvals([UserId(20)]);
        assert_eq!(
            engine.evaluate(&one, &policies, now).unwrap().decision,
            Decision::RequireShares(1)
        );

        let two = user(7).with_approvals([UserId(20), UserId(21)]);
        assert_eq!(
            engine.evaluate(&two, &policies, now).unwrap().decision,
            Decision::Allow
        );
    }

    #[test]
    fn test_multi_party_counts_only_listed_approvers() {
        let (engine, _) = engine();
        let policies = vec![policy(
            PolicyKind::multi_party(2, [UserId(20), UserId(21), UserId(22)]).unwrap(),
        )];
        let request = user(7).with_approvals([UserId(20), UserId(99)]);

        let evaluation = engine.evaluate(&request, &policies, Utc::now()).unwrap();
        assert_eq!(evaluation.decision, Decision::RequireShares(1));
    }

    #[test]
    fn test_expired_window_denies_whole_resource() {
        let (engine, _) = engine();
        let now = Utc::now();
        let expired = policy(PolicyKind::time_limited(now - Duration::hours(1), [UserId(9)]));
        let shared = policy(PolicyKind::shared([UserId(5)]));
        let policies = vec![expired.clone(), shared];

        let evaluation = engine.evaluate(&user(5), &policies, now).unwrap();
        assert_eq!(evaluation.decision, Decision::Deny);
        assert_eq!(evaluation.policy_id, Some(expired.id));
    }

    #[test]
    fn test_expired_window_policy_only_scope() {
        let log = Arc::new(MemoryAuditLog::new());
        let engine = PolicyEngine::with_config(
            EngineConfig {
                expired_scope: ExpiredScope::PolicyOnly,
            },
            log,
        );
        let now = Utc::now();
        let policies = vec![
            policy(PolicyKind::time_limited(now - Duration::hours(1), [UserId(5), UserId(6)])),
            policy(PolicyKind::shared([UserId(5)])),
        ];

        assert_eq!(
            engine.evaluate(&user(5), &policies, now).unwrap().decision,
            Decision::Allow
        );
        assert_eq!(
            engine.evaluate(&user(6), &policies, now).unwrap().decision,
            Decision::Deny
        );
    }

    #[test]
    fn test_unexpired_window_grants() {
        let (engine, _) = engine();
        let now = Utc::now();
        let policies = vec![policy(PolicyKind::time_limited(
            now + Duration::hours(1),
            [UserId(5)],
        ))];

        let evaluation = engine.evaluate(&user(5), &policies, now).unwrap();
        assert_eq!(evaluation.decision, Decision::Allow);
        assert_eq!(evaluation.reason, "time-limited grant");
        assert_eq!(
            engine.evaluate(&user(6), &policies, now).unwrap().decision,
            Decision::Deny
        );
    }

    #[test]
    fn test_disabled_and_foreign_policies_ignored() {
        let (engine, _) = engine();
        let mut disabled = policy(PolicyKind::shared([UserId(5)]));
        disabled.enabled = false;
        let foreign = Policy::new(ResourceId(11), PolicyKind::shared([UserId(5)]));

        let evaluation = engine
            .evaluate(&user(5), &[disabled, foreign], Utc::now())
            .unwrap();
        assert_eq!(evaluation.decision, Decision::Deny);
    }

    #[test]
    fn test_custom_rules_by_priority() {
        let (engine, _) = engine();
        let allow = policy(PolicyKind::custom(Arc::new(AllowUsers::new([UserId(5)]))));
        let deny = policy(PolicyKind::custom(Arc::new(DenyUsers::new([UserId(5)])))).with_priority(10);
        let policies = vec![allow.clone(), deny.clone()];

        let evaluation = engine.evaluate(&user(5), &policies, Utc::now()).unwrap();
        assert_eq!(evaluation.decision, Decision::Deny);
        assert_eq!(evaluation.policy_id, Some(deny.id));

        let abstained = engine.evaluate(&user(6), &policies, Utc::now()).unwrap();
        assert_eq!(abstained.decision, Decision::Deny);
        assert_eq!(abstained.reason, "default deny");
    }

    #[test]
    fn test_shared_grant_before_custom_deny() {
        let (engine, _) = engine();
        let policies = vec![
            policy(PolicyKind::custom(Arc::new(DenyUsers::new([UserId(5)])))).with_priority(100),
            policy(PolicyKind::shared([UserId(5)])),
        ];

        let evaluation = engine.evaluate(&user(5), &policies, Utc::now()).unwrap();
        assert_eq!(evaluation.decision, Decision::Allow);
    }

    #[test]
    fn test_priority_then_creation_order() {
        let (engine, _) = engine();
        let now = Utc::now();
        let older = policy(PolicyKind::shared([UserId(5)])).with_created_at(now - Duration::minutes(5));
        let newer = policy(PolicyKind::shared([UserId(5)]));
        let high = policy(PolicyKind::shared([UserId(5)])).with_priority(1);

        let evaluation = engine
            .evaluate(&user(5), &[newer.clone(), older.clone()], now)
            .unwrap();
        assert_eq!(evaluation.policy_id, Some(older.id));

        let evaluation = engine.evaluate(&user(5), &[older, newer, high.clone()], now).unwrap();
        assert_eq!(evaluation.policy_id, Some(high.id));
    }

    #[test]
    fn test_every_call_audited_once() {
        let (engine, log) = engine();
        let policies = vec![policy(PolicyKind::shared([UserId(5)]))];
        let now = Utc::now();

        engine.evaluate(&user(5), &policies, now).unwrap();
        engine.evaluate(&user(6), &policies, now).unwrap();
        engine.evaluate(&user(3), &policies, now).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].decision, Decision::Allow);
        assert_eq!(entries[0].policy_id, Some(policies[0].id));
        assert_eq!(entries[1].decision, Decision::Deny);
        assert_eq!(entries[1].policy_id, None);
        assert_eq!(entries[2].reason, "ownership");
        assert!(entries.iter().all(|e| e.timestamp == now));
    }

    #[test]
    fn test_decide_does_not_audit() {
        let (engine, log) = engine();
        engine.decide(&user(5), &[], Utc::now());
        assert!(log.is_empty());
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn record(&self, _entry: &PolicyLogEntry) -> Result<()> {
            Err(Error::Storage("sink down".to_string()))
        }
    }

    #[test]
    fn test_audit_failure_fails_closed() {
        let engine = PolicyEngine::new(Arc::new(FailingSink));
        let result = engine.evaluate(&user(3), &[], Utc::now());
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    proptest! {
        #[test]
        fn prop_no_policies_only_admin_or_owner(requester in 0u64..20, owner in 0u64..20, admin in any::<bool>()) {
            let (engine, _) = engine();
            let role = if admin { Role::Admin } else { Role::User };
            let request = AccessRequest::new(RESOURCE, UserId(requester), role, UserId(owner));

            let decision = engine.decide(&request, &[], Utc::now()).decision;
            let expected = if admin || requester == owner { Decision::Allow } else { Decision::Deny };
            prop_assert_eq!(decision, expected);
        }
    }
}
