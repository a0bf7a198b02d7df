//! Policy management and sharing operations.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{Policy, PolicyKind};
use crate::repository::PolicyRepository;
use mediaguard_common::{Error, PolicyId, ResourceId, ResourceLocks, Result, UserId};

/// Creates, toggles and removes policies, and manages sharing grants.
///
/// Sharing does not check that `shared_by` owns the resource; that is the
/// caller's decision.
pub struct PolicyManager {
    repo: Arc<dyn PolicyRepository>,
    locks: ResourceLocks,
}

impl PolicyManager {
    pub fn new(repo: Arc<dyn PolicyRepository>) -> Self {
        Self {
            repo,
            locks: ResourceLocks::new(),
        }
    }

    /// Attach a policy to its resource.
    pub fn create_policy(&self, policy: Policy) -> Result<Policy> {
        self.locks
            .with_lock(policy.resource_id, || self.repo.insert(&policy))?;
        info!(
            resource = %policy.resource_id,
            policy = %policy.id,
            kind = policy.kind.name(),
            "Policy created"
        );
        Ok(policy)
    }

    /// Enable or disable a policy.
    ///
    /// # Errors
    /// - `Error::NotFound` if the policy does not exist
    pub fn set_enabled(&self, id: PolicyId, enabled: bool) -> Result<Policy> {
        let resource = self.resource_of(id)?;
        let policy = self.locks.with_lock(resource, || {
            let mut policy = self
                .repo
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("Policy {}", id)))?;
            policy.enabled = enabled;
            self.repo.update(&policy)?;
            Ok(policy)
        })?;
        info!(policy = %id, enabled, "Policy toggled");
        Ok(policy)
    }

    /// Remove a policy. Returns whether it existed.
    pub fn delete_policy(&self, id: PolicyId) -> Result<bool> {
        let resource = match self.resource_of(id) {
            Ok(resource) => resource,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let removed = self.locks.with_lock(resource, || self.repo.delete(id))?;
        if removed {
            info!(policy = %id, "Policy deleted");
        }
        Ok(removed)
    }

    /// Resource a policy belongs to. A policy never changes resource, so
    /// this read needs no lock; the policy itself is re-read under it.
    fn resource_of(&self, id: PolicyId) -> Result<ResourceId> {
        self.repo
            .get(id)?
            .map(|p| p.resource_id)
            .ok_or_else(|| Error::NotFound(format!("Policy {}", id)))
    }

    /// All policies attached to a resource.
    pub fn policies_for(&self, resource: ResourceId) -> Result<Vec<Policy>> {
        self.repo.list_for(resource)
    }

    /// Grant `users` access to `resource`.
    ///
    /// Extends the first enabled shared policy of the resource, or creates one.
    /// Sharing with an already-listed user changes nothing.
    ///
    /// # Errors
    /// - `Error::Validation` if `users` is empty
    pub fn share_file(
        &self,
        resource: ResourceId,
        users: &[UserId],
        shared_by: UserId,
    ) -> Result<Policy> {
        if users.is_empty() {
            return Err(Error::Validation("No users to share with".to_string()));
        }
        debug!(resource = %resource, users = users.len(), by = %shared_by, "Sharing resource");

        self.locks.with_lock(resource, || {
            let existing = self
                .repo
                .list_for(resource)?
                .into_iter()
                .find(|p| p.enabled && matches!(p.kind, PolicyKind::Shared { .. }));

            match existing {
                Some(mut policy) => {
                    if let PolicyKind::Shared { user_ids } = &mut policy.kind {
                        user_ids.extend(users.iter().copied());
                    }
                    self.repo.update(&policy)?;
                    info!(resource = %resource, policy = %policy.id, "Shared grant extended");
                    Ok(policy)
                }
                None => {
                    let policy = Policy::new(resource, PolicyKind::shared(users.iter().copied()))
                        .with_creator(shared_by);
                    self.repo.insert(&policy)?;
                    info!(resource = %resource, policy = %policy.id, "Shared grant created");
                    Ok(policy)
                }
            }
        })
    }

    /// Grant `users` access to `resource` until `expires_at`.
    ///
    /// Grants expiring at the same instant share one policy.
    ///
    /// # Errors
    /// - `Error::Validation` if `users` is empty
    pub fn share_file_until(
        &self,
        resource: ResourceId,
        users: &[UserId],
        shared_by: UserId,
        expires_at: DateTime<Utc>,
    ) -> Result<Policy> {
        if users.is_empty() {
            return Err(Error::Validation("No users to share with".to_string()));
        }

        self.locks.with_lock(resource, || {
            let existing = self.repo.list_for(resource)?.into_iter().find(|p| {
                p.enabled
                    && matches!(p.kind, PolicyKind::TimeLimited { expires_at: at, .. } if at == expires_at)
            });

            match existing {
                Some(mut policy) => {
                    if let PolicyKind::TimeLimited { user_ids, .. } = &mut policy.kind {
                        user_ids.extend(users.iter().copied());
                    }
                    self.repo.update(&policy)?;
                    Ok(policy)
                }
                None => {
                    let policy = Policy::new(
                        resource,
                        PolicyKind::time_limited(expires_at, users.iter().copied()),
                    )
                    .with_creator(shared_by);
                    self.repo.insert(&policy)?;
                    info!(
                        resource = %resource,
                        policy = %policy.id,
                        expires_at = %expires_at,
                        "Time-limited grant created"
                    );
                    Ok(policy)
                }
            }
        })
    }

    /// Remove `user` from every sharing grant of `resource`.
    ///
    /// Grants left with no users are deleted. Returns whether anything
    /// changed; revoking a user who was never shared is not an error.
    pub fn revoke_share(&self, resource: ResourceId, user: UserId) -> Result<bool> {
        self.locks.with_lock(resource, || {
            let mut changed = false;
            for mut policy in self.repo.list_for(resource)? {
                let users: &mut BTreeSet<UserId> = match &mut policy.kind {
                    PolicyKind::Shared { user_ids } => user_ids,
                    PolicyKind::TimeLimited { user_ids, .. } => user_ids,
                    _ => continue,
                };
                if !users.remove(&user) {
                    continue;
                }
                changed = true;
                if users.is_empty() {
                    self.repo.delete(policy.id)?;
                } else {
                    self.repo.update(&policy)?;
                }
            }
            if changed {
                info!(resource = %resource, user = %user, "Share revoked");
            }
            Ok(changed)
        })
    }
}
