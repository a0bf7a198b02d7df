//! Policy persistence interface and an in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::Policy;
use mediaguard_common::{Error, PolicyId, ResourceId, Result};

/// Storage for policies.
pub trait PolicyRepository: Send + Sync {
    /// Insert a new policy.
    ///
    /// # Errors
    /// - `Error::Validation` if a policy with the same id exists
    fn insert(&self, policy: &Policy) -> Result<()>;

    /// Replace an existing policy.
    ///
    /// # Errors
    /// - `Error::NotFound` if the policy does not exist
    fn update(&self, policy: &Policy) -> Result<()>;

    /// Delete a policy. Returns whether it existed.
    fn delete(&self, id: PolicyId) -> Result<bool>;

    /// Get a policy by id.
    fn get(&self, id: PolicyId) -> Result<Option<Policy>>;

    /// All policies of a resource, in creation order.
    fn list_for(&self, resource: ResourceId) -> Result<Vec<Policy>>;
}

/// In-memory policy store.
#[derive(Default)]
pub struct MemoryPolicyStore {
    policies: RwLock<HashMap<PolicyId, Policy>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::Storage("Policy store lock poisoned".to_string())
    }
}

impl PolicyRepository for MemoryPolicyStore {
    fn insert(&self, policy: &Policy) -> Result<()> {
        let mut policies = self.policies.write().map_err(|_| Self::poisoned())?;
        if policies.contains_key(&policy.id) {
            return Err(Error::Validation(format!(
                "Policy {} already exists",
                policy.id
            )));
        }
        policies.insert(policy.id, policy.clone());
        Ok(())
    }

    fn update(&self, policy: &Policy) -> Result<()> {
        let mut policies = self.policies.write().map_err(|_| Self::poisoned())?;
        match policies.get_mut(&policy.id) {
            Some(existing) => {
                *existing = policy.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("Policy {}", policy.id))),
        }
    }

    fn delete(&self, id: PolicyId) -> Result<bool> {
        let mut policies = self.policies.write().map_err(|_| Self::poisoned())?;
        Ok(policies.remove(&id).is_some())
    }

    fn get(&self, id: PolicyId) -> Result<Option<Policy>> {
        let policies = self.policies.read().map_err(|_| Self::poisoned())?;
        Ok(policies.get(&id).cloned())
    }

    fn list_for(&self, resource: ResourceId) -> Result<Vec<Policy>> {
        let policies = self.policies.read().map_err(|_| Self::poisoned())?;
        let mut found: Vec<Policy> = policies
            .values()
            .filter(|p| p.resource_id == resource)
            .cloned()
            .collect();
        found.sort_by_key(|p| (p.created_at, *p.id.as_uuid()));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PolicyKind;

    #[test]
    fn test_insert_get_delete() {
        let store = MemoryPolicyStore::new();
        let policy = Policy::new(ResourceId(1), PolicyKind::OwnerOnly);

        store.insert(&policy).unwrap();
        assert!(store.insert(&policy).is_err());
        assert!(store.get(policy.id).unwrap().is_some());

        assert!(store.delete(policy.id).unwrap());
        assert!(!store.delete(policy.id).unwrap());
        assert!(store.get(policy.id).unwrap().is_none());
    }

    #[test]
    fn test_update_missing() {
        let store = MemoryPolicyStore::new();
        let policy = Policy::new(ResourceId(1), PolicyKind::OwnerOnly);
        assert!(matches!(store.update(&policy), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_for_resource() {
        let store = MemoryPolicyStore::new();
        store
            .insert(&Policy::new(ResourceId(1), PolicyKind::OwnerOnly))
            .unwrap();
        store
            .insert(&Policy::new(ResourceId(1), PolicyKind::AdminOverride))
            .unwrap();
        store
            .insert(&Policy::new(ResourceId(2), PolicyKind::OwnerOnly))
            .unwrap();

        assert_eq!(store.list_for(ResourceId(1)).unwrap().len(), 2);
        assert_eq!(store.list_for(ResourceId(3)).unwrap().len(), 0);
    }
}
