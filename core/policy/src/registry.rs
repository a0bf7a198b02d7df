//! Custom rule registry for rebuilding persisted custom policies.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::model::{AccessRequest, CustomRule, RuleVerdict};
use mediaguard_common::{Error, Result, UserId};

/// Factory function type for building rules from their stored parameters.
pub type RuleFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn CustomRule>> + Send + Sync>;

/// Registry of custom rule factories, keyed by rule name.
pub struct RuleRegistry {
    factories: HashMap<String, RuleFactory>,
}

impl RuleRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a rule factory.
    ///
    /// # Preconditions
    /// - `name` must be unique within the registry
    ///
    /// # Errors
    /// - `Error::Validation` if the name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: RuleFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::Validation(format!(
                "Rule '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build a rule by name from its parameters.
    ///
    /// # Errors
    /// - `Error::NotFound` if no factory has that name
    /// - `Error::Validation` if the parameters are invalid for the rule
    pub fn build(&self, name: &str, config: &Value) -> Result<Arc<dyn CustomRule>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Rule '{}' is not registered", name)))?;
        factory(config)
    }

    /// Registered rule names, sorted.
    pub fn rules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a rule is registered.
    pub fn has_rule(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct UserListConfig {
    user_ids: BTreeSet<UserId>,
}

#[derive(Deserialize)]
struct NotBeforeConfig {
    not_before: DateTime<Utc>,
}

fn parse<T: for<'de> Deserialize<'de>>(rule: &str, config: &Value) -> Result<T> {
    T::deserialize(config)
        .map_err(|e| Error::Validation(format!("Invalid parameters for rule '{}': {}", rule, e)))
}

/// Allows the listed users, abstains otherwise.
pub struct AllowUsers {
    user_ids: BTreeSet<UserId>,
}

impl AllowUsers {
    pub const NAME: &'static str = "allow_users";

    pub fn new(users: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            user_ids: users.into_iter().collect(),
        }
    }
}

impl CustomRule for AllowUsers {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn config(&self) -> Value {
        serde_json::json!({ "user_ids": self.user_ids })
    }

    fn evaluate(&self, request: &AccessRequest, _now: DateTime<Utc>) -> RuleVerdict {
        if self.user_ids.contains(&request.requester_id) {
            RuleVerdict::Allow
        } else {
            RuleVerdict::Abstain
        }
    }
}

/// Denies the listed users, abstains otherwise.
pub struct DenyUsers {
    user_ids: BTreeSet<UserId>,
}

impl DenyUsers {
    pub const NAME: &'static str = "deny_users";

    pub fn new(users: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            user_ids: users.into_iter().collect(),
        }
    }
}

impl CustomRule for DenyUsers {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn config(&self) -> Value {
        serde_json::json!({ "user_ids": self.user_ids })
    }

    fn evaluate(&self, request: &AccessRequest, _now: DateTime<Utc>) -> RuleVerdict {
        if self.user_ids.contains(&request.requester_id) {
            RuleVerdict::Deny
        } else {
            RuleVerdict::Abstain
        }
    }
}

/// Embargo: denies everyone before an instant.
pub struct NotBefore {
    not_before: DateTime<Utc>,
}

impl NotBefore {
    pub const NAME: &'static str = "not_before";

    pub fn new(not_before: DateTime<Utc>) -> Self {
        Self { not_before }
    }
}

impl CustomRule for NotBefore {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn config(&self) -> Value {
        serde_json::json!({ "not_before": self.not_before })
    }

    fn evaluate(&self, _request: &AccessRequest, now: DateTime<Utc>) -> RuleVerdict {
        if now < self.not_before {
            RuleVerdict::Deny
        } else {
            RuleVerdict::Abstain
        }
    }
}

/// Create a registry with the built-in rules.
pub fn create_default_registry() -> RuleRegistry {
    let mut registry = RuleRegistry::new();
    let builtins: [(&str, RuleFactory); 3] = [
        (
            AllowUsers::NAME,
            Box::new(|config| {
                let cfg: UserListConfig = parse(AllowUsers::NAME, config)?;
                Ok(Arc::new(AllowUsers::new(cfg.user_ids)))
            }),
        ),
        (
            DenyUsers::NAME,
            Box::new(|config| {
                let cfg: UserListConfig = parse(DenyUsers::NAME, config)?;
                Ok(Arc::new(DenyUsers::new(cfg.user_ids)))
            }),
        ),
        (
            NotBefore::NAME,
            Box::new(|config| {
                let cfg: NotBeforeConfig = parse(NotBefore::NAME, config)?;
                Ok(Arc::new(NotBefore::new(cfg.not_before)))
            }),
        ),
    ];
    for (name, factory) in builtins {
        registry.factories.insert(name.to_string(), factory);
    }
    registry
}
