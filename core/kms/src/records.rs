//! Persisted key records and shares.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use mediaguard_common::{Error, RecordId, ResourceId, Result, UserId};
use mediaguard_crypto::WrappedToken;

/// Lifecycle status of a record or share. `Revoked` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(KeyStatus::Active),
            "revoked" => Ok(KeyStatus::Revoked),
            other => Err(Error::Validation(format!("Unknown key status: {}", other))),
        }
    }
}

/// One data key of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: RecordId,
    pub resource_id: ResourceId,
    /// Wrapped data key; `None` when the key lives only in its shares.
    pub wrapped_key: Option<WrappedToken>,
    /// Number of shares, 0 if unsplit.
    pub total_shares: usize,
    pub threshold: usize,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub(crate) fn new(
        resource_id: ResourceId,
        wrapped_key: Option<WrappedToken>,
        total_shares: usize,
        threshold: usize,
    ) -> Self {
        Self {
            id: RecordId::new(),
            resource_id,
            wrapped_key,
            total_shares,
            threshold,
            status: KeyStatus::Active,
            created_at: Utc::now(),
            revoked_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    pub fn is_split(&self) -> bool {
        self.total_shares > 0
    }
}

/// One share of a split record, wrapped under the root key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShare {
    pub record_id: RecordId,
    /// 1..=total_shares
    pub share_index: u8,
    pub encrypted_share: WrappedToken,
    pub holder_id: Option<UserId>,
    pub status: KeyStatus,
}

/// Key metadata without key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub record_id: RecordId,
    pub resource_id: ResourceId,
    pub status: KeyStatus,
    pub total_shares: usize,
    pub threshold: usize,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub shares: Vec<ShareInfo>,
}

/// Share metadata without share material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareInfo {
    pub index: u8,
    pub holder_id: Option<UserId>,
    pub status: KeyStatus,
}

impl KeyInfo {
    pub fn new(record: &KeyRecord, shares: &[KeyShare]) -> Self {
        let mut shares: Vec<ShareInfo> = shares
            .iter()
            .map(|s| ShareInfo {
                index: s.share_index,
                holder_id: s.holder_id,
                status: s.status,
            })
            .collect();
        shares.sort_by_key(|s| s.index);

        Self {
            record_id: record.id,
            resource_id: record.resource_id,
            status: record.status,
            total_shares: record.total_shares,
            threshold: record.threshold,
            created_at: record.created_at,
            revoked_at: record.revoked_at,
            shares,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        for status in [KeyStatus::Active, KeyStatus::Revoked] {
            assert_eq!(status.as_str().parse::<KeyStatus>().unwrap(), status);
        }
        assert!("rotated".parse::<KeyStatus>().is_err());
    }

    #[test]
    fn test_new_record_is_active() {
        let record = KeyRecord::new(ResourceId(1), None, 5, 3);
        assert!(record.is_active());
        assert!(record.is_split());
        assert!(record.revoked_at.is_none());
    }
}
