//! Key record persistence interface and an in-memory implementation.

use chrono::{DateTime, Utc};
use std::sync::RwLock;

use crate::records::{KeyRecord, KeyShare, KeyStatus};
use mediaguard_common::{Error, RecordId, ResourceId, Result, UserId};

/// Storage for key records and their shares.
///
/// Every method is a single atomic unit: either all of its writes become
/// visible or none do.
pub trait KeyRepository: Send + Sync {
    /// Persist a new active record together with its shares.
    ///
    /// # Errors
    /// - `Error::Validation` if the resource already has an active record
    fn insert_record(&self, record: &KeyRecord, shares: &[KeyShare]) -> Result<()>;

    /// The active record of a resource, if any.
    fn active_record(&self, resource: ResourceId) -> Result<Option<KeyRecord>>;

    /// The most recently created record of a resource, whatever its status.
    fn latest_record(&self, resource: ResourceId) -> Result<Option<KeyRecord>>;

    /// All records, optionally filtered by status, in creation order.
    fn list_records(&self, status: Option<KeyStatus>) -> Result<Vec<KeyRecord>>;

    /// Shares of a record, ordered by index.
    fn shares_for(&self, record: RecordId) -> Result<Vec<KeyShare>>;

    /// The active record of a resource together with its shares, read as
    /// one consistent snapshot so a concurrent rotation is seen entirely or
    /// not at all.
    fn active_snapshot(&self, resource: ResourceId) -> Result<Option<(KeyRecord, Vec<KeyShare>)>>;

    /// Revoke an active record and all its shares.
    ///
    /// Returns `false` if the record is not active.
    fn revoke_record(&self, record: RecordId, at: DateTime<Utc>) -> Result<bool>;

    /// Revoke `old` and insert `new` with its shares, as one commit.
    ///
    /// # Errors
    /// - `Error::Validation` if `old` is no longer active
    fn replace_record(
        &self,
        old: RecordId,
        at: DateTime<Utc>,
        new: &KeyRecord,
        shares: &[KeyShare],
    ) -> Result<()>;

    /// Set the holder of a share. Returns `false` if no such share exists.
    fn set_share_holder(&self, record: RecordId, index: u8, holder: Option<UserId>)
        -> Result<bool>;
}

#[derive(Default)]
struct State {
    records: Vec<KeyRecord>,
    shares: Vec<KeyShare>,
}

impl State {
    fn revoke(&mut self, record: RecordId, at: DateTime<Utc>) -> bool {
        let Some(target) = self
            .records
            .iter_mut()
            .find(|r| r.id == record && r.status == KeyStatus::Active)
        else {
            return false;
        };
        target.status = KeyStatus::Revoked;
        target.revoked_at = Some(at);
        for share in self.shares.iter_mut().filter(|s| s.record_id == record) {
            share.status = KeyStatus::Revoked;
        }
        true
    }

    fn has_active(&self, resource: ResourceId) -> bool {
        self.records
            .iter()
            .any(|r| r.resource_id == resource && r.status == KeyStatus::Active)
    }
}

/// In-memory key repository.
#[derive(Default)]
pub struct MemoryKeyRepository {
    state: RwLock<State>,
}

impl MemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::Storage("Key repository lock poisoned".to_string())
    }
}

impl KeyRepository for MemoryKeyRepository {
    fn insert_record(&self, record: &KeyRecord, shares: &[KeyShare]) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        if state.has_active(record.resource_id) {
            return Err(Error::Validation(format!(
                "Resource {} already has an active key",
                record.resource_id
            )));
        }
        state.records.push(record.clone());
        state.shares.extend_from_slice(shares);
        Ok(())
    }

    fn active_record(&self, resource: ResourceId) -> Result<Option<KeyRecord>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state
            .records
            .iter()
            .find(|r| r.resource_id == resource && r.status == KeyStatus::Active)
            .cloned())
    }

    fn latest_record(&self, resource: ResourceId) -> Result<Option<KeyRecord>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state
            .records
            .iter()
            .rev()
            .find(|r| r.resource_id == resource)
            .cloned())
    }

    fn list_records(&self, status: Option<KeyStatus>) -> Result<Vec<KeyRecord>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state
            .records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    fn shares_for(&self, record: RecordId) -> Result<Vec<KeyShare>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        let mut shares: Vec<KeyShare> = state
            .shares
            .iter()
            .filter(|s| s.record_id == record)
            .cloned()
            .collect();
        shares.sort_by_key(|s| s.share_index);
        Ok(shares)
    }

    fn active_snapshot(&self, resource: ResourceId) -> Result<Option<(KeyRecord, Vec<KeyShare>)>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        let Some(record) = state
            .records
            .iter()
            .find(|r| r.resource_id == resource && r.status == KeyStatus::Active)
            .cloned()
        else {
            return Ok(None);
        };
        let mut shares: Vec<KeyShare> = state
            .shares
            .iter()
            .filter(|s| s.record_id == record.id)
            .cloned()
            .collect();
        shares.sort_by_key(|s| s.share_index);
        Ok(Some((record, shares)))
    }

    fn revoke_record(&self, record: RecordId, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        Ok(state.revoke(record, at))
    }

    fn replace_record(
        &self,
        old: RecordId,
        at: DateTime<Utc>,
        new: &KeyRecord,
        shares: &[KeyShare],
    ) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        if !state.revoke(old, at) {
            return Err(Error::Validation(format!("Record {} is not active", old)));
        }
        state.records.push(new.clone());
        state.shares.extend_from_slice(shares);
        Ok(())
    }

    fn set_share_holder(
        &self,
        record: RecordId,
        index: u8,
        holder: Option<UserId>,
    ) -> Result<bool> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        match state
            .shares
            .iter_mut()
            .find(|s| s.record_id == record && s.share_index == index)
        {
            Some(share) => {
                share.holder_id = holder;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
