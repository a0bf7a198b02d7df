//! Per-resource key lifecycle.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::config::SplitParams;
use crate::records::{KeyInfo, KeyRecord, KeyShare, KeyStatus};
use crate::repository::KeyRepository;
use mediaguard_common::{Error, ResourceId, ResourceLocks, Result, UserId};
use mediaguard_crypto::shamir::{self, Share};
use mediaguard_crypto::{DataKey, KeyWrapper, RootKey, WrappedToken};

/// Orchestrates key wrapping, splitting and record lifecycle.
///
/// Mutations are serialized per resource. Reads take no lock of their own.
pub struct KeyStore {
    wrapper: KeyWrapper,
    repo: Arc<dyn KeyRepository>,
    locks: ResourceLocks,
}

impl KeyStore {
    /// Create a key store bound to `root`.
    pub fn new(root: &RootKey, repo: Arc<dyn KeyRepository>) -> Self {
        Self {
            wrapper: KeyWrapper::new(root),
            repo,
            locks: ResourceLocks::new(),
        }
    }

    /// Fingerprint of the root key in use.
    pub fn root_fingerprint(&self) -> &str {
        self.wrapper.fingerprint()
    }

    /// Store a data key for a resource.
    ///
    /// With `split = Some((n, k))` the wrapped key is split into `n` shares,
    /// each wrapped again, and the record holds no wrapped key of its own.
    ///
    /// # Errors
    /// - `Error::Validation` for bad split parameters or if the resource
    ///   already has an active key
    /// - `Error::Revoked` if the resource's key was revoked
    pub fn store_key(
        &self,
        resource: ResourceId,
        key: &DataKey,
        split: Option<SplitParams>,
    ) -> Result<KeyRecord> {
        if let Some(params) = split {
            params.validate()?;
        }
        debug!(resource = %resource, split = ?split, "Storing key");

        self.locks.with_lock(resource, || {
            if let Some(latest) = self.repo.latest_record(resource)? {
                if latest.is_active() {
                    return Err(Error::Validation(format!(
                        "Resource {} already has an active key",
                        resource
                    )));
                }
                return Err(Error::Revoked(resource.to_string()));
            }

            let (record, shares) = self.seal(resource, key, split)?;
            self.repo.insert_record(&record, &shares)?;
            info!(
                resource = %resource,
                record = %record.id,
                shares = record.total_shares,
                "Key stored"
            );
            Ok(record)
        })
    }

    /// Generate a fresh data key and store it.
    pub fn create_key(
        &self,
        resource: ResourceId,
        split: Option<SplitParams>,
    ) -> Result<(DataKey, KeyRecord)> {
        let key = DataKey::generate();
        let record = self.store_key(resource, &key, split)?;
        Ok((key, record))
    }

    /// Retrieve the data key of a resource.
    ///
    /// Returns `Ok(None)` if the resource has no active key. A split key
    /// needs at least `threshold` presented shares that match the stored
    /// active shares; other presented shares are ignored.
    ///
    /// # Errors
    /// - `Error::InsufficientShares` if too few valid shares were presented
    /// - `Error::WrongRootKey` if the stored key does not open under this root key
    pub fn retrieve_key(&self, resource: ResourceId, presented: &[Share]) -> Result<Option<DataKey>> {
        let Some((record, stored)) = self.repo.active_snapshot(resource)? else {
            debug!(resource = %resource, "No active key");
            return Ok(None);
        };

        if let Some(token) = &record.wrapped_key {
            return self.wrapper.unwrap_key(token).map(Some);
        }

        let stored = self.unwrap_shares(&stored)?;
        let mut valid: BTreeMap<u8, &Share> = BTreeMap::new();
        for share in presented {
            let Some(expected) = stored.get(&share.index()) else {
                continue;
            };
            let matches: bool = expected
                .to_bytes()
                .as_bytes()
                .ct_eq(share.to_bytes().as_bytes())
                .into();
            if matches {
                valid.insert(share.index(), share);
            }
        }

        if valid.len() < presented.len() {
            warn!(
                resource = %resource,
                rejected = presented.len() - valid.len(),
                "Presented shares rejected"
            );
        }
        if valid.len() < record.threshold {
            return Err(Error::InsufficientShares {
                required: record.threshold,
                provided: valid.len(),
            });
        }

        let shares: Vec<Share> = valid.into_values().cloned().collect();
        self.open_shares(&shares, record.threshold).map(Some)
    }

    /// Recover a key from the escrowed shares, without presented shares.
    ///
    /// Intended for operator workflows such as rotation.
    pub fn recover_key(&self, resource: ResourceId) -> Result<Option<DataKey>> {
        match self.repo.active_snapshot(resource)? {
            Some((record, shares)) => self.open_record(&record, &shares).map(Some),
            None => Ok(None),
        }
    }

    /// Revoke the active key of a resource. Irreversible.
    ///
    /// Returns `false` if there is no active key.
    pub fn revoke_key(&self, resource: ResourceId) -> Result<bool> {
        self.locks.with_lock(resource, || {
            let Some(record) = self.repo.active_record(resource)? else {
                return Ok(false);
            };
            let revoked = self.repo.revoke_record(record.id, Utc::now())?;
            if revoked {
                info!(resource = %resource, record = %record.id, "Key revoked");
            }
            Ok(revoked)
        })
    }

    /// Replace the active key of a resource with a fresh one.
    ///
    /// `re_encrypt` receives the old and new keys and must re-encrypt the
    /// resource's payload. If it fails nothing is committed and the old key
    /// stays active. The split configuration of the old record is kept.
    ///
    /// # Errors
    /// - `Error::Revoked` if the resource's key was revoked
    /// - `Error::NotFound` if the resource has no key
    /// - any error returned by `re_encrypt`
    pub fn rotate_key<F>(&self, resource: ResourceId, re_encrypt: F) -> Result<KeyRecord>
    where
        F: FnOnce(&DataKey, &DataKey) -> Result<()>,
    {
        debug!(resource = %resource, "Rotating key");

        self.locks.with_lock(resource, || {
            let (old, old_shares) = match self.repo.active_snapshot(resource)? {
                Some(snapshot) => snapshot,
                None => return Err(self.missing_key_error(resource)?),
            };
            let old_key = self.open_record(&old, &old_shares)?;
            let new_key = DataKey::generate();
            let split = old
                .is_split()
                .then(|| SplitParams::new(old.total_shares, old.threshold));

            let (record, shares) = self.seal(resource, &new_key, split)?;

            if let Err(e) = re_encrypt(&old_key, &new_key) {
                warn!(resource = %resource, error = %e, "Re-encryption failed, rotation aborted");
                return Err(e);
            }

            self.repo
                .replace_record(old.id, Utc::now(), &record, &shares)?;
            info!(
                resource = %resource,
                old = %old.id,
                new = %record.id,
                "Key rotated"
            );
            Ok(record)
        })
    }

    /// Assign the holder of one share of the active key.
    ///
    /// # Errors
    /// - `Error::NotFound` if there is no active key or no such share
    pub fn assign_holder(&self, resource: ResourceId, index: u8, holder: UserId) -> Result<()> {
        self.locks.with_lock(resource, || {
            let record = self.require_active(resource)?;
            if !self.repo.set_share_holder(record.id, index, Some(holder))? {
                return Err(Error::NotFound(format!(
                    "Share {} of resource {}",
                    index, resource
                )));
            }
            info!(resource = %resource, index, holder = %holder, "Share holder assigned");
            Ok(())
        })
    }

    /// Unwrap one stored share of the active key for hand-out to its holder.
    ///
    /// # Errors
    /// - `Error::NotFound` if there is no active key or no such active share
    pub fn issue_share(&self, resource: ResourceId, index: u8) -> Result<Share> {
        let (_, shares) = self
            .repo
            .active_snapshot(resource)?
            .ok_or_else(|| Error::NotFound(format!("Active key for resource {}", resource)))?;
        self.unwrap_shares(&shares)?
            .remove(&index)
            .ok_or_else(|| Error::NotFound(format!("Share {} of resource {}", index, resource)))
    }

    /// Metadata for the current (or most recent) key of a resource.
    pub fn key_info(&self, resource: ResourceId) -> Result<Option<KeyInfo>> {
        let record = match self.repo.active_record(resource)? {
            Some(record) => Some(record),
            None => self.repo.latest_record(resource)?,
        };
        record
            .map(|r| -> Result<KeyInfo> { Ok(KeyInfo::new(&r, &self.repo.shares_for(r.id)?)) })
            .transpose()
    }

    /// Metadata for every key record, optionally filtered by status.
    pub fn list_keys(&self, status: Option<KeyStatus>) -> Result<Vec<KeyInfo>> {
        self.repo
            .list_records(status)?
            .iter()
            .map(|r| -> Result<KeyInfo> { Ok(KeyInfo::new(r, &self.repo.shares_for(r.id)?)) })
            .collect()
    }

    fn require_active(&self, resource: ResourceId) -> Result<KeyRecord> {
        self.repo
            .active_record(resource)?
            .ok_or_else(|| Error::NotFound(format!("Active key for resource {}", resource)))
    }

    fn missing_key_error(&self, resource: ResourceId) -> Result<Error> {
        Ok(match self.repo.latest_record(resource)? {
            Some(_) => Error::Revoked(resource.to_string()),
            None => Error::NotFound(format!("Key for resource {}", resource)),
        })
    }

    fn seal(
        &self,
        resource: ResourceId,
        key: &DataKey,
        split: Option<SplitParams>,
    ) -> Result<(KeyRecord, Vec<KeyShare>)> {
        let token = self.wrapper.wrap_key(key)?;
        let Some(params) = split else {
            return Ok((KeyRecord::new(resource, Some(token), 0, 0), Vec::new()));
        };

        let record = KeyRecord::new(resource, None, params.total, params.threshold);
        let shares = shamir::split(token.as_bytes(), params.total, params.threshold)?
            .iter()
            .map(|share| -> Result<KeyShare> {
                Ok(KeyShare {
                    record_id: record.id,
                    share_index: share.index(),
                    encrypted_share: self.wrapper.wrap(share.to_bytes().as_bytes())?,
                    holder_id: None,
                    status: KeyStatus::Active,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((record, shares))
    }

    fn unwrap_shares(&self, shares: &[KeyShare]) -> Result<BTreeMap<u8, Share>> {
        shares
            .iter()
            .filter(|s| s.status == KeyStatus::Active)
            .map(|s| -> Result<(u8, Share)> {
                let raw = self.wrapper.unwrap(&s.encrypted_share)?;
                let share = Share::from_bytes(raw.as_bytes()).map_err(|_| Error::WrongRootKey)?;
                Ok((s.share_index, share))
            })
            .collect()
    }

    fn open_record(&self, record: &KeyRecord, shares: &[KeyShare]) -> Result<DataKey> {
        if let Some(token) = &record.wrapped_key {
            return self.wrapper.unwrap_key(token);
        }
        let shares: Vec<Share> = self.unwrap_shares(shares)?.into_values().collect();
        if shares.len() < record.threshold {
            return Err(Error::InsufficientShares {
                required: record.threshold,
                provided: shares.len(),
            });
        }
        self.open_shares(&shares, record.threshold)
    }

    fn open_shares(&self, shares: &[Share], threshold: usize) -> Result<DataKey> {
        let token = shamir::reconstruct(shares, threshold)?;
        self.wrapper
            .unwrap_key(&WrappedToken::from_bytes(token.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryKeyRepository;
    use mediaguard_crypto::{decrypt, encrypt};
    use std::cell::RefCell;

    fn store() -> KeyStore {
        KeyStore::new(&RootKey::generate(), Arc::new(MemoryKeyRepository::new()))
    }

    fn issue_all(store: &KeyStore, resource: ResourceId, n: u8) -> Vec<Share> {
        (1..=n).map(|i| store.issue_share(resource, i).unwrap()).collect()
    }

    #[test]
    fn test_store_retrieve_revoke() {
        let store = store();
        let key = DataKey::generate();

        store.store_key(ResourceId(42), &key, None).unwrap();
        assert_eq!(store.retrieve_key(ResourceId(42), &[]).unwrap(), Some(key));

        assert!(store.revoke_key(ResourceId(42)).unwrap());
        assert_eq!(store.retrieve_key(ResourceId(42), &[]).unwrap(), None);
    }

    #[test]
    fn test_unknown_resource() {
        let store = store();
        assert_eq!(store.retrieve_key(ResourceId(1), &[]).unwrap(), None);
        assert!(!store.revoke_key(ResourceId(1)).unwrap());
        assert!(store.key_info(ResourceId(1)).unwrap().is_none());
    }

    #[test]
    fn test_second_active_key_rejected() {
        let store = store();
        store.create_key(ResourceId(1), None).unwrap();
        let result = store.store_key(ResourceId(1), &DataKey::generate(), None);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_revoked_cannot_be_resurrected() {
        let store = store();
        let (key, _) = store.create_key(ResourceId(7), Some(SplitParams::new(3, 2))).unwrap();
        let shares = issue_all(&store, ResourceId(7), 3);
        assert_eq!(store.retrieve_key(ResourceId(7), &shares).unwrap(), Some(key.clone()));

        assert!(store.revoke_key(ResourceId(7)).unwrap());
        assert!(!store.revoke_key(ResourceId(7)).unwrap());

        assert_eq!(store.retrieve_key(ResourceId(7), &shares).unwrap(), None);
        assert!(matches!(
            store.rotate_key(ResourceId(7), |_, _| Ok(())),
            Err(Error::Revoked(_))
        ));
        assert!(matches!(
            store.store_key(ResourceId(7), &key, None),
            Err(Error::Revoked(_))
        ));
        assert!(store.recover_key(ResourceId(7)).unwrap().is_none());

        let info = store.key_info(ResourceId(7)).unwrap().unwrap();
        assert_eq!(info.status, KeyStatus::Revoked);
        assert!(info.shares.iter().all(|s| s.status == KeyStatus::Revoked));
    }

    #[test]
    fn test_split_key_needs_threshold() {
        let store = store();
        let (key, record) = store
            .create_key(ResourceId(5), Some(SplitParams::new(5, 3)))
            .unwrap();
        assert!(record.wrapped_key.is_none());
        assert_eq!(record.total_shares, 5);

        let shares = issue_all(&store, ResourceId(5), 5);

        let two = [shares[0].clone(), shares[4].clone()];
        assert!(matches!(
            store.retrieve_key(ResourceId(5), &two),
            Err(Error::InsufficientShares {
                required: 3,
                provided: 2
            })
        ));

        let three = [shares[1].clone(), shares[3].clone(), shares[4].clone()];
        assert_eq!(store.retrieve_key(ResourceId(5), &three).unwrap(), Some(key));
    }

    #[test]
    fn test_duplicate_presented_shares_count_once() {
        let store = store();
        store
            .create_key(ResourceId(5), Some(SplitParams::new(3, 2)))
            .unwrap();
        let share = store.issue_share(ResourceId(5), 1).unwrap();

        let result = store.retrieve_key(ResourceId(5), &[share.clone(), share]);
        assert!(matches!(
            result,
            Err(Error::InsufficientShares { provided: 1, .. })
        ));
    }

    #[test]
    fn test_foreign_shares_rejected() {
        let store = store();
        store
            .create_key(ResourceId(1), Some(SplitParams::new(3, 2)))
            .unwrap();
        let (key_two, _) = store
            .create_key(ResourceId(2), Some(SplitParams::new(3, 2)))
            .unwrap();

        let foreign = issue_all(&store, ResourceId(1), 3);
        assert!(matches!(
            store.retrieve_key(ResourceId(2), &foreign),
            Err(Error::InsufficientShares { provided: 0, .. })
        ));

        let mut mixed = vec![foreign[0].clone()];
        mixed.extend(issue_all(&store, ResourceId(2), 2));
        assert_eq!(store.retrieve_key(ResourceId(2), &mixed).unwrap(), Some(key_two));
    }

    #[test]
    fn test_invalid_split_params() {
        let store = store();
        for (n, k) in [(3, 1), (2, 3), (256, 2)] {
            let result = store.create_key(ResourceId(1), Some(SplitParams::new(n, k)));
            assert!(matches!(result, Err(Error::Validation(_))));
        }
        assert!(store.key_info(ResourceId(1)).unwrap().is_none());
    }

    #[test]
    fn test_wrong_root_key() {
        let repo = Arc::new(MemoryKeyRepository::new());
        let writer = KeyStore::new(&RootKey::generate(), repo.clone());
        let reader = KeyStore::new(&RootKey::generate(), repo);

        writer.create_key(ResourceId(1), None).unwrap();
        assert!(matches!(
            reader.retrieve_key(ResourceId(1), &[]),
            Err(Error::WrongRootKey)
        ));
    }

    #[test]
    fn test_rotate_re_encrypts_payload() {
        let store = store();
        let (key, _) = store.create_key(ResourceId(9), None).unwrap();
        let payload = RefCell::new(encrypt(b"master tape", &key).unwrap());

        let record = store
            .rotate_key(ResourceId(9), |old, new| {
                let plaintext = decrypt(&payload.borrow(), old)?;
                *payload.borrow_mut() = encrypt(&plaintext, new)?;
                Ok(())
            })
            .unwrap();
        assert!(record.is_active());

        let new_key = store.retrieve_key(ResourceId(9), &[]).unwrap().unwrap();
        assert_ne!(new_key, key);
        assert_eq!(decrypt(&payload.borrow(), &new_key).unwrap(), b"master tape");
        assert_eq!(store.list_keys(Some(KeyStatus::Revoked)).unwrap().len(), 1);
        assert_eq!(store.list_keys(Some(KeyStatus::Active)).unwrap().len(), 1);
    }

    #[test]
    fn test_rotate_abort_leaves_old_key() {
        let store = store();
        let (key, old) = store.create_key(ResourceId(9), None).unwrap();

        let result = store.rotate_key(ResourceId(9), |_, _| {
            Err(Error::Storage("payload unavailable".to_string()))
        });
        assert!(matches!(result, Err(Error::Storage(_))));

        assert_eq!(store.retrieve_key(ResourceId(9), &[]).unwrap(), Some(key));
        assert_eq!(store.key_info(ResourceId(9)).unwrap().unwrap().record_id, old.id);
        assert_eq!(store.list_keys(None).unwrap().len(), 1);
    }

    #[test]
    fn test_rotate_keeps_split_config() {
        let store = store();
        store
            .create_key(ResourceId(3), Some(SplitParams::new(4, 3)))
            .unwrap();
        let old_shares = issue_all(&store, ResourceId(3), 4);

        let record = store.rotate_key(ResourceId(3), |_, _| Ok(())).unwrap();
        assert_eq!((record.total_shares, record.threshold), (4, 3));

        assert!(matches!(
            store.retrieve_key(ResourceId(3), &old_shares),
            Err(Error::InsufficientShares { provided: 0, .. })
        ));
        let new_shares = issue_all(&store, ResourceId(3), 3);
        let recovered = store.recover_key(ResourceId(3)).unwrap();
        assert_eq!(store.retrieve_key(ResourceId(3), &new_shares).unwrap(), recovered);
    }

    #[test]
    fn test_rotate_unknown_resource() {
        let store = store();
        assert!(matches!(
            store.rotate_key(ResourceId(1), |_, _| Ok(())),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_assign_holder() {
        let store = store();
        store
            .create_key(ResourceId(4), Some(SplitParams::new(3, 2)))
            .unwrap();

        store.assign_holder(ResourceId(4), 2, UserId(77)).unwrap();
        assert!(matches!(
            store.assign_holder(ResourceId(4), 9, UserId(77)),
            Err(Error::NotFound(_))
        ));

        let info = store.key_info(ResourceId(4)).unwrap().unwrap();
        assert_eq!(info.shares.len(), 3);
        assert_eq!(info.shares[1].holder_id, Some(UserId(77)));
        assert_eq!(info.shares[0].holder_id, None);
    }

    #[test]
    fn test_concurrent_revoke_and_rotate() {
        let store = Arc::new(store());
        store.create_key(ResourceId(1), None).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        let _ = store.rotate_key(ResourceId(1), |_, _| Ok(()));
                    } else {
                        let _ = store.revoke_key(ResourceId(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(store.list_keys(Some(KeyStatus::Active)).unwrap().len() <= 1);
    }
}
