//! Gated key release over a SQLite database.

use chrono::{Duration, Utc};
use std::sync::Arc;

use mediaguard_common::{Error, ResourceId, Role, UserId};
use mediaguard_crypto::{decrypt, encrypt, RootKey};
use mediaguard_kms::{KeyStatus, KeyStore, SplitParams};
use mediaguard_policy::registry::DenyUsers;
use mediaguard_policy::{
    create_default_registry, AccessRequest, Decision, Policy, PolicyEngine, PolicyKind,
    PolicyManager,
};
use mediaguard_storage::SqliteStore;

const OWNER: UserId = UserId(3);
const MEDIA: ResourceId = ResourceId(10);

struct Platform {
    store: Arc<SqliteStore>,
    keys: KeyStore,
    policies: PolicyManager,
    engine: PolicyEngine,
}

impl Platform {
    fn open(path: &std::path::Path, root: &RootKey) -> Self {
        let store = Arc::new(SqliteStore::open(path, Arc::new(create_default_registry())).unwrap());
        Self {
            keys: KeyStore::new(root, store.clone()),
            policies: PolicyManager::new(store.clone()),
            engine: PolicyEngine::new(store.clone()),
            store,
        }
    }

    fn decide(&self, request: &AccessRequest) -> Decision {
        let policies = self.policies.policies_for(request.resource_id).unwrap();
        self.engine
            .evaluate(request, &policies, Utc::now())
            .unwrap()
            .decision
    }
}

fn viewer(id: u64) -> AccessRequest {
    AccessRequest::new(MEDIA, UserId(id), Role::User, OWNER)
}

#[test]
fn shared_access_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("mediaguard.db");
    let root = RootKey::generate();

    let blob = {
        let platform = Platform::open(&db, &root);
        let (key, _) = platform.keys.create_key(MEDIA, None).unwrap();
        platform.policies.share_file(MEDIA, &[UserId(5)], OWNER).unwrap();
        encrypt(b"episode one", &key).unwrap()
    };

    let platform = Platform::open(&db, &root);
    assert_eq!(platform.decide(&viewer(5)), Decision::Allow);
    assert_eq!(platform.decide(&viewer(6)), Decision::Deny);

    let key = platform.keys.retrieve_key(MEDIA, &[]).unwrap().unwrap();
    assert_eq!(decrypt(&blob, &key).unwrap(), b"episode one");

    platform.policies.revoke_share(MEDIA, UserId(5)).unwrap();
    assert_eq!(platform.decide(&viewer(5)), Decision::Deny);

    let entries = platform.store.audit_entries(Some(MEDIA)).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].decision, Decision::Allow);
    assert!(entries[0].policy_id.is_some());
}

#[test]
fn split_key_release_and_revocation() {
    let dir = tempfile::tempdir().unwrap();
    let root = RootKey::generate();
    let platform = Platform::open(&dir.path().join("db"), &root);

    let (key, record) = platform
        .keys
        .create_key(MEDIA, Some(SplitParams::new(5, 3)))
        .unwrap();
    assert_eq!(record.total_shares, 5);
    for (index, holder) in [(1u8, 20u64), (2, 21), (3, 22)] {
        platform.keys.assign_holder(MEDIA, index, UserId(holder)).unwrap();
    }

    let shares: Vec<_> = [2u8, 4, 5]
        .iter()
        .map(|&i| platform.keys.issue_share(MEDIA, i).unwrap())
        .collect();
    assert_eq!(platform.keys.retrieve_key(MEDIA, &shares).unwrap(), Some(key));
    assert!(matches!(
        platform.keys.retrieve_key(MEDIA, &shares[..2]),
        Err(Error::InsufficientShares { required: 3, provided: 2 })
    ));

    assert!(platform.keys.revoke_key(MEDIA).unwrap());
    assert_eq!(platform.keys.retrieve_key(MEDIA, &shares).unwrap(), None);

    let info = platform.keys.key_info(MEDIA).unwrap().unwrap();
    assert_eq!(info.status, KeyStatus::Revoked);
    assert_eq!(info.shares[0].holder_id, Some(UserId(20)));
    assert!(info.shares.iter().all(|s| s.status == KeyStatus::Revoked));
}

#[test]
fn rotation_commits_or_aborts_as_a_unit() {
    let dir = tempfile::tempdir().unwrap();
    let root = RootKey::generate();
    let platform = Platform::open(&dir.path().join("db"), &root);

    let (key, _) = platform.keys.create_key(MEDIA, None).unwrap();
    let mut blob = encrypt(b"raw footage", &key).unwrap();

    let aborted = platform
        .keys
        .rotate_key(MEDIA, |_, _| Err(Error::Io(std::io::Error::other("disk full"))));
    assert!(aborted.is_err());
    assert_eq!(platform.keys.retrieve_key(MEDIA, &[]).unwrap(), Some(key));

    platform
        .keys
        .rotate_key(MEDIA, |old, new| {
            blob = encrypt(&decrypt(&blob, old)?, new)?;
            Ok(())
        })
        .unwrap();

    let new_key = platform.keys.retrieve_key(MEDIA, &[]).unwrap().unwrap();
    assert_eq!(decrypt(&blob, &new_key).unwrap(), b"raw footage");
    assert_eq!(platform.keys.list_keys(Some(KeyStatus::Active)).unwrap().len(), 1);
    assert_eq!(platform.keys.list_keys(Some(KeyStatus::Revoked)).unwrap().len(), 1);
}

#[test]
fn wrong_root_key_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db");

    Platform::open(&db, &RootKey::generate())
        .keys
        .create_key(MEDIA, None)
        .unwrap();

    let other = Platform::open(&db, &RootKey::generate());
    assert!(matches!(
        other.keys.retrieve_key(MEDIA, &[]),
        Err(Error::WrongRootKey)
    ));
}

#[test]
fn persisted_policies_keep_their_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db");
    let root = RootKey::generate();

    {
        let platform = Platform::open(&db, &root);
        platform
            .policies
            .create_policy(Policy::new(
                MEDIA,
                PolicyKind::custom(Arc::new(DenyUsers::new([UserId(66)]))),
            ))
            .unwrap();
        platform
            .policies
            .create_policy(Policy::new(MEDIA, PolicyKind::multi_party(2, []).unwrap()))
            .unwrap();
        platform
            .policies
            .share_file_until(MEDIA, &[UserId(7)], OWNER, Utc::now() + Duration::hours(1))
            .unwrap();
    }

    let platform = Platform::open(&db, &root);
    assert_eq!(platform.decide(&viewer(7)), Decision::Allow);
    assert_eq!(platform.decide(&viewer(66)), Decision::Deny);
    assert_eq!(
        platform.decide(&viewer(8).with_approvals([UserId(30)])),
        Decision::RequireShares(1)
    );
    assert_eq!(
        platform.decide(&viewer(8).with_approvals([UserId(30), UserId(31)])),
        Decision::Allow
    );
}
