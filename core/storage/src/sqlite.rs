//! SQLite-backed key records, policies and audit log.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use mediaguard_common::{Error, PolicyId, RecordId, ResourceId, Result, UserId};
use mediaguard_crypto::WrappedToken;
use mediaguard_kms::{KeyRecord, KeyRepository, KeyShare, KeyStatus};
use mediaguard_policy::{
    AuditSink, Policy, PolicyKind, PolicyLogEntry, PolicyRepository, PolicySpec, RuleRegistry,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS key_records (
        id TEXT PRIMARY KEY,
        resource_id INTEGER NOT NULL,
        wrapped_key TEXT,
        total_shares INTEGER NOT NULL,
        threshold INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        revoked_at TEXT
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_key
        ON key_records(resource_id) WHERE status = 'active';

    CREATE TABLE IF NOT EXISTS key_shares (
        record_id TEXT NOT NULL REFERENCES key_records(id),
        share_index INTEGER NOT NULL,
        encrypted_share TEXT NOT NULL,
        holder_id INTEGER,
        status TEXT NOT NULL,
        PRIMARY KEY (record_id, share_index)
    );

    CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        resource_id INTEGER NOT NULL,
        spec TEXT NOT NULL,
        priority INTEGER NOT NULL,
        enabled INTEGER NOT NULL,
        created_by INTEGER,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_policies_resource ON policies(resource_id);

    CREATE TABLE IF NOT EXISTS policy_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        requester_id INTEGER NOT NULL,
        resource_id INTEGER NOT NULL,
        policy_id TEXT,
        decision TEXT NOT NULL,
        reason TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );
"#;

// SQLite integers are signed; u64 ids and counts are stored as i64 and
// cast back, which round-trips every value.
const RECORD_COLUMNS: &str =
    "id, resource_id, wrapped_key, total_shares, threshold, status, created_at, revoked_at";

const POLICY_COLUMNS: &str = "id, resource_id, spec, priority, enabled, created_by, created_at";

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Map "no rows" to `None`.
fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}

fn fmt_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Bad timestamp '{}': {}", text, e)))
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| Error::Storage(format!("Bad id '{}': {}", text, e)))
}

struct RecordRow {
    id: String,
    resource_id: u64,
    wrapped_key: Option<String>,
    total_shares: usize,
    threshold: usize,
    status: String,
    created_at: String,
    revoked_at: Option<String>,
}

impl RecordRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            resource_id: row.get::<_, i64>(1)? as u64,
            wrapped_key: row.get(2)?,
            total_shares: row.get::<_, i64>(3)? as usize,
            threshold: row.get::<_, i64>(4)? as usize,
            status: row.get(5)?,
            created_at: row.get(6)?,
            revoked_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<KeyRecord> {
        Ok(KeyRecord {
            id: RecordId::from_uuid(parse_uuid(&self.id)?),
            resource_id: ResourceId(self.resource_id),
            wrapped_key: self
                .wrapped_key
                .as_deref()
                .map(WrappedToken::from_text)
                .transpose()?,
            total_shares: self.total_shares,
            threshold: self.threshold,
            status: self.status.parse()?,
            created_at: parse_time(&self.created_at)?,
            revoked_at: self.revoked_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

struct PolicyRow {
    id: String,
    resource_id: u64,
    spec: String,
    priority: i32,
    enabled: bool,
    created_by: Option<u64>,
    created_at: String,
}

impl PolicyRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            resource_id: row.get::<_, i64>(1)? as u64,
            spec: row.get(2)?,
            priority: row.get(3)?,
            enabled: row.get::<_, i32>(4)? != 0,
            created_by: row.get::<_, Option<i64>>(5)?.map(|u| u as u64),
            created_at: row.get(6)?,
        })
    }

    fn into_policy(self, rules: &RuleRegistry) -> Result<Policy> {
        let spec: PolicySpec =
            serde_json::from_str(&self.spec).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Policy {
            id: PolicyId::from_uuid(parse_uuid(&self.id)?),
            resource_id: ResourceId(self.resource_id),
            kind: PolicyKind::from_spec(spec, rules)?,
            priority: self.priority,
            enabled: self.enabled,
            created_by: self.created_by.map(UserId),
            created_at: parse_time(&self.created_at)?,
        })
    }
}

/// Single-file store for key records, policies and the audit log.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    rules: Arc<RuleRegistry>,
}

impl SqliteStore {
    /// Create or open a database.
    ///
    /// `rules` rebuilds persisted custom policies.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>, rules: Arc<RuleRegistry>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        info!(path = %db_path.as_ref().display(), "Database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            rules,
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory(rules: Arc<RuleRegistry>) -> Result<Self> {
        Self::open(":memory:", rules)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Database connection lock poisoned".to_string()))
    }

    fn insert_record_rows(conn: &Connection, record: &KeyRecord, shares: &[KeyShare]) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO key_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                RECORD_COLUMNS
            ),
            params![
                record.id.to_string(),
                record.resource_id.0 as i64,
                record.wrapped_key.as_ref().map(|t| t.to_text()),
                record.total_shares as i64,
                record.threshold as i64,
                record.status.as_str(),
                fmt_time(&record.created_at),
                record.revoked_at.as_ref().map(fmt_time),
            ],
        )
        .map_err(db_err)?;

        for share in shares {
            conn.execute(
                r#"
                INSERT INTO key_shares (record_id, share_index, encrypted_share, holder_id, status)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    share.record_id.to_string(),
                    share.share_index,
                    share.encrypted_share.to_text(),
                    share.holder_id.map(|u| u.0 as i64),
                    share.status.as_str(),
                ],
            )
            .map_err(db_err)?;
        }
        Ok(())
    }

    fn revoke_rows(conn: &Connection, record: RecordId, at: DateTime<Utc>) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE key_records SET status = 'revoked', revoked_at = ?2 WHERE id = ?1 AND status = 'active'",
                params![record.to_string(), fmt_time(&at)],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Ok(false);
        }
        conn.execute(
            "UPDATE key_shares SET status = 'revoked' WHERE record_id = ?1",
            params![record.to_string()],
        )
        .map_err(db_err)?;
        Ok(true)
    }

    fn load_shares(conn: &Connection, record: RecordId) -> Result<Vec<KeyShare>> {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT share_index, encrypted_share, holder_id, status
                FROM key_shares WHERE record_id = ?1 ORDER BY share_index
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![record.to_string()], |row| {
                Ok((
                    row.get::<_, u8>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?.map(|u| u as u64),
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(index, share, holder, status)| -> Result<KeyShare> {
                Ok(KeyShare {
                    record_id: record,
                    share_index: index,
                    encrypted_share: WrappedToken::from_text(&share)?,
                    holder_id: holder.map(UserId),
                    status: status.parse()?,
                })
            })
            .collect()
    }

    fn query_records(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<KeyRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, RecordRow::read)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    fn query_one_record(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Option<KeyRecord>> {
        let conn = self.lock()?;
        let row = optional(conn.query_row(sql, args, RecordRow::read))?;
        row.map(RecordRow::into_record).transpose()
    }

    /// Audit entries, oldest first, optionally for one resource.
    pub fn audit_entries(&self, resource: Option<ResourceId>) -> Result<Vec<PolicyLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT requester_id, resource_id, policy_id, decision, reason, timestamp
                FROM policy_log
                WHERE ?1 IS NULL OR resource_id = ?1
                ORDER BY id
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![resource.map(|r| r.0 as i64)], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(requester, resource, policy, decision, reason, timestamp)| -> Result<PolicyLogEntry> {
                Ok(PolicyLogEntry {
                    requester_id: UserId(requester),
                    resource_id: ResourceId(resource),
                    policy_id: policy
                        .as_deref()
                        .map(|p| parse_uuid(p).map(PolicyId::from_uuid))
                        .transpose()?,
                    decision: decision.parse()?,
                    reason,
                    timestamp: parse_time(&timestamp)?,
                })
            })
            .collect()
    }
}

impl KeyRepository for SqliteStore {
    fn insert_record(&self, record: &KeyRecord, shares: &[KeyShare]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let active: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM key_records WHERE resource_id = ?1 AND status = 'active'",
                params![record.resource_id.0 as i64],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if active > 0 {
            return Err(Error::Validation(format!(
                "Resource {} already has an active key",
                record.resource_id
            )));
        }

        Self::insert_record_rows(&tx, record, shares)?;
        tx.commit().map_err(db_err)?;
        debug!(record = %record.id, shares = shares.len(), "Key record inserted");
        Ok(())
    }

    fn active_record(&self, resource: ResourceId) -> Result<Option<KeyRecord>> {
        self.query_one_record(
            &format!(
                "SELECT {} FROM key_records WHERE resource_id = ?1 AND status = 'active'",
                RECORD_COLUMNS
            ),
            params![resource.0 as i64],
        )
    }

    fn latest_record(&self, resource: ResourceId) -> Result<Option<KeyRecord>> {
        self.query_one_record(
            &format!(
                "SELECT {} FROM key_records WHERE resource_id = ?1 ORDER BY rowid DESC LIMIT 1",
                RECORD_COLUMNS
            ),
            params![resource.0 as i64],
        )
    }

    fn list_records(&self, status: Option<KeyStatus>) -> Result<Vec<KeyRecord>> {
        self.query_records(
            &format!(
                "SELECT {} FROM key_records WHERE ?1 IS NULL OR status = ?1 ORDER BY rowid",
                RECORD_COLUMNS
            ),
            params![status.map(|s| s.as_str())],
        )
    }

    fn shares_for(&self, record: RecordId) -> Result<Vec<KeyShare>> {
        let conn = self.lock()?;
        Self::load_shares(&conn, record)
    }

    fn active_snapshot(&self, resource: ResourceId) -> Result<Option<(KeyRecord, Vec<KeyShare>)>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let row = optional(tx.query_row(
            &format!(
                "SELECT {} FROM key_records WHERE resource_id = ?1 AND status = 'active'",
                RECORD_COLUMNS
            ),
            params![resource.0 as i64],
            RecordRow::read,
        ))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = row.into_record()?;
        let shares = Self::load_shares(&tx, record.id)?;
        tx.commit().map_err(db_err)?;
        Ok(Some((record, shares)))
    }

    fn revoke_record(&self, record: RecordId, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let revoked = Self::revoke_rows(&tx, record, at)?;
        tx.commit().map_err(db_err)?;
        Ok(revoked)
    }

    fn replace_record(
        &self,
        old: RecordId,
        at: DateTime<Utc>,
        new: &KeyRecord,
        shares: &[KeyShare],
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        if !Self::revoke_rows(&tx, old, at)? {
            return Err(Error::Validation(format!("Record {} is not active", old)));
        }
        Self::insert_record_rows(&tx, new, shares)?;
        tx.commit().map_err(db_err)?;
        debug!(old = %old, new = %new.id, "Key record replaced");
        Ok(())
    }

    fn set_share_holder(
        &self,
        record: RecordId,
        index: u8,
        holder: Option<UserId>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE key_shares SET holder_id = ?3 WHERE record_id = ?1 AND share_index = ?2",
                params![record.to_string(), index, holder.map(|u| u.0 as i64)],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }
}

impl SqliteStore {
    fn policy_params(policy: &Policy) -> Result<(String, String)> {
        let spec = serde_json::to_string(&policy.kind.to_spec())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok((policy.id.to_string(), spec))
    }
}

impl PolicyRepository for SqliteStore {
    fn insert(&self, policy: &Policy) -> Result<()> {
        let (id, spec) = Self::policy_params(policy)?;
        let conn = self.lock()?;
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM policies WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if exists > 0 {
            return Err(Error::Validation(format!("Policy {} already exists", id)));
        }

        conn.execute(
            &format!(
                "INSERT INTO policies ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                POLICY_COLUMNS
            ),
            params![
                id,
                policy.resource_id.0 as i64,
                spec,
                policy.priority,
                policy.enabled as i32,
                policy.created_by.map(|u| u.0 as i64),
                fmt_time(&policy.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn update(&self, policy: &Policy) -> Result<()> {
        let (id, spec) = Self::policy_params(policy)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE policies
                SET resource_id = ?2, spec = ?3, priority = ?4, enabled = ?5, created_by = ?6, created_at = ?7
                WHERE id = ?1
                "#,
                params![
                    id,
                    policy.resource_id.0 as i64,
                    spec,
                    policy.priority,
                    policy.enabled as i32,
                    policy.created_by.map(|u| u.0 as i64),
                    fmt_time(&policy.created_at),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Policy {}", id)));
        }
        Ok(())
    }

    fn delete(&self, id: PolicyId) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute("DELETE FROM policies WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    fn get(&self, id: PolicyId) -> Result<Option<Policy>> {
        let row = {
            let conn = self.lock()?;
            optional(conn.query_row(
                &format!("SELECT {} FROM policies WHERE id = ?1", POLICY_COLUMNS),
                params![id.to_string()],
                PolicyRow::read,
            ))?
        };
        row.map(|r| r.into_policy(&self.rules)).transpose()
    }

    fn list_for(&self, resource: ResourceId) -> Result<Vec<Policy>> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM policies WHERE resource_id = ?1 ORDER BY created_at, id",
                    POLICY_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![resource.0 as i64], PolicyRow::read)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows
        };
        rows.into_iter()
            .map(|r| r.into_policy(&self.rules))
            .collect()
    }
}

impl AuditSink for SqliteStore {
    fn record(&self, entry: &PolicyLogEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO policy_log (requester_id, resource_id, policy_id, decision, reason, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.requester_id.0 as i64,
                entry.resource_id.0 as i64,
                entry.policy_id.map(|p| p.to_string()),
                entry.decision.to_string(),
                entry.reason,
                fmt_time(&entry.timestamp),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}
