//! Audit sink for policy evaluations.

use std::sync::RwLock;

use crate::model::PolicyLogEntry;
use mediaguard_common::{Error, Result};

/// Append-only destination for [`PolicyLogEntry`] records.
pub trait AuditSink: Send + Sync {
    /// Persist one entry. Entries are never updated or deleted.
    fn record(&self, entry: &PolicyLogEntry) -> Result<()>;
}

/// In-memory audit log.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<PolicyLogEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Result<Vec<PolicyLogEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Storage("Audit log lock poisoned".to_string()))?;
        Ok(entries.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, entry: &PolicyLogEntry) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::Storage("Audit log lock poisoned".to_string()))?;
        entries.push(entry.clone());
        Ok(())
    }
}
