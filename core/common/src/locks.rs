//! Per-resource mutual exclusion.
//!
//! Mutations that must be single-writer per resource take the guard for
//! that resource only; unrelated resources proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Error, ResourceId, Result};

/// Lazily created lock per resource id.
///
/// Entries live only while some caller holds or waits for them.
#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<ResourceId, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<ResourceId, Arc<Mutex<()>>>>> {
        self.locks
            .lock()
            .map_err(|_| Error::Storage("Lock table poisoned".to_string()))
    }

    fn handle(&self, resource: ResourceId) -> Result<Arc<Mutex<()>>> {
        Ok(self.table()?.entry(resource).or_default().clone())
    }

    /// Drop the table entry once only the table and `handle` refer to it.
    ///
    /// Handles are cloned under the table lock, so the count cannot grow
    /// while it is checked.
    fn release(&self, resource: ResourceId, handle: Arc<Mutex<()>>) -> Result<()> {
        let mut table = self.table()?;
        if Arc::strong_count(&handle) == 2 {
            table.remove(&resource);
        }
        drop(handle);
        Ok(())
    }

    /// Run `f` while holding the lock for `resource`.
    pub fn with_lock<T>(&self, resource: ResourceId, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let handle = self.handle(resource)?;
        let result = {
            let _guard = handle
                .lock()
                .map_err(|_| Error::Storage(format!("Lock for resource {} poisoned", resource)))?;
            f()
        };
        self.release(resource, handle)?;
        result
    }

    /// Number of resources whose lock is currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Whether no resource lock is in use.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
