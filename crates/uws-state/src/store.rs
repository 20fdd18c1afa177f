//! StatusStore: redb-backed snapshot of every monitored service.
//!
//! One row per service holding its latest `ServiceStatus`, JSON-serialized
//! into redb's `&[u8]` value column. Each write commits in its own
//! transaction, so readers always observe a complete status for a service.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::STATUS;
use crate::types::{ServiceId, ServiceStatus};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe status store backed by redb.
#[derive(Clone)]
pub struct StatusStore {
    db: Arc<Database>,
}

impl StatusStore {
    /// Open (or create) a persistent status store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "status store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory status store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory status store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(STATUS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Commit a service's status. Returns `false` without opening a write
    /// transaction when the stored value is already identical.
    pub fn write(&self, status: &ServiceStatus) -> StateResult<bool> {
        let key = status.table_key();
        let value = serde_json::to_vec(status).map_err(map_err!(Serialize))?;

        {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(STATUS).map_err(map_err!(Table))?;
            if let Some(existing) = table.get(key).map_err(map_err!(Read))? {
                if existing.value() == value.as_slice() {
                    return Ok(false);
                }
            }
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATUS).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service_id = %key, state = %status.state, "status committed");
        Ok(true)
    }

    /// Get the last committed status of a service.
    pub fn get(&self, service_id: &str) -> StateResult<Option<ServiceStatus>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUS).map_err(map_err!(Table))?;
        match table.get(service_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let status: ServiceStatus =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// Every service's last committed status, keyed by service id.
    pub fn snapshot(&self) -> StateResult<BTreeMap<ServiceId, ServiceStatus>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUS).map_err(map_err!(Table))?;
        let mut results = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let status: ServiceStatus =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.insert(key.value().to_string(), status);
        }
        Ok(results)
    }

    /// Delete a service's status. Returns true if it existed.
    pub fn delete(&self, service_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(STATUS).map_err(map_err!(Table))?;
            existed = table.remove(service_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%service_id, existed, "status deleted");
        Ok(existed)
    }

    /// Drop every row whose service id is not in `keep`. Returns the number
    /// of rows removed.
    pub fn retain(&self, keep: &HashSet<ServiceId>) -> StateResult<u32> {
        // Collect stale keys in a read transaction first.
        let stale: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(STATUS).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let k = key.value();
                if !keep.contains(k) {
                    stale.push(k.to_string());
                }
            }
            stale
        };
        if stale.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATUS).map_err(map_err!(Table))?;
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(removed = stale.len(), "stale statuses pruned");
        Ok(stale.len() as u32)
    }
}
