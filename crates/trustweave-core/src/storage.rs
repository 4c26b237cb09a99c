//! Device-local persistence using redb
//!
//! Holds state that never leaves this device:
//! - the account and device keys
//! - local settings such as the private block list (JSON values)

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;

use crate::error::Result;

const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const LOCAL_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("local_state");

/// Local storage layer over redb
#[derive(Clone)]
pub struct LocalStorage {
    db: Arc<RwLock<Database>>,
}

impl LocalStorage {
    /// Identity storage key (one identity per device)
    const IDENTITY_KEY: &'static str = "local_identity";

    /// Open or create the database at `path`, creating parent directories
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(LOCAL_STATE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local State
    // ═══════════════════════════════════════════════════════════════════════

    /// Read a JSON value stored under `key`
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(LOCAL_STATE_TABLE)?;

        match table.get(key)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Store `value` as JSON under `key`, replacing any previous value
    pub fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOCAL_STATE_TABLE)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        trace!(key, bytes = data.len(), "Local state written");
        Ok(())
    }

    /// Remove the value under `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(LOCAL_STATE_TABLE)?;
            let removed = table.remove(key)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the serialized identity keys
    pub fn save_identity(&self, keys: &[u8]) -> Result<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(Self::IDENTITY_KEY, keys)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the serialized identity keys, `None` before the first run
    pub fn load_identity(&self) -> Result<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        Ok(table.get(Self::IDENTITY_KEY)?.map(|v| v.value().to_vec()))
    }

    /// Whether an identity has been saved
    pub fn has_identity(&self) -> Result<bool> {
        Ok(self.load_identity()?.is_some())
    }
}
