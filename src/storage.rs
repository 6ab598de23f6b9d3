use crate::crypto::Hash;
use crate::types::Height;
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const TABLE_META: TableDefinition<&str, Vec<u8>> = TableDefinition::new("meta");
const KEY_GLOBAL_FINALITY: &str = "global_finality";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(Box<redb::DatabaseError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Custom error: {0}")]
    Custom(String),
}

impl From<redb::DatabaseError> for StorageError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Database(Box::new(e))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(e: redb::TableError) -> Self {
        Self::Table(Box::new(e))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(Box::new(e))
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(e: redb::CommitError) -> Self {
        Self::Commit(Box::new(e))
    }
}

/// The globally final block, the only state this subsystem persists.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalityRecord {
    pub height: Height,
    pub hash: Hash,
}

pub trait FinalityStore: Send + Sync {
    fn save_global_finality(&self, record: &FinalityRecord) -> Result<(), StorageError>;
    fn get_global_finality(&self) -> Result<Option<FinalityRecord>, StorageError>;
}

// -----------------------------------------------------------------------------
// In-Memory Storage
// -----------------------------------------------------------------------------
#[derive(Clone, Default)]
pub struct MemStorage {
    global: Arc<Mutex<Option<FinalityRecord>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FinalityStore for MemStorage {
    fn save_global_finality(&self, record: &FinalityRecord) -> Result<(), StorageError> {
        *self.global.lock().unwrap_or_else(PoisonError::into_inner) = Some(*record);
        Ok(())
    }

    fn get_global_finality(&self) -> Result<Option<FinalityRecord>, StorageError> {
        Ok(*self.global.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// -----------------------------------------------------------------------------
// Redb Storage
// -----------------------------------------------------------------------------
pub struct RedbStorage {
    db: Database,
}

impl RedbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let p = path.as_ref();
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Custom(format!("Failed to create DB dir: {}", e)))?;
        }
        let db = Database::create(p)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TABLE_META)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }
}

impl FinalityStore for RedbStorage {
    fn save_global_finality(&self, record: &FinalityRecord) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_META)?;
            let val = bincode::serialize(record)?;
            table.insert(KEY_GLOBAL_FINALITY, val)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_global_finality(&self) -> Result<Option<FinalityRecord>, StorageError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_META)?;
        if let Some(val) = table.get(KEY_GLOBAL_FINALITY)? {
            let record = bincode::deserialize(&val.value())?;
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }
}
