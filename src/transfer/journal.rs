//! Transfer journal
//!
//! Durable record of in-flight file transfers. When a transfer is interrupted
//! the journal remembers which source it was copying; a later resume checks
//! that the source is unchanged before appending to the partial destination.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TransferError;

/// Transfer direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    fn key_prefix(&self) -> &'static str {
        match self {
            Direction::Upload => "up",
            Direction::Download => "down",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JournalStatus {
    Active,
    /// Stopped with a partial destination left behind
    Interrupted,
    Completed,
    Cancelled,
}

/// One journaled file transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub transfer_id: String,
    pub direction: Direction,
    pub source: String,
    /// Final destination path (not the part file)
    pub destination: String,
    pub source_size: u64,
    pub source_modified: Option<DateTime<Utc>>,
    pub transferred_bytes: u64,
    pub status: JournalStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(
        direction: Direction,
        source: &str,
        destination: &str,
        source_size: u64,
        source_modified: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: uuid::Uuid::new_v4().to_string(),
            direction,
            source: source.to_string(),
            destination: destination.to_string(),
            source_size,
            source_modified,
            transferred_bytes: 0,
            status: JournalStatus::Active,
            error: None,
            started_at: now,
            last_updated: now,
        }
    }

    /// Whether the source still looks like the one this entry was copying
    pub fn matches_source(&self, size: u64, modified: Option<DateTime<Utc>>) -> bool {
        self.source_size == size && self.source_modified == modified
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(
            self.status,
            JournalStatus::Active | JournalStatus::Interrupted
        )
    }

    pub fn mark_interrupted(&mut self, transferred_bytes: u64, error: String) {
        self.status = JournalStatus::Interrupted;
        self.transferred_bytes = transferred_bytes;
        self.error = Some(error);
        self.last_updated = Utc::now();
    }

    pub fn mark_cancelled(&mut self, transferred_bytes: u64) {
        self.status = JournalStatus::Cancelled;
        self.transferred_bytes = transferred_bytes;
        self.last_updated = Utc::now();
    }

    fn key(&self) -> String {
        entry_key(self.direction, &self.destination)
    }
}

fn entry_key(direction: Direction, destination: &str) -> String {
    format!("{}:{}", direction.key_prefix(), destination)
}

#[async_trait]
pub trait TransferJournal: Send + Sync {
    async fn save(&self, entry: &JournalEntry) -> Result<(), TransferError>;

    /// Entry for a destination, if any
    async fn find(
        &self,
        direction: Direction,
        destination: &str,
    ) -> Result<Option<JournalEntry>, TransferError>;

    /// Forget a destination once its transfer completed
    async fn remove(&self, direction: Direction, destination: &str) -> Result<(), TransferError>;

    async fn list_incomplete(&self) -> Result<Vec<JournalEntry>, TransferError>;
}

/// Journal that remembers nothing
pub struct NullJournal;

#[async_trait]
impl TransferJournal for NullJournal {
    async fn save(&self, _entry: &JournalEntry) -> Result<(), TransferError> {
        Ok(())
    }

    async fn find(
        &self,
        _direction: Direction,
        _destination: &str,
    ) -> Result<Option<JournalEntry>, TransferError> {
        Ok(None)
    }

    async fn remove(&self, _direction: Direction, _destination: &str) -> Result<(), TransferError> {
        Ok(())
    }

    async fn list_incomplete(&self) -> Result<Vec<JournalEntry>, TransferError> {
        Ok(vec![])
    }
}

const JOURNAL_TABLE: redb::TableDefinition<&str, &[u8]> =
    redb::TableDefinition::new("transfer_journal");

/// redb-backed journal
pub struct RedbJournal {
    db: redb::Database,
}

impl RedbJournal {
    pub fn open(db_path: &Path) -> Result<Self, TransferError> {
        info!("Opening transfer journal at: {:?}", db_path);

        let db = redb::Database::create(db_path).map_err(|e| {
            TransferError::Storage(format!("Failed to create journal database: {}", e))
        })?;

        let write_txn = db.begin_write().map_err(|e| {
            TransferError::Storage(format!("Failed to begin write transaction: {}", e))
        })?;
        {
            let _table = write_txn.open_table(JOURNAL_TABLE).map_err(|e| {
                TransferError::Storage(format!("Failed to open journal table: {}", e))
            })?;
        }
        write_txn
            .commit()
            .map_err(|e| TransferError::Storage(format!("Failed to commit transaction: {}", e)))?;

        Ok(Self { db })
    }

    /// `journal.redb` next to the config file
    pub fn default_path() -> Result<PathBuf, TransferError> {
        let dir = crate::config::config_dir()
            .map_err(|e| TransferError::Storage(e.to_string()))?;
        std::fs::create_dir_all(&dir).map_err(|e| {
            TransferError::Storage(format!("Failed to create config directory: {}", e))
        })?;
        Ok(dir.join("journal.redb"))
    }
}

#[async_trait]
impl TransferJournal for RedbJournal {
    async fn save(&self, entry: &JournalEntry) -> Result<(), TransferError> {
        debug!(
            "Journal save {}: {} / {} bytes, {:?}",
            entry.destination, entry.transferred_bytes, entry.source_size, entry.status
        );

        let serialized = rmp_serde::to_vec_named(entry)?;
        let key = entry.key();

        let write_txn = self.db.begin_write().map_err(|e| {
            TransferError::Storage(format!("Failed to begin write transaction: {}", e))
        })?;
        {
            let mut table = write_txn.open_table(JOURNAL_TABLE).map_err(|e| {
                TransferError::Storage(format!("Failed to open journal table: {}", e))
            })?;
            table
                .insert(key.as_str(), serialized.as_slice())
                .map_err(|e| TransferError::Storage(format!("Failed to insert entry: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| TransferError::Storage(format!("Failed to commit transaction: {}", e)))
    }

    async fn find(
        &self,
        direction: Direction,
        destination: &str,
    ) -> Result<Option<JournalEntry>, TransferError> {
        let read_txn = self.db.begin_read().map_err(|e| {
            TransferError::Storage(format!("Failed to begin read transaction: {}", e))
        })?;
        let table = read_txn.open_table(JOURNAL_TABLE).map_err(|e| {
            TransferError::Storage(format!("Failed to open journal table: {}", e))
        })?;

        let key = entry_key(direction, destination);
        let value = table
            .get(key.as_str())
            .map_err(|e| TransferError::Storage(format!("Failed to read entry: {}", e)))?;
        match value {
            Some(value) => Ok(Some(rmp_serde::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, direction: Direction, destination: &str) -> Result<(), TransferError> {
        let key = entry_key(direction, destination);
        let write_txn = self.db.begin_write().map_err(|e| {
            TransferError::Storage(format!("Failed to begin write transaction: {}", e))
        })?;
        {
            let mut table = write_txn.open_table(JOURNAL_TABLE).map_err(|e| {
                TransferError::Storage(format!("Failed to open journal table: {}", e))
            })?;
            table
                .remove(key.as_str())
                .map_err(|e| TransferError::Storage(format!("Failed to remove entry: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| TransferError::Storage(format!("Failed to commit transaction: {}", e)))
    }

    async fn list_incomplete(&self) -> Result<Vec<JournalEntry>, TransferError> {
        let read_txn = self.db.begin_read().map_err(|e| {
            TransferError::Storage(format!("Failed to begin read transaction: {}", e))
        })?;
        let table = read_txn.open_table(JOURNAL_TABLE).map_err(|e| {
            TransferError::Storage(format!("Failed to open journal table: {}", e))
        })?;

        let mut results = Vec::new();
        for item in table
            .iter()
            .map_err(|e| TransferError::Storage(format!("Failed to iterate journal: {}", e)))?
        {
            let (_key, value) = item
                .map_err(|e| TransferError::Storage(format!("Failed to read entry: {}", e)))?;
            let entry: JournalEntry = rmp_serde::from_slice(value.value())?;
            if entry.is_incomplete() {
                results.push(entry);
            }
        }

        debug!("Found {} incomplete journal entries", results.len());
        Ok(results)
    }
}
