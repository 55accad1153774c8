//! Configuration Management Module
//!
//! Engine settings (retry, chunking, timeouts, journal, default copy
//! parameters) and their persistent storage.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{JournalConfig, TransferConfig, CONFIG_VERSION};
