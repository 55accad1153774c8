//! Configuration Types
//!
//! Engine settings persisted as JSON. Every field has a default so older or
//! partial files keep loading.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transfer::chunk::{ChunkSettings, DEFAULT_CHUNK_SIZE, DEFAULT_IO_TIMEOUT};
use crate::transfer::copy_param::CopyParam;
use crate::transfer::retry::RetryConfig;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Journal location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    /// `None` = `journal.redb` in the config directory
    pub path: Option<PathBuf>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// Root of `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub version: u32,
    pub retry: RetryConfig,
    /// First chunk size in bytes
    pub chunk_size: usize,
    /// Let the chunk size follow the measured throughput
    pub adaptive_chunks: bool,
    /// A read or write stalled this long fails with a timeout
    pub io_timeout_secs: u64,
    /// Bound on a keep-alive round trip
    pub idle_timeout_secs: u64,
    /// How long a directory listing stays cached; 0 disables the cache
    pub listing_ttl_secs: u64,
    /// Minimum gap between two progress events
    pub progress_interval_ms: u64,
    pub journal: JournalConfig,
    /// Used when a request does not bring its own
    pub copy_param: CopyParam,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            retry: RetryConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            adaptive_chunks: true,
            io_timeout_secs: DEFAULT_IO_TIMEOUT.as_secs(),
            idle_timeout_secs: 30,
            listing_ttl_secs: 30,
            progress_interval_ms: 100,
            journal: JournalConfig::default(),
            copy_param: CopyParam::default(),
        }
    }
}

impl TransferConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.listing_ttl_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn chunk_settings(&self) -> ChunkSettings {
        ChunkSettings {
            initial_chunk_size: self.chunk_size.max(1),
            adaptive: self.adaptive_chunks,
            io_timeout: Duration::from_secs(self.io_timeout_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::copy_param::OverwritePolicy;

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "version": 1, "chunk_size": 4096, "journal": { "enabled": false } }"#;
        let config: TransferConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.chunk_size, 4096);
        assert!(!config.journal.enabled);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.copy_param.overwrite_policy, OverwritePolicy::Ask);
        assert_eq!(config.listing_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_timeouts_are_clamped() {
        let config = TransferConfig {
            io_timeout_secs: 0,
            idle_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.idle_timeout(), Duration::from_secs(1));
        assert_eq!(config.chunk_settings().io_timeout, Duration::from_secs(1));
    }
}
