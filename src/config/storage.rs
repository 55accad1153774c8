//! Configuration Storage
//!
//! Reads and writes `config.json`.
//! Config location: ~/.remote-transfer on macOS/Linux, %APPDATA%\RemoteTransfer on Windows

use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{TransferConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No home directory to keep the configuration in")]
    NoConfigDir,

    #[error("Config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config file version {found} is newer than this build understands ({supported})")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Directory holding the config file and the transfer journal
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("RemoteTransfer"));
        }
        dirs::home_dir()
            .map(|home| home.join(".remote-transfer"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".remote-transfer"))
            .ok_or(StorageError::NoConfigDir)
    }
}

pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the default location
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(fs::create_dir_all(dir).await?),
            _ => Ok(()),
        }
    }

    /// Load configuration from disk.
    ///
    /// A missing file yields defaults. A corrupt one is backed up and
    /// replaced by defaults.
    pub async fn load(&self) -> Result<TransferConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TransferConfig::default())
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<TransferConfig>(&contents) {
            Ok(config) => {
                if config.version > CONFIG_VERSION {
                    return Err(StorageError::VersionTooNew {
                        found: config.version,
                        supported: CONFIG_VERSION,
                    });
                }
                Ok(config)
            }
            Err(parse_err) => {
                tracing::warn!("Ignoring unreadable config {:?}: {}", self.path, parse_err);
                match self.backup().await {
                    Ok(saved) => tracing::warn!("Kept a copy of it at {:?}", saved),
                    Err(e) => tracing::error!("Could not keep a copy of {:?}: {}", self.path, e),
                }
                Ok(TransferConfig::default())
            }
        }
    }

    /// Write the whole file next to the target, then swap it in.
    pub async fn save(&self, config: &TransferConfig) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(config)?;
        self.ensure_dir().await?;

        let staged = self.staging_path();
        {
            let mut out = fs::File::create(&staged).await?;
            out.write_all(&body).await?;
            out.sync_all().await?;
        }
        if let Err(e) = fs::rename(&staged, &self.path).await {
            let _ = fs::remove_file(&staged).await;
            return Err(e.into());
        }

        tracing::debug!("Saved config to {:?}", self.path);
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current file aside as `config.json.backup.<timestamp>`
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let target = self.path.with_extension(format!("json.backup.{}", stamp));
        if self.exists().await {
            fs::copy(&self.path, &target).await?;
        }
        Ok(target)
    }
}
