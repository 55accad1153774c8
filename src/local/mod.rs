//! Local filesystem access
//!
//! The orchestrator never touches `tokio::fs` directly; it goes through
//! [`LocalFileSystem`] so tests and embedders can substitute their own.

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};
use tracing::debug;

use crate::backend::{FileKind, Rights};
use crate::error::TransferError;

pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local directory entry
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub rights: Option<Rights>,
}

impl LocalFile {
    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[async_trait]
pub trait LocalFileSystem: Send + Sync {
    async fn stat(&self, path: &str) -> Result<LocalFile, TransferError>;

    /// Entries of a directory, sorted by name
    async fn list(&self, path: &str) -> Result<Vec<LocalFile>, TransferError>;

    async fn open_read(&self, path: &str, offset: u64) -> Result<LocalReader, TransferError>;

    /// Create/truncate, or append when `append` is set
    async fn open_write(&self, path: &str, append: bool) -> Result<LocalWriter, TransferError>;

    async fn create_dir(&self, path: &str) -> Result<(), TransferError>;

    async fn remove_file(&self, path: &str) -> Result<(), TransferError>;

    /// Remove a directory; only an empty one unless `recursive`
    async fn remove_dir(&self, path: &str, recursive: bool) -> Result<(), TransferError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransferError>;

    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<(), TransferError>;

    async fn set_rights(&self, path: &str, rights: Rights) -> Result<(), TransferError>;
}

/// [`LocalFileSystem`] on top of `tokio::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFileSystem;

impl DiskFileSystem {
    fn to_local_file(path: &Path, meta: &std::fs::Metadata) -> LocalFile {
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else if meta.is_file() {
            FileKind::File
        } else {
            FileKind::Special
        };

        #[cfg(unix)]
        let rights = {
            use std::os::unix::fs::PermissionsExt;
            Some(Rights::new(meta.permissions().mode()))
        };
        #[cfg(not(unix))]
        let rights = None;

        LocalFile {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_string_lossy().to_string(),
            kind,
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            rights,
        }
    }
}

#[async_trait]
impl LocalFileSystem for DiskFileSystem {
    async fn stat(&self, path: &str) -> Result<LocalFile, TransferError> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))?;
        Ok(Self::to_local_file(Path::new(path), &meta))
    }

    async fn list(&self, path: &str) -> Result<Vec<LocalFile>, TransferError> {
        let mut dir = fs::read_dir(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| TransferError::from_io(e, path))?
        {
            let entry_path = entry.path();
            match fs::metadata(&entry_path).await {
                Ok(meta) => entries.push(Self::to_local_file(&entry_path, &meta)),
                Err(e) => match fs::symlink_metadata(&entry_path).await {
                    // Dangling link: listed, but nothing to copy
                    Ok(meta) => {
                        debug!("Dangling link {:?}: {}", entry_path, e);
                        entries.push(LocalFile {
                            kind: FileKind::Special,
                            ..Self::to_local_file(&entry_path, &meta)
                        });
                    }
                    // Deleted while listing
                    Err(_) => debug!("Skipping {:?}: {}", entry_path, e),
                },
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<LocalReader, TransferError> {
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str, append: bool) -> Result<LocalWriter, TransferError> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransferError> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        fs::remove_file(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))
    }

    async fn remove_dir(&self, path: &str, recursive: bool) -> Result<(), TransferError> {
        let result = if recursive {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_dir(path).await
        };
        result.map_err(|e| TransferError::from_io(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransferError> {
        fs::rename(from, to)
            .await
            .map_err(|e| TransferError::from_io(e, from))
    }

    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<(), TransferError> {
        let owned = path.to_string();
        let time = SystemTime::from(modified);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().write(true).open(&owned)?;
            file.set_modified(time)
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
        .map_err(|e| TransferError::from_io(e, path))
    }

    #[cfg(unix)]
    async fn set_rights(&self, path: &str, rights: Rights) -> Result<(), TransferError> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(rights.mode()))
            .await
            .map_err(|e| TransferError::from_io(e, path))
    }

    #[cfg(not(unix))]
    async fn set_rights(&self, _path: &str, _rights: Rights) -> Result<(), TransferError> {
        Ok(())
    }
}
