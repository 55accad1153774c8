//! Protocol backend contract
//!
//! Every protocol adapter (SFTP, SCP, FTP, WebDAV, object storage...)
//! implements [`Backend`]. The transfer engine only ever talks to
//! `Arc<dyn Backend>` through [`crate::session::RemoteSession`], which adds
//! capability checks and directory caching on top.

pub mod capability;
pub mod memory;
pub mod types;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use capability::{Capabilities, Capability};
pub use memory::MemoryBackend;
pub use types::*;

use crate::error::TransferError;
use crate::transfer::path_utils::is_part_file;

/// Byte stream reading a remote file
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte stream writing a remote file
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Operations a protocol adapter provides.
///
/// Implementations need not be safe for concurrent use by several callers:
/// the session serialises all calls. Capability-gated methods may assume
/// they are only called when [`Backend::capabilities`] advertises them.
///
/// Mutating calls may make earlier [`RemoteFileList`]s stale; the backend
/// does not track that.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Establish the underlying connection.
    async fn open(&self) -> Result<(), TransferError>;

    /// Tear the connection down. Must be idempotent.
    async fn close(&self) -> Result<(), TransferError>;

    fn is_active(&self) -> bool;

    /// Optional operations supported. Must not change while the session lives.
    fn capabilities(&self) -> Capabilities;

    fn session_info(&self) -> SessionInfo;

    async fn file_system_info(&self) -> Result<FileSystemInfo, TransferError>;

    async fn read_directory(&self, path: &str) -> Result<RemoteFileList, TransferError>;

    /// Single-entry stat
    async fn read_file(&self, path: &str) -> Result<RemoteFile, TransferError>;

    /// Resolve a symlink to the entry it points to
    async fn read_symlink(&self, link: &RemoteFile) -> Result<RemoteFile, TransferError>;

    /// Open a remote file for reading, starting at `offset`.
    ///
    /// A non-zero offset requires [`Capability::Resume`].
    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, TransferError>;

    /// Open a remote file for writing.
    ///
    /// [`WriteMode::Append`] requires [`Capability::Resume`].
    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<RemoteWriter, TransferError>;

    async fn delete_file(&self, path: &str, flags: DeleteFlags) -> Result<(), TransferError>;

    async fn rename_file(&self, from: &str, to: &str) -> Result<(), TransferError>;

    async fn copy_file(&self, from: &str, to: &str) -> Result<(), TransferError>;

    async fn create_directory(&self, path: &str) -> Result<(), TransferError>;

    async fn create_link(
        &self,
        path: &str,
        target: &str,
        symbolic: bool,
    ) -> Result<(), TransferError>;

    async fn change_file_properties(
        &self,
        path: &str,
        properties: &RemoteProperties,
    ) -> Result<(), TransferError>;

    async fn calculate_checksum(
        &self,
        algorithm: ChecksumAlgorithm,
        paths: &[String],
    ) -> Result<HashMap<String, String>, TransferError>;

    async fn space_available(&self, path: &str) -> Result<SpaceAvailable, TransferError>;

    async fn current_directory(&self) -> Result<String, TransferError>;

    async fn home_directory(&self) -> Result<String, TransferError>;

    async fn change_directory(&self, path: &str) -> Result<(), TransferError>;

    /// Keep-alive, sent by the session while no transfer is running.
    async fn idle(&self) -> Result<(), TransferError>;

    /// Owners and groups known to the server.
    ///
    /// Requires [`Capability::UserGroupListing`].
    async fn lookup_users_groups(&self) -> Result<UsersGroups, TransferError> {
        Err(TransferError::UnsupportedCapability(
            Capability::UserGroupListing,
        ))
    }

    /// Fresh properties for several entries. Protocols with a bulk stat
    /// override this; the default stats one path at a time.
    async fn load_files_properties(
        &self,
        paths: &[String],
    ) -> Result<Vec<RemoteFile>, TransferError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(self.read_file(path).await?);
        }
        Ok(files)
    }

    /// URL naming an absolute `path` on this server
    fn file_url(&self, path: &str) -> String {
        let info = self.session_info();
        format!(
            "{}://{}{}",
            info.protocol_name.to_ascii_lowercase(),
            info.host.unwrap_or_default(),
            path
        )
    }

    /// Locations the server always offers besides the home directory
    fn fixed_paths(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether `name` is an unfinished transfer this engine left behind
    fn is_temporary_transfer_file(&self, name: &str) -> bool {
        is_part_file(name)
    }
}
