//! Remote session facade
//!
//! [`RemoteSession`] is the only way the transfer engine reaches a backend.
//! It caches the capability set and the session descriptions, keeps the
//! current/home directory and a listing cache, and refuses capability-gated
//! calls before they reach the backend.
//!
//! A session is not safe for concurrent use; share it as
//! `Arc<tokio::sync::Mutex<RemoteSession>>`.

pub mod cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

pub use cache::DirectoryCache;

use crate::backend::{
    Backend, Capabilities, Capability, ChecksumAlgorithm, DeleteFlags, FileSystemInfo,
    RemoteFile, RemoteFileList, RemoteProperties, RemoteReader, RemoteWriter, SessionInfo,
    SpaceAvailable, UsersGroups, WriteMode,
};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::transfer::path_utils::{
    is_absolute_remote_path, join_remote_path, normalize_remote_path, remote_parent,
};
use crate::transfer::{
    BatchResult, ProgressEvent, TransferControl, TransferOrchestrator, TransferRequest,
};

/// Default keep-alive bound
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default lifetime of a cached listing
pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(30);

pub struct RemoteSession {
    backend: Arc<dyn Backend>,
    capabilities: Capabilities,
    session_info: SessionInfo,
    file_system_info: Option<FileSystemInfo>,
    users_groups: Option<UsersGroups>,
    current_directory: Option<String>,
    home_directory: Option<String>,
    cache: DirectoryCache,
    idle_timeout: Duration,
}

impl RemoteSession {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let capabilities = backend.capabilities();
        let session_info = backend.session_info();
        Self {
            backend,
            capabilities,
            session_info,
            file_system_info: None,
            users_groups: None,
            current_directory: None,
            home_directory: None,
            cache: DirectoryCache::new(DEFAULT_LISTING_TTL),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: &TransferConfig) -> Self {
        let mut session = Self::new(backend);
        session.idle_timeout = config.idle_timeout();
        session.cache = DirectoryCache::new(config.listing_ttl());
        session
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Connect the backend and learn the starting directory.
    pub async fn open(&mut self) -> Result<(), TransferError> {
        self.backend.open().await?;
        let cwd = self.backend.current_directory().await?;
        info!(
            "Session open ({}), current directory {}",
            self.session_info.protocol_name, cwd
        );
        self.current_directory = Some(normalize_remote_path(&cwd));
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), TransferError> {
        self.cache.clear();
        self.backend.close().await
    }

    pub fn is_active(&self) -> bool {
        self.backend.is_active()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_capable(&self, capability: Capability) -> bool {
        self.capabilities.supports(capability)
    }

    /// Fail with `UnsupportedCapability` unless the backend supports it.
    pub fn require(&self, capability: Capability) -> Result<(), TransferError> {
        if self.is_capable(capability) {
            Ok(())
        } else {
            debug!("Refusing {:?}: not supported by backend", capability);
            Err(TransferError::UnsupportedCapability(capability))
        }
    }

    pub fn session_info(&self) -> &SessionInfo {
        &self.session_info
    }

    /// Fetched once, then served from memory
    pub async fn file_system_info(&mut self) -> Result<&FileSystemInfo, TransferError> {
        if self.file_system_info.is_none() {
            self.file_system_info = Some(self.backend.file_system_info().await?);
        }
        self.file_system_info
            .as_ref()
            .ok_or_else(|| TransferError::Protocol("file system info unavailable".into()))
    }

    pub fn user_name(&self) -> Option<&str> {
        self.session_info.user_name.as_deref()
    }

    pub fn fixed_paths(&self) -> Vec<String> {
        self.backend.fixed_paths()
    }

    pub fn is_temporary_transfer_file(&self, name: &str) -> bool {
        self.backend.is_temporary_transfer_file(name)
    }

    pub async fn file_url(&mut self, path: &str) -> Result<String, TransferError> {
        let path = self.absolute_path(path).await?;
        Ok(self.backend.file_url(&path))
    }

    /// Candidate owners and groups for [`Self::change_file_properties`].
    /// Looked up once per session.
    pub async fn lookup_users_groups(&mut self) -> Result<&UsersGroups, TransferError> {
        self.require(Capability::UserGroupListing)?;
        if self.users_groups.is_none() {
            self.users_groups = Some(self.backend.lookup_users_groups().await?);
        }
        self.users_groups
            .as_ref()
            .ok_or_else(|| TransferError::Protocol("user and group list unavailable".into()))
    }

    /// Stat several entries in one go, bypassing the listing cache.
    pub async fn load_files_properties(
        &mut self,
        paths: &[String],
    ) -> Result<Vec<RemoteFile>, TransferError> {
        let mut absolute = Vec::with_capacity(paths.len());
        for path in paths {
            absolute.push(self.absolute_path(path).await?);
        }
        self.backend.load_files_properties(&absolute).await
    }

    pub async fn current_directory(&mut self) -> Result<String, TransferError> {
        if let Some(cwd) = &self.current_directory {
            return Ok(cwd.clone());
        }
        let cwd = normalize_remote_path(&self.backend.current_directory().await?);
        self.current_directory = Some(cwd.clone());
        Ok(cwd)
    }

    pub async fn home_directory(&mut self) -> Result<String, TransferError> {
        if let Some(home) = &self.home_directory {
            return Ok(home.clone());
        }
        let home = normalize_remote_path(&self.backend.home_directory().await?);
        self.home_directory = Some(home.clone());
        Ok(home)
    }

    /// Resolve `path` against the current directory, collapsing `.`/`..`.
    pub async fn absolute_path(&mut self, path: &str) -> Result<String, TransferError> {
        if is_absolute_remote_path(path) {
            return Ok(normalize_remote_path(path));
        }
        let cwd = self.current_directory().await?;
        Ok(normalize_remote_path(&join_remote_path(&cwd, path)))
    }

    pub async fn change_directory(&mut self, path: &str) -> Result<(), TransferError> {
        let target = self.absolute_path(path).await?;
        self.backend.change_directory(&target).await?;
        debug!("Changed directory to {}", target);
        self.current_directory = Some(target);
        Ok(())
    }

    /// Like [`Self::change_directory`] but a no-op when `path` is already current.
    pub async fn cached_change_directory(&mut self, path: &str) -> Result<(), TransferError> {
        let target = self.absolute_path(path).await?;
        if self.current_directory.as_deref() == Some(target.as_str()) {
            return Ok(());
        }
        self.change_directory(&target).await
    }

    pub async fn read_directory(&mut self, path: &str) -> Result<RemoteFileList, TransferError> {
        let path = self.absolute_path(path).await?;
        if let Some(list) = self.cache.get(&path) {
            return Ok(list.clone());
        }
        let list = self.backend.read_directory(&path).await?;
        self.cache.insert(list.clone());
        Ok(list)
    }

    pub async fn read_file(&mut self, path: &str) -> Result<RemoteFile, TransferError> {
        let path = self.absolute_path(path).await?;
        self.backend.read_file(&path).await
    }

    pub async fn read_symlink(&mut self, link: &RemoteFile) -> Result<RemoteFile, TransferError> {
        self.backend.read_symlink(link).await
    }

    /// Reading from a non-zero offset needs `Resume`.
    pub async fn open_read(&mut self, path: &str, offset: u64) -> Result<RemoteReader, TransferError> {
        if offset > 0 {
            self.require(Capability::Resume)?;
        }
        let path = self.absolute_path(path).await?;
        self.backend.open_read(&path, offset).await
    }

    /// Appending needs `Resume`.
    pub async fn open_write(&mut self, path: &str, mode: WriteMode) -> Result<RemoteWriter, TransferError> {
        if mode == WriteMode::Append {
            self.require(Capability::Resume)?;
        }
        let path = self.absolute_path(path).await?;
        self.cache.invalidate(&path);
        self.backend.open_write(&path, mode).await
    }

    /// Delete a file or directory.
    ///
    /// Non-empty directories are removed in one call when the backend can
    /// delete recursively, otherwise child by child, deepest first.
    pub async fn delete_file(&mut self, path: &str, flags: DeleteFlags) -> Result<(), TransferError> {
        let path = self.absolute_path(path).await?;
        self.cache.invalidate(&path);

        if flags.contains(DeleteFlags::NO_RECURSIVE) || self.is_capable(Capability::RecursiveDelete) {
            return self.backend.delete_file(&path, flags).await;
        }

        let entry = self.backend.read_file(&path).await?;
        if !entry.is_directory() {
            return self.backend.delete_file(&path, flags).await;
        }
        self.delete_tree(&path, flags).await
    }

    async fn delete_tree(&mut self, root: &str, flags: DeleteFlags) -> Result<(), TransferError> {
        // (path, children already removed)
        let mut stack = vec![(root.to_string(), false)];
        while let Some((dir, emptied)) = stack.pop() {
            if emptied {
                self.backend.delete_file(&dir, flags).await?;
                continue;
            }
            stack.push((dir.clone(), true));
            let listing = self.backend.read_directory(&dir).await?;
            for child in listing.iter() {
                if child.is_directory() {
                    stack.push((child.path.clone(), false));
                } else {
                    self.backend.delete_file(&child.path, flags).await?;
                }
            }
            self.cache.invalidate(&dir);
        }
        debug!("Deleted {} child by child", root);
        Ok(())
    }

    /// Rename within a directory is always available; moving between
    /// directories needs `RemoteMove`.
    pub async fn rename_file(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        let from = self.absolute_path(from).await?;
        let to = self.absolute_path(to).await?;
        if remote_parent(&from) != remote_parent(&to) {
            self.require(Capability::RemoteMove)?;
        }
        self.cache.invalidate(&from);
        self.cache.invalidate(&to);
        self.backend.rename_file(&from, &to).await
    }

    pub async fn copy_file(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        self.require(Capability::RemoteCopy)?;
        let from = self.absolute_path(from).await?;
        let to = self.absolute_path(to).await?;
        self.cache.invalidate(&to);
        self.backend.copy_file(&from, &to).await
    }

    pub async fn create_directory(&mut self, path: &str) -> Result<(), TransferError> {
        let path = self.absolute_path(path).await?;
        self.cache.invalidate(&path);
        self.backend.create_directory(&path).await
    }

    pub async fn create_link(
        &mut self,
        path: &str,
        target: &str,
        symbolic: bool,
    ) -> Result<(), TransferError> {
        self.require(if symbolic {
            Capability::SymbolicLink
        } else {
            Capability::HardLink
        })?;
        let path = self.absolute_path(path).await?;
        self.cache.invalidate(&path);
        self.backend.create_link(&path, target, symbolic).await
    }

    /// Each requested property needs its own capability.
    pub async fn change_file_properties(
        &mut self,
        path: &str,
        properties: &RemoteProperties,
    ) -> Result<(), TransferError> {
        if properties.rights.is_some() {
            self.require(Capability::ChangeMode)?;
        }
        if properties.owner.is_some() || properties.group.is_some() {
            self.require(Capability::ChangeOwnership)?;
        }
        if properties.modified.is_some() {
            self.require(Capability::PreserveTimestamp)?;
        }
        if properties.is_empty() {
            return Ok(());
        }
        let path = self.absolute_path(path).await?;
        self.cache.invalidate(&path);
        self.backend.change_file_properties(&path, properties).await
    }

    pub async fn calculate_checksum(
        &mut self,
        algorithm: ChecksumAlgorithm,
        paths: &[String],
    ) -> Result<HashMap<String, String>, TransferError> {
        self.require(Capability::Checksum)?;
        let mut absolute = Vec::with_capacity(paths.len());
        for path in paths {
            absolute.push(self.absolute_path(path).await?);
        }
        let sums = self.backend.calculate_checksum(algorithm, &absolute).await?;
        // Key results by the caller's spelling of each path
        Ok(paths
            .iter()
            .zip(absolute.iter())
            .filter_map(|(asked, abs)| sums.get(abs).map(|sum| (asked.clone(), sum.clone())))
            .collect())
    }

    /// Never cached
    pub async fn space_available(&mut self, path: &str) -> Result<SpaceAvailable, TransferError> {
        self.require(Capability::SpaceAvailable)?;
        let path = self.absolute_path(path).await?;
        self.backend.space_available(&path).await
    }

    /// Keep-alive, bounded by the idle timeout.
    pub async fn idle(&mut self) -> Result<(), TransferError> {
        match tokio::time::timeout(self.idle_timeout, self.backend.idle()).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(format!(
                "keep-alive got no answer within {:?}",
                self.idle_timeout
            ))),
        }
    }

    /// Upload local files into a remote directory.
    pub async fn copy_to_remote(
        &mut self,
        orchestrator: &TransferOrchestrator,
        request: &TransferRequest,
        control: Arc<TransferControl>,
        events: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<BatchResult, TransferError> {
        orchestrator.upload(self, request, control, events).await
    }

    /// Download remote files into a local directory.
    pub async fn copy_to_local(
        &mut self,
        orchestrator: &TransferOrchestrator,
        request: &TransferRequest,
        control: Arc<TransferControl>,
        events: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<BatchResult, TransferError> {
        orchestrator.download(self, request, control, events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Rights};

    fn session_with(backend: MemoryBackend) -> (Arc<MemoryBackend>, RemoteSession) {
        let backend = Arc::new(backend);
        let session = RemoteSession::new(backend.clone());
        (backend, session)
    }

    #[tokio::test]
    async fn test_checksum_without_capability_never_reaches_backend() {
        let (backend, mut session) = session_with(MemoryBackend::new(Capabilities::empty()));
        backend.add_file("/home/a.txt", b"abc");

        let err = session
            .calculate_checksum(ChecksumAlgorithm::Md5, &["a.txt".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::UnsupportedCapability(Capability::Checksum)
        ));
        assert_eq!(backend.call_count("calculate_checksum"), 0);
    }

    #[tokio::test]
    async fn test_checksum_keys_follow_caller_paths() {
        let (backend, mut session) = session_with(MemoryBackend::full());
        backend.add_file("/home/a.txt", b"abc");
        session.open().await.unwrap();

        let sums = session
            .calculate_checksum(ChecksumAlgorithm::Md5, &["a.txt".to_string()])
            .await
            .unwrap();
        assert_eq!(sums["a.txt"], "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn test_gated_calls_fail_without_contacting_backend() {
        let (backend, mut session) = session_with(MemoryBackend::new(Capabilities::empty()));
        backend.add_file("/home/a.txt", b"abc");

        assert!(session.space_available("/").await.is_err());
        assert!(session.copy_file("/home/a.txt", "/home/b.txt").await.is_err());
        assert!(session.create_link("/home/l", "/home/a.txt", true).await.is_err());
        assert!(session.open_read("/home/a.txt", 1).await.is_err());
        assert!(session
            .change_file_properties(
                "/home/a.txt",
                &RemoteProperties {
                    rights: Some(Rights::new(0o600)),
                    ..Default::default()
                }
            )
            .await
            .is_err());

        for method in [
            "space_available",
            "copy_file",
            "create_link",
            "open_read",
            "change_file_properties",
        ] {
            assert_eq!(backend.call_count(method), 0, "{} reached backend", method);
        }
    }

    #[tokio::test]
    async fn test_cached_change_directory_skips_round_trip() {
        let (backend, mut session) = session_with(MemoryBackend::full());
        backend.add_dir("/srv/data");
        session.open().await.unwrap();

        session.cached_change_directory("/srv/data").await.unwrap();
        session.cached_change_directory("/srv/data").await.unwrap();
        session.cached_change_directory("../data/.").await.unwrap();

        assert_eq!(backend.call_count("change_directory"), 1);
        assert_eq!(session.current_directory().await.unwrap(), "/srv/data");
    }

    #[tokio::test]
    async fn test_absolute_path() {
        let (_backend, mut session) = session_with(MemoryBackend::full());
        session.open().await.unwrap();

        assert_eq!(session.absolute_path("x/../y").await.unwrap(), "/home/y");
        assert_eq!(session.absolute_path("/a/./b").await.unwrap(), "/a/b");
        assert_eq!(session.absolute_path("..").await.unwrap(), "/");
    }

    #[tokio::test]
    async fn test_listing_cache_invalidated_by_mutation() {
        let (backend, mut session) = session_with(MemoryBackend::full());
        backend.add_file("/d/a", b"a");
        backend.add_file("/d/b", b"b");

        assert_eq!(session.read_directory("/d").await.unwrap().len(), 2);
        assert_eq!(session.read_directory("/d").await.unwrap().len(), 2);
        assert_eq!(backend.call_count("read_directory"), 1);

        session.delete_file("/d/a", DeleteFlags::empty()).await.unwrap();
        assert_eq!(session.read_directory("/d").await.unwrap().len(), 1);
        assert_eq!(backend.call_count("read_directory"), 2);
    }

    #[tokio::test]
    async fn test_recursive_delete_fallback() {
        let (backend, mut session) = session_with(MemoryBackend::new(Capabilities::empty()));
        backend.add_file("/t/a.txt", b"a");
        backend.add_file("/t/sub/b.txt", b"b");
        backend.add_dir("/t/sub/empty");

        session.delete_file("/t", DeleteFlags::empty()).await.unwrap();

        assert!(!backend.exists("/t"));
        assert!(!backend.exists("/t/sub/b.txt"));
        assert!(backend.exists("/home"));
    }

    #[tokio::test]
    async fn test_cross_directory_rename_needs_remote_move() {
        let (backend, mut session) = session_with(MemoryBackend::new(Capabilities::empty()));
        backend.add_file("/a/x", b"x");
        backend.add_dir("/b");

        session.rename_file("/a/x", "/a/y").await.unwrap();
        let err = session.rename_file("/a/y", "/b/y").await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnsupportedCapability(Capability::RemoteMove)
        ));
        assert!(backend.exists("/a/y"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_is_bounded() {
        let (backend, session) = session_with(MemoryBackend::full());
        backend.set_idle_delay(Duration::from_secs(60));
        let mut session = session;
        session.idle_timeout = Duration::from_secs(5);

        let err = session.idle().await.unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_users_groups_need_capability_and_are_cached() {
        let caps = Capabilities::all() - Capabilities::USER_GROUP_LISTING;
        let (backend, mut session) = session_with(MemoryBackend::new(caps));
        let err = session.lookup_users_groups().await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnsupportedCapability(Capability::UserGroupListing)
        ));
        assert_eq!(backend.call_count("lookup_users_groups"), 0);

        let (backend, mut session) = session_with(MemoryBackend::full());
        backend.set_accounts(&["alice"], &["staff"]);
        assert!(session.lookup_users_groups().await.unwrap().has_user("alice"));
        assert!(session.lookup_users_groups().await.unwrap().has_group("staff"));
        assert_eq!(backend.call_count("lookup_users_groups"), 1);
    }

    #[tokio::test]
    async fn test_descriptive_queries_resolve_relative_paths() {
        let backend = Arc::new(MemoryBackend::full());
        backend.set_user_name("alice");
        backend.add_fixed_path("/srv");
        backend.add_file("/home/a.txt", b"abc");
        let mut session = RemoteSession::new(backend.clone());

        assert_eq!(session.user_name(), Some("alice"));
        assert_eq!(session.fixed_paths(), vec!["/srv"]);
        assert_eq!(session.file_url("a.txt").await.unwrap(), "memory:///home/a.txt");
        assert!(session.is_temporary_transfer_file("a.txt.filepart"));

        let files = session
            .load_files_properties(&["a.txt".to_string()])
            .await
            .unwrap();
        assert_eq!(files[0].path, "/home/a.txt");
        assert_eq!(files[0].size, 3);
    }
}
