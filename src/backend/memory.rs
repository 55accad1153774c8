//! In-memory reference backend
//!
//! Keeps a whole remote tree in a map. Used by the test-suite and by
//! embedders that need a backend without a network. Supports per-path fault
//! injection and counts backend calls so callers can assert what was (and
//! was not) sent over the "wire".

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest as _, Md5};
use parking_lot::Mutex;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::{
    Backend, Capabilities, ChecksumAlgorithm, DeleteFlags, FileKind, FileSystemInfo, RemoteFile,
    RemoteFileList, RemoteProperties, RemoteReader, RemoteWriter, Rights, SessionInfo,
    SpaceAvailable, UsersGroups, WriteMode,
};
use crate::error::TransferError;
use crate::transfer::path_utils::{
    join_remote_path, normalize_remote_path, remote_file_name, remote_parent,
};

/// Backend operation a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Stat,
    List,
    Read,
    Write,
    Delete,
    Rename,
    ChangeProperties,
    CreateDirectory,
}

/// Error a fault produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NotFound,
    PermissionDenied,
    Timeout,
    ConnectionReset,
    ConnectionLost,
    Protocol,
}

impl FaultKind {
    fn to_error(self, path: &str) -> TransferError {
        match self {
            FaultKind::NotFound => TransferError::NotFound(path.to_string()),
            FaultKind::PermissionDenied => TransferError::PermissionDenied(path.to_string()),
            FaultKind::Timeout => TransferError::Timeout(format!("injected timeout on {}", path)),
            FaultKind::ConnectionReset => {
                TransferError::ConnectionReset(format!("injected reset on {}", path))
            }
            FaultKind::ConnectionLost => {
                TransferError::ConnectionLost(format!("injected disconnect on {}", path))
            }
            FaultKind::Protocol => TransferError::Protocol(format!("injected failure on {}", path)),
        }
    }

    fn to_io_error(self) -> io::Error {
        let kind = match self {
            FaultKind::NotFound => io::ErrorKind::NotFound,
            FaultKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            FaultKind::Timeout => io::ErrorKind::TimedOut,
            FaultKind::ConnectionReset => io::ErrorKind::ConnectionReset,
            FaultKind::ConnectionLost => io::ErrorKind::BrokenPipe,
            FaultKind::Protocol => io::ErrorKind::Other,
        };
        io::Error::new(kind, "injected stream fault")
    }
}

#[derive(Debug, Clone)]
struct Fault {
    op: FaultOp,
    path: String,
    kind: FaultKind,
    /// Stream faults fire after this many bytes
    after_bytes: Option<u64>,
    /// `None` = every time
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
enum NodeData {
    File(Vec<u8>),
    Directory,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    modified: DateTime<Utc>,
    rights: Rights,
    owner: Option<String>,
    group: Option<String>,
}

impl Node {
    fn new(data: NodeData) -> Self {
        let rights = match data {
            NodeData::Directory => Rights::new(0o755),
            _ => Rights::new(0o644),
        };
        Self {
            data,
            modified: Utc::now(),
            rights,
            owner: None,
            group: None,
        }
    }

    fn size(&self) -> u64 {
        match &self.data {
            NodeData::File(bytes) => bytes.len() as u64,
            NodeData::Symlink(target) => target.len() as u64,
            NodeData::Directory => 0,
        }
    }

    fn kind(&self) -> FileKind {
        match self.data {
            NodeData::File(_) => FileKind::File,
            NodeData::Directory => FileKind::Directory,
            NodeData::Symlink(_) => FileKind::Symlink,
        }
    }
}

/// Callback fired after every chunk written: (path, bytes written by this stream)
pub type WriteHook = Arc<dyn Fn(&str, u64) + Send + Sync>;

struct MemoryState {
    nodes: BTreeMap<String, Node>,
    cwd: String,
    home: String,
    faults: Vec<Fault>,
    calls: HashMap<&'static str, usize>,
    write_hook: Option<WriteHook>,
    idle_delay: Duration,
    accounts: UsersGroups,
    fixed_paths: Vec<String>,
    user_name: Option<String>,
}

#[derive(Default)]
struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// In-memory [`Backend`]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<Counters>,
    capabilities: Capabilities,
    active: AtomicBool,
}

impl MemoryBackend {
    /// Create a backend with the given capabilities, a root directory and
    /// `/home` as home and current directory.
    pub fn new(capabilities: Capabilities) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(NodeData::Directory));
        nodes.insert("/home".to_string(), Node::new(NodeData::Directory));

        Self {
            state: Arc::new(Mutex::new(MemoryState {
                nodes,
                cwd: "/home".to_string(),
                home: "/home".to_string(),
                faults: Vec::new(),
                calls: HashMap::new(),
                write_hook: None,
                idle_delay: Duration::ZERO,
                accounts: UsersGroups::default(),
                fixed_paths: Vec::new(),
                user_name: None,
            })),
            counters: Arc::new(Counters::default()),
            capabilities,
            active: AtomicBool::new(true),
        }
    }

    /// Backend supporting every known capability
    pub fn full() -> Self {
        Self::new(Capabilities::all())
    }

    /// Add a file, creating missing parent directories.
    pub fn add_file(&self, path: &str, content: &[u8]) {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        Self::ensure_parents(&mut state, &path);
        state
            .nodes
            .insert(path, Node::new(NodeData::File(content.to_vec())));
    }

    /// Add a directory, creating missing parents.
    pub fn add_dir(&self, path: &str) {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        Self::ensure_parents(&mut state, &path);
        state
            .nodes
            .entry(path)
            .or_insert_with(|| Node::new(NodeData::Directory));
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        Self::ensure_parents(&mut state, &path);
        state
            .nodes
            .insert(path, Node::new(NodeData::Symlink(target.to_string())));
    }

    pub fn set_modified(&self, path: &str, modified: DateTime<Utc>) {
        if let Some(node) = self.state.lock().nodes.get_mut(&normalize_remote_path(path)) {
            node.modified = modified;
        }
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(&normalize_remote_path(path)) {
            Some(Node {
                data: NodeData::File(bytes),
                ..
            }) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state
            .lock()
            .nodes
            .contains_key(&normalize_remote_path(path))
    }

    pub fn rights(&self, path: &str) -> Option<Rights> {
        self.state
            .lock()
            .nodes
            .get(&normalize_remote_path(path))
            .map(|n| n.rights)
    }

    pub fn modified(&self, path: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .nodes
            .get(&normalize_remote_path(path))
            .map(|n| n.modified)
    }

    /// Fail `op` on `path` with `kind`. `times = None` fails forever.
    pub fn inject_fault(&self, op: FaultOp, path: &str, kind: FaultKind, times: Option<u32>) {
        self.state.lock().faults.push(Fault {
            op,
            path: normalize_remote_path(path),
            kind,
            after_bytes: None,
            remaining: times,
        });
    }

    /// Fail a read or write stream on `path` once `after_bytes` have passed.
    pub fn inject_stream_fault(
        &self,
        op: FaultOp,
        path: &str,
        after_bytes: u64,
        kind: FaultKind,
        times: Option<u32>,
    ) {
        self.state.lock().faults.push(Fault {
            op,
            path: normalize_remote_path(path),
            kind,
            after_bytes: Some(after_bytes),
            remaining: times,
        });
    }

    /// Accounts reported besides the owners already present on nodes
    pub fn set_accounts(&self, users: &[&str], groups: &[&str]) {
        let mut state = self.state.lock();
        state.accounts.users = users.iter().map(|u| u.to_string()).collect();
        state.accounts.groups = groups.iter().map(|g| g.to_string()).collect();
    }

    pub fn add_fixed_path(&self, path: &str) {
        self.state.lock().fixed_paths.push(normalize_remote_path(path));
    }

    pub fn set_user_name(&self, name: &str) {
        self.state.lock().user_name = Some(name.to_string());
    }

    pub fn set_write_hook(&self, hook: WriteHook) {
        self.state.lock().write_hook = Some(hook);
    }

    pub fn set_idle_delay(&self, delay: Duration) {
        self.state.lock().idle_delay = delay;
    }

    /// Number of times the named backend method was invoked
    pub fn call_count(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// Total bytes handed out by read streams
    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes_read.load(Ordering::SeqCst)
    }

    /// Total bytes accepted by write streams
    pub fn bytes_written(&self) -> u64 {
        self.counters.bytes_written.load(Ordering::SeqCst)
    }

    fn ensure_parents(state: &mut MemoryState, path: &str) {
        let mut parent = remote_parent(path);
        let mut missing = Vec::new();
        while !state.nodes.contains_key(&parent) {
            missing.push(parent.clone());
            parent = remote_parent(&parent);
        }
        for dir in missing {
            state.nodes.insert(dir, Node::new(NodeData::Directory));
        }
    }

    /// Record the call, resolve the path and fire any matching call-time fault.
    fn enter(&self, method: &'static str, op: Option<FaultOp>, path: &str) -> Result<String, TransferError> {
        let mut state = self.state.lock();
        *state.calls.entry(method).or_insert(0) += 1;

        let resolved = if path.starts_with('/') {
            normalize_remote_path(path)
        } else {
            normalize_remote_path(&join_remote_path(&state.cwd, path))
        };

        if let Some(op) = op {
            if let Some(kind) = Self::take_fault(&mut state, op, &resolved, false) {
                debug!("Injected {:?} fault on {:?} {}", kind, op, resolved);
                return Err(kind.to_error(&resolved));
            }
        }

        Ok(resolved)
    }

    fn take_fault(state: &mut MemoryState, op: FaultOp, path: &str, stream: bool) -> Option<FaultKind> {
        let index = state.faults.iter().position(|f| {
            f.op == op
                && f.path == path
                && f.after_bytes.is_some() == stream
                && f.remaining != Some(0)
        })?;
        let fault = &mut state.faults[index];
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault.kind)
    }

    fn take_stream_fault(&self, op: FaultOp, path: &str) -> Option<(u64, FaultKind)> {
        let mut state = self.state.lock();
        let index = state.faults.iter().position(|f| {
            f.op == op && f.path == path && f.after_bytes.is_some() && f.remaining != Some(0)
        })?;
        let fault = &mut state.faults[index];
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        fault.after_bytes.map(|after| (after, fault.kind))
    }

    fn to_remote_file(path: &str, node: &Node) -> RemoteFile {
        RemoteFile {
            name: remote_file_name(path),
            path: path.to_string(),
            kind: node.kind(),
            size: node.size(),
            modified: Some(node.modified),
            rights: Some(node.rights),
            owner: node.owner.clone(),
            group: node.group.clone(),
            link_target: match &node.data {
                NodeData::Symlink(target) => Some(target.clone()),
                _ => None,
            },
        }
    }

    fn children(state: &MemoryState, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != dir && !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn subtree(state: &MemoryState, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        state
            .nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn require_parent_dir(state: &MemoryState, path: &str) -> Result<(), TransferError> {
        let parent = remote_parent(path);
        match state.nodes.get(&parent) {
            Some(Node {
                data: NodeData::Directory,
                ..
            }) => Ok(()),
            _ => Err(TransferError::NotFound(parent)),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(&self) -> Result<(), TransferError> {
        self.enter("open", None, "/")?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransferError> {
        self.enter("close", None, "/")?;
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            protocol_name: "memory".to_string(),
            server_identification: Some("in-memory reference backend".to_string()),
            host: None,
            user_name: self.state.lock().user_name.clone(),
        }
    }

    async fn file_system_info(&self) -> Result<FileSystemInfo, TransferError> {
        self.enter("file_system_info", None, "/")?;
        Ok(FileSystemInfo {
            protocol_base_name: "memory".to_string(),
            protocol_name: "memory".to_string(),
            capabilities: self.capabilities,
            additional_info: Vec::new(),
        })
    }

    async fn read_directory(&self, path: &str) -> Result<RemoteFileList, TransferError> {
        let path = self.enter("read_directory", Some(FaultOp::List), path)?;
        let state = self.state.lock();
        match state.nodes.get(&path) {
            Some(Node {
                data: NodeData::Directory,
                ..
            }) => {}
            Some(_) => return Err(TransferError::Protocol(format!("{} is not a directory", path))),
            None => return Err(TransferError::NotFound(path)),
        }
        let files = Self::children(&state, &path)
            .into_iter()
            .filter_map(|child| {
                state
                    .nodes
                    .get(&child)
                    .map(|node| Self::to_remote_file(&child, node))
            })
            .collect();
        Ok(RemoteFileList::new(path, files))
    }

    async fn read_file(&self, path: &str) -> Result<RemoteFile, TransferError> {
        let path = self.enter("read_file", Some(FaultOp::Stat), path)?;
        let state = self.state.lock();
        state
            .nodes
            .get(&path)
            .map(|node| Self::to_remote_file(&path, node))
            .ok_or(TransferError::NotFound(path))
    }

    async fn read_symlink(&self, link: &RemoteFile) -> Result<RemoteFile, TransferError> {
        let path = self.enter("read_symlink", Some(FaultOp::Stat), &link.path)?;
        let state = self.state.lock();
        let target = match state.nodes.get(&path) {
            Some(Node {
                data: NodeData::Symlink(target),
                ..
            }) => target.clone(),
            Some(_) => return Err(TransferError::Protocol(format!("{} is not a symlink", path))),
            None => return Err(TransferError::NotFound(path)),
        };
        let resolved = if target.starts_with('/') {
            normalize_remote_path(&target)
        } else {
            normalize_remote_path(&join_remote_path(&remote_parent(&path), &target))
        };
        state
            .nodes
            .get(&resolved)
            .map(|node| Self::to_remote_file(&resolved, node))
            .ok_or(TransferError::NotFound(resolved))
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, TransferError> {
        let path = self.enter("open_read", Some(FaultOp::Read), path)?;
        let data = {
            let state = self.state.lock();
            match state.nodes.get(&path) {
                Some(Node {
                    data: NodeData::File(bytes),
                    ..
                }) => bytes.clone(),
                Some(_) => return Err(TransferError::NotAFile(path)),
                None => return Err(TransferError::NotFound(path)),
            }
        };
        let start = (offset as usize).min(data.len());
        let fault = self.take_stream_fault(FaultOp::Read, &path);
        Ok(Box::new(MemoryReader {
            data,
            pos: start,
            read: 0,
            fault,
            counters: self.counters.clone(),
        }))
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<RemoteWriter, TransferError> {
        let path = self.enter("open_write", Some(FaultOp::Write), path)?;
        {
            let mut state = self.state.lock();
            Self::require_parent_dir(&state, &path)?;
            let existing = state.nodes.get(&path).map(|n| n.kind());
            match existing {
                Some(FileKind::Directory) => return Err(TransferError::NotAFile(path)),
                Some(_) if mode == WriteMode::Append => {}
                _ => {
                    state
                        .nodes
                        .insert(path.clone(), Node::new(NodeData::File(Vec::new())));
                }
            }
        }
        let fault = self.take_stream_fault(FaultOp::Write, &path);
        Ok(Box::new(MemoryWriter {
            state: self.state.clone(),
            counters: self.counters.clone(),
            path,
            written: 0,
            fault,
        }))
    }

    async fn delete_file(&self, path: &str, flags: DeleteFlags) -> Result<(), TransferError> {
        let path = self.enter("delete_file", Some(FaultOp::Delete), path)?;
        let mut state = self.state.lock();
        let is_dir = match state.nodes.get(&path) {
            Some(node) => matches!(node.data, NodeData::Directory),
            None => return Err(TransferError::NotFound(path)),
        };
        if is_dir {
            let subtree = Self::subtree(&state, &path);
            if !subtree.is_empty() {
                let recursive = self.capabilities.contains(Capabilities::RECURSIVE_DELETE)
                    && !flags.contains(DeleteFlags::NO_RECURSIVE);
                if !recursive {
                    return Err(TransferError::Protocol(format!(
                        "directory not empty: {}",
                        path
                    )));
                }
                for key in subtree {
                    state.nodes.remove(&key);
                }
            }
        }
        state.nodes.remove(&path);
        Ok(())
    }

    async fn rename_file(&self, from: &str, to: &str) -> Result<(), TransferError> {
        let from = self.enter("rename_file", Some(FaultOp::Rename), from)?;
        let to = normalize_remote_path(to);
        let mut state = self.state.lock();
        let node = state
            .nodes
            .remove(&from)
            .ok_or_else(|| TransferError::NotFound(from.clone()))?;
        if let Err(e) = Self::require_parent_dir(&state, &to) {
            state.nodes.insert(from, node);
            return Err(e);
        }
        for key in Self::subtree(&state, &from) {
            if let Some(child) = state.nodes.remove(&key) {
                let moved = format!("{}{}", to, &key[from.len()..]);
                state.nodes.insert(moved, child);
            }
        }
        state.nodes.insert(to, node);
        Ok(())
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<(), TransferError> {
        let from = self.enter("copy_file", None, from)?;
        let to = normalize_remote_path(to);
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get(&from)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(from.clone()))?;
        Self::require_parent_dir(&state, &to)?;
        state.nodes.insert(to, node);
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<(), TransferError> {
        let path = self.enter("create_directory", Some(FaultOp::CreateDirectory), path)?;
        let mut state = self.state.lock();
        if state.nodes.contains_key(&path) {
            return Err(TransferError::Protocol(format!("{} already exists", path)));
        }
        Self::require_parent_dir(&state, &path)?;
        state.nodes.insert(path, Node::new(NodeData::Directory));
        Ok(())
    }

    async fn create_link(
        &self,
        path: &str,
        target: &str,
        symbolic: bool,
    ) -> Result<(), TransferError> {
        let path = self.enter("create_link", None, path)?;
        let mut state = self.state.lock();
        Self::require_parent_dir(&state, &path)?;
        let node = if symbolic {
            Node::new(NodeData::Symlink(target.to_string()))
        } else {
            state
                .nodes
                .get(&normalize_remote_path(target))
                .cloned()
                .ok_or_else(|| TransferError::NotFound(target.to_string()))?
        };
        state.nodes.insert(path, node);
        Ok(())
    }

    async fn change_file_properties(
        &self,
        path: &str,
        properties: &RemoteProperties,
    ) -> Result<(), TransferError> {
        let path = self.enter("change_file_properties", Some(FaultOp::ChangeProperties), path)?;
        let mut state = self.state.lock();
        let mut targets = vec![path.clone()];
        if properties.recursive {
            targets.extend(Self::subtree(&state, &path));
        }
        for target in targets {
            let node = state
                .nodes
                .get_mut(&target)
                .ok_or_else(|| TransferError::NotFound(target.clone()))?;
            if let Some(rights) = properties.rights {
                node.rights = rights;
            }
            if let Some(owner) = &properties.owner {
                node.owner = Some(owner.clone());
            }
            if let Some(group) = &properties.group {
                node.group = Some(group.clone());
            }
            if let Some(modified) = properties.modified {
                node.modified = modified;
            }
        }
        Ok(())
    }

    async fn calculate_checksum(
        &self,
        algorithm: ChecksumAlgorithm,
        paths: &[String],
    ) -> Result<HashMap<String, String>, TransferError> {
        self.enter("calculate_checksum", None, "/")?;
        let state = self.state.lock();
        let mut result = HashMap::new();
        for path in paths {
            let resolved = normalize_remote_path(path);
            let bytes = match state.nodes.get(&resolved) {
                Some(Node {
                    data: NodeData::File(bytes),
                    ..
                }) => bytes,
                Some(_) => return Err(TransferError::NotAFile(resolved)),
                None => return Err(TransferError::NotFound(resolved)),
            };
            let digest = match algorithm {
                ChecksumAlgorithm::Md5 => to_hex(&Md5::digest(bytes)),
                ChecksumAlgorithm::Sha256 => to_hex(&Sha256::digest(bytes)),
            };
            result.insert(path.clone(), digest);
        }
        Ok(result)
    }

    async fn space_available(&self, path: &str) -> Result<SpaceAvailable, TransferError> {
        self.enter("space_available", None, path)?;
        const DEVICE_SIZE: u64 = 1 << 30;
        let used: u64 = self.state.lock().nodes.values().map(Node::size).sum();
        let free = DEVICE_SIZE.saturating_sub(used);
        Ok(SpaceAvailable {
            bytes_on_device: DEVICE_SIZE,
            unused_bytes_on_device: free,
            bytes_available_to_user: DEVICE_SIZE,
            unused_bytes_available_to_user: free,
            bytes_per_allocation_unit: 4096,
        })
    }

    async fn current_directory(&self) -> Result<String, TransferError> {
        self.enter("current_directory", None, "/")?;
        Ok(self.state.lock().cwd.clone())
    }

    async fn home_directory(&self) -> Result<String, TransferError> {
        self.enter("home_directory", None, "/")?;
        Ok(self.state.lock().home.clone())
    }

    async fn change_directory(&self, path: &str) -> Result<(), TransferError> {
        let path = self.enter("change_directory", Some(FaultOp::List), path)?;
        let mut state = self.state.lock();
        match state.nodes.get(&path) {
            Some(Node {
                data: NodeData::Directory,
                ..
            }) => {
                state.cwd = path;
                Ok(())
            }
            Some(_) => Err(TransferError::NotAFile(path)),
            None => Err(TransferError::NotFound(path)),
        }
    }

    async fn idle(&self) -> Result<(), TransferError> {
        self.enter("idle", None, "/")?;
        let delay = self.state.lock().idle_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn lookup_users_groups(&self) -> Result<UsersGroups, TransferError> {
        self.enter("lookup_users_groups", None, "/")?;
        let state = self.state.lock();
        let mut users: BTreeSet<String> = state.accounts.users.iter().cloned().collect();
        let mut groups: BTreeSet<String> = state.accounts.groups.iter().cloned().collect();
        for node in state.nodes.values() {
            users.extend(node.owner.iter().cloned());
            groups.extend(node.group.iter().cloned());
        }
        Ok(UsersGroups {
            users: users.into_iter().collect(),
            groups: groups.into_iter().collect(),
        })
    }

    fn fixed_paths(&self) -> Vec<String> {
        self.state.lock().fixed_paths.clone()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
    /// Bytes handed out by this stream
    read: u64,
    fault: Option<(u64, FaultKind)>,
    counters: Arc<Counters>,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let mut n = (this.data.len() - this.pos).min(buf.remaining());
        if let Some((after, kind)) = this.fault {
            if this.read >= after {
                return Poll::Ready(Err(kind.to_io_error()));
            }
            n = n.min((after - this.read) as usize);
        }
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        this.read += n as u64;
        this.counters
            .bytes_read
            .fetch_add(n as u64, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<Counters>,
    path: String,
    written: u64,
    fault: Option<(u64, FaultKind)>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let mut n = buf.len();
        if let Some((after, kind)) = this.fault {
            if this.written >= after {
                return Poll::Ready(Err(kind.to_io_error()));
            }
            n = n.min((after - this.written) as usize);
        }

        let hook = {
            let mut state = this.state.lock();
            match state.nodes.get_mut(&this.path) {
                Some(Node {
                    data: NodeData::File(bytes),
                    modified,
                    ..
                }) => {
                    bytes.extend_from_slice(&buf[..n]);
                    *modified = Utc::now();
                }
                _ => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} vanished while writing", this.path),
                    )))
                }
            }
            state.write_hook.clone()
        };

        this.written += n as u64;
        this.counters
            .bytes_written
            .fetch_add(n as u64, Ordering::SeqCst);
        if let Some(hook) = hook {
            hook(&this.path, this.written);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listing_returns_direct_children_only() {
        let backend = MemoryBackend::full();
        backend.add_file("/data/a.txt", b"a");
        backend.add_file("/data/sub/b.txt", b"bb");

        let list = backend.read_directory("/data").await.unwrap();
        let names: Vec<_> = list.iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert!(list.find("sub").unwrap().is_directory());
    }

    #[tokio::test]
    async fn test_read_from_offset_and_append() {
        let backend = MemoryBackend::full();
        backend.add_file("/f.bin", b"0123456789");

        let mut reader = backend.open_read("/f.bin", 4).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"456789");

        let mut writer = backend.open_write("/f.bin", WriteMode::Append).await.unwrap();
        writer.write_all(b"ab").await.unwrap();
        assert_eq!(backend.file_data("/f.bin").unwrap(), b"0123456789ab");
        assert_eq!(backend.bytes_written(), 2);
    }

    #[tokio::test]
    async fn test_call_fault_fires_limited_times() {
        let backend = MemoryBackend::full();
        backend.add_file("/x", b"x");
        backend.inject_fault(FaultOp::Stat, "/x", FaultKind::Timeout, Some(1));

        assert!(matches!(
            backend.read_file("/x").await,
            Err(TransferError::Timeout(_))
        ));
        assert!(backend.read_file("/x").await.is_ok());
        assert_eq!(backend.call_count("read_file"), 2);
    }

    #[tokio::test]
    async fn test_stream_fault_after_bytes() {
        let backend = MemoryBackend::full();
        backend.inject_stream_fault(FaultOp::Write, "/out", 3, FaultKind::ConnectionReset, None);

        let mut writer = backend.open_write("/out", WriteMode::Create).await.unwrap();
        let err = writer.write_all(b"abcdef").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(backend.file_data("/out").unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_delete_non_empty_dir_needs_recursive_capability() {
        let backend = MemoryBackend::new(Capabilities::empty());
        backend.add_file("/d/a", b"a");
        assert!(backend.delete_file("/d", DeleteFlags::empty()).await.is_err());

        let backend = MemoryBackend::full();
        backend.add_file("/d/a", b"a");
        backend.delete_file("/d", DeleteFlags::empty()).await.unwrap();
        assert!(!backend.exists("/d/a"));
        assert!(!backend.exists("/d"));
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let backend = MemoryBackend::full();
        backend.add_file("/a/x/1.txt", b"1");
        backend.rename_file("/a/x", "/a/y").await.unwrap();
        assert!(backend.exists("/a/y/1.txt"));
        assert!(!backend.exists("/a/x"));
    }

    #[tokio::test]
    async fn test_users_groups_include_current_owners() {
        let backend = MemoryBackend::full();
        backend.set_accounts(&["root", "alice"], &["staff"]);
        backend.add_file("/data/a.txt", b"a");
        backend
            .change_file_properties(
                "/data/a.txt",
                &RemoteProperties {
                    owner: Some("bob".into()),
                    group: Some("wheel".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let accounts = backend.lookup_users_groups().await.unwrap();
        assert_eq!(accounts.users, vec!["alice", "bob", "root"]);
        assert_eq!(accounts.groups, vec!["staff", "wheel"]);
        assert!(accounts.has_user("bob"));
        assert!(!accounts.has_group("nobody"));
    }

    #[tokio::test]
    async fn test_default_descriptive_operations() {
        let backend = MemoryBackend::full();
        backend.add_file("/data/a.txt", b"a");
        backend.add_file("/data/b.txt", b"bb");
        backend.add_fixed_path("/mnt/share/");

        assert_eq!(backend.file_url("/data/a.txt"), "memory:///data/a.txt");
        assert_eq!(backend.fixed_paths(), vec!["/mnt/share"]);
        assert!(backend.is_temporary_transfer_file("a.txt.filepart"));
        assert!(!backend.is_temporary_transfer_file("a.txt"));

        let files = backend
            .load_files_properties(&["/data/a.txt".to_string(), "/data/b.txt".to_string()])
            .await
            .unwrap();
        let sizes: Vec<_> = files.iter().map(|f| f.size).collect();
        assert_eq!(sizes, vec![1, 2]);
        assert_eq!(backend.call_count("read_file"), 2);
    }

    #[tokio::test]
    async fn test_checksum_md5() {
        let backend = MemoryBackend::full();
        backend.add_file("/abc", b"abc");
        let sums = backend
            .calculate_checksum(ChecksumAlgorithm::Md5, &["/abc".to_string()])
            .await
            .unwrap();
        assert_eq!(sums["/abc"], "900150983cd24fb0d6963f7d28e17f72");
    }
}
