//! Backend data types

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::Capabilities;
use crate::transfer::path_utils::join_remote_path;

/// Kind of a remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    /// Devices, sockets, fifos
    Special,
}

/// Unix permission bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rights(u32);

impl Rights {
    pub const fn new(mode: u32) -> Self {
        Self(mode & 0o7777)
    }

    pub fn mode(&self) -> u32 {
        self.0
    }

    /// Parse an octal string such as "755"
    pub fn from_octal(text: &str) -> Option<Self> {
        u32::from_str_radix(text, 8).ok().map(Self::new)
    }
}

impl Default for Rights {
    fn default() -> Self {
        Self(0o644)
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0 & 0o777)
    }
}

/// Snapshot of one remote entry, as returned by a listing.
///
/// Never mutated; a fresh listing supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub rights: Option<Rights>,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Symlink target (if kind is Symlink)
    pub link_target: Option<String>,
}

impl RemoteFile {
    pub fn file(directory: &str, name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            path: join_remote_path(directory, name),
            kind: FileKind::File,
            size,
            modified: None,
            rights: None,
            owner: None,
            group: None,
            link_target: None,
        }
    }

    pub fn directory(parent: &str, name: &str) -> Self {
        Self {
            kind: FileKind::Directory,
            ..Self::file(parent, name, 0)
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// "." and ".." entries some protocols include in listings
    pub fn is_parent_or_self(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Ordered listing of one directory
#[derive(Debug, Clone)]
pub struct RemoteFileList {
    pub directory: String,
    pub files: Vec<RemoteFile>,
    /// When the listing was read; older than any later mutation means stale
    pub fetched_at: Instant,
}

impl RemoteFileList {
    pub fn new(directory: impl Into<String>, files: Vec<RemoteFile>) -> Self {
        Self {
            directory: directory.into(),
            files,
            fetched_at: Instant::now(),
        }
    }

    pub fn find(&self, name: &str) -> Option<&RemoteFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteFile> {
        self.files.iter().filter(|f| !f.is_parent_or_self())
    }
}

/// Properties to apply with `change_file_properties`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteProperties {
    pub rights: Option<Rights>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    /// Apply to directory contents as well
    #[serde(default)]
    pub recursive: bool,
}

impl RemoteProperties {
    pub fn is_empty(&self) -> bool {
        self.rights.is_none()
            && self.owner.is_none()
            && self.group.is_none()
            && self.modified.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha-256",
        }
    }
}

/// Free/total space for a path, valid only at fetch time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceAvailable {
    pub bytes_on_device: u64,
    pub unused_bytes_on_device: u64,
    pub bytes_available_to_user: u64,
    pub unused_bytes_available_to_user: u64,
    pub bytes_per_allocation_unit: u32,
}

/// Descriptive information about the connected session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub protocol_name: String,
    /// Server banner / identification string
    pub server_identification: Option<String>,
    pub host: Option<String>,
    /// Account the session authenticated as
    pub user_name: Option<String>,
}

/// Accounts that can be given as owner / group in [`RemoteProperties`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsersGroups {
    pub users: Vec<String>,
    pub groups: Vec<String>,
}

impl UsersGroups {
    pub fn has_user(&self, name: &str) -> bool {
        self.users.iter().any(|u| u == name)
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g == name)
    }
}

/// Descriptive information about the remote file system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSystemInfo {
    pub protocol_base_name: String,
    pub protocol_name: String,
    pub capabilities: Capabilities,
    /// Free-form details (extensions, server flavour...)
    pub additional_info: Vec<String>,
}

/// How a remote file is opened for writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate
    Create,
    /// Append to the existing content
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeleteFlags(u32);

bitflags::bitflags! {
    impl DeleteFlags: u32 {
        /// Refuse to delete directories
        const NO_RECURSIVE = 0x01;
        /// Backend-specific alternative delete (e.g. move to trash)
        const ALTERNATIVE = 0x02;
        /// Delete non-empty directories without further checks
        const FORCE_DELETE = 0x04;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rights_octal() {
        let rights = Rights::from_octal("755").unwrap();
        assert_eq!(rights.mode(), 0o755);
        assert_eq!(rights.to_string(), "755");
        assert!(Rights::from_octal("9z").is_none());
    }

    #[test]
    fn test_listing_skips_parent_entries() {
        let list = RemoteFileList::new(
            "/home",
            vec![
                RemoteFile::directory("/home", "."),
                RemoteFile::directory("/home", ".."),
                RemoteFile::file("/home", "a.txt", 3),
            ],
        );
        let names: Vec<_> = list.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt"]);
        assert_eq!(list.find("a.txt").unwrap().path, "/home/a.txt");
    }
}
