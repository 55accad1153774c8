//! Backend capability set
//!
//! Backends advertise optional operations as a [`Capabilities`] bit set.
//! Call sites never test bits directly; they ask for a [`Capability`].

use serde::{Deserialize, Serialize};

/// Optional operation a backend may or may not support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    SymbolicLink,
    HardLink,
    /// chmod-style permission change
    ChangeMode,
    /// owner / group change
    ChangeOwnership,
    /// Delete a non-empty directory in one call
    RecursiveDelete,
    /// Server-side rename / move
    RemoteMove,
    /// Server-side copy
    RemoteCopy,
    Checksum,
    SpaceAvailable,
    /// Read from an offset / append to an existing file
    Resume,
    /// Set the modification time of a remote file
    PreserveTimestamp,
    /// Enumerate the users and groups that can own files
    UserGroupListing,
}

impl Capability {
    pub const ALL: [Capability; 12] = [
        Capability::SymbolicLink,
        Capability::HardLink,
        Capability::ChangeMode,
        Capability::ChangeOwnership,
        Capability::RecursiveDelete,
        Capability::RemoteMove,
        Capability::RemoteCopy,
        Capability::Checksum,
        Capability::SpaceAvailable,
        Capability::Resume,
        Capability::PreserveTimestamp,
        Capability::UserGroupListing,
    ];

    /// The flag backing this capability.
    pub fn flag(self) -> Capabilities {
        match self {
            Capability::SymbolicLink => Capabilities::SYMBOLIC_LINK,
            Capability::HardLink => Capabilities::HARD_LINK,
            Capability::ChangeMode => Capabilities::CHANGE_MODE,
            Capability::ChangeOwnership => Capabilities::CHANGE_OWNERSHIP,
            Capability::RecursiveDelete => Capabilities::RECURSIVE_DELETE,
            Capability::RemoteMove => Capabilities::REMOTE_MOVE,
            Capability::RemoteCopy => Capabilities::REMOTE_COPY,
            Capability::Checksum => Capabilities::CHECKSUM,
            Capability::SpaceAvailable => Capabilities::SPACE_AVAILABLE,
            Capability::Resume => Capabilities::RESUME,
            Capability::PreserveTimestamp => Capabilities::PRESERVE_TIMESTAMP,
            Capability::UserGroupListing => Capabilities::USER_GROUP_LISTING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u32);

bitflags::bitflags! {
    impl Capabilities: u32 {
        const SYMBOLIC_LINK = 0x0000_0001;
        const HARD_LINK = 0x0000_0002;
        const CHANGE_MODE = 0x0000_0004;
        const CHANGE_OWNERSHIP = 0x0000_0008;
        const RECURSIVE_DELETE = 0x0000_0010;
        const REMOTE_MOVE = 0x0000_0020;
        const REMOTE_COPY = 0x0000_0040;
        const CHECKSUM = 0x0000_0080;
        const SPACE_AVAILABLE = 0x0000_0100;
        const RESUME = 0x0000_0200;
        const PRESERVE_TIMESTAMP = 0x0000_0400;
        const USER_GROUP_LISTING = 0x0000_0800;
    }
}

impl Capabilities {
    /// Build a set from raw bits; bits this version does not know are kept
    /// but never reported as a capability.
    pub fn from_raw(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.contains(capability.flag())
    }

    /// Iterate the known capabilities in the set.
    pub fn list(&self) -> Vec<Capability> {
        Capability::ALL
            .iter()
            .copied()
            .filter(|c| self.supports(*c))
            .collect()
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Capabilities::empty(), |acc, c| acc | c.flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_typed_query() {
        let caps: Capabilities = [Capability::Checksum, Capability::Resume]
            .into_iter()
            .collect();

        assert!(caps.supports(Capability::Checksum));
        assert!(caps.supports(Capability::Resume));
        assert!(!caps.supports(Capability::SymbolicLink));
        assert_eq!(caps.list(), vec![Capability::Checksum, Capability::Resume]);
    }

    #[test]
    fn test_unknown_bits_are_ignored() {
        let caps = Capabilities::from_raw(0x8000_0000 | 0x0000_0004);
        assert!(caps.supports(Capability::ChangeMode));
        assert_eq!(caps.list(), vec![Capability::ChangeMode]);
    }

    #[test]
    fn test_every_capability_has_distinct_flag() {
        let all: Capabilities = Capability::ALL.into_iter().collect();
        assert_eq!(all.bits().count_ones() as usize, Capability::ALL.len());
    }
}
