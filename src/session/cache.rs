//! Directory listing cache

use std::collections::HashMap;
use std::time::Duration;

use crate::backend::RemoteFileList;
use crate::transfer::path_utils::remote_parent;

/// Listings keyed by absolute directory path.
///
/// Entries expire after `ttl`, are pruned on the next insert and are
/// dropped whenever the directory (or anything under it) is mutated through
/// the session.
#[derive(Debug)]
pub struct DirectoryCache {
    ttl: Duration,
    entries: HashMap<String, RemoteFileList>,
}

impl DirectoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, directory: &str) -> Option<&RemoteFileList> {
        self.entries
            .get(directory)
            .filter(|list| list.fetched_at.elapsed() < self.ttl)
    }

    pub fn insert(&mut self, list: RemoteFileList) {
        if self.ttl.is_zero() {
            return;
        }
        let ttl = self.ttl;
        self.entries.retain(|_, cached| cached.fetched_at.elapsed() < ttl);
        self.entries.insert(list.directory.clone(), list);
    }

    /// Forget `path` itself, its parent listing and everything below it.
    pub fn invalidate(&mut self, path: &str) {
        let parent = remote_parent(path);
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.entries
            .retain(|dir, _| dir != path && *dir != parent && !dir.starts_with(&prefix));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(dir: &str) -> RemoteFileList {
        RemoteFileList::new(dir, Vec::new())
    }

    #[test]
    fn test_invalidate_drops_parent_and_subtree() {
        let mut cache = DirectoryCache::new(Duration::from_secs(60));
        cache.insert(list("/a"));
        cache.insert(list("/a/b"));
        cache.insert(list("/a/b/c"));
        cache.insert(list("/z"));

        cache.invalidate("/a/b");

        assert!(cache.get("/a").is_none());
        assert!(cache.get("/a/b").is_none());
        assert!(cache.get("/a/b/c").is_none());
        assert!(cache.get("/z").is_some());
    }

    #[test]
    fn test_expired_listings_are_evicted() {
        let mut cache = DirectoryCache::new(Duration::from_millis(20));
        cache.insert(list("/old"));
        assert_eq!(cache.len(), 1);
        std::thread::sleep(Duration::from_millis(40));

        cache.insert(list("/new"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("/new").is_some());
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let mut cache = DirectoryCache::new(Duration::ZERO);
        cache.insert(list("/a"));
        assert!(cache.is_empty());
    }
}
