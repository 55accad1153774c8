//! Path utilities for remote and local paths
//!
//! Remote paths always use `/` as separator, whatever the server OS.
//! Local paths go through `PathBuf` so Windows separators stay correct.

use std::path::PathBuf;

/// Suffix of the temporary file a transfer writes before renaming it into place
pub const PART_FILE_SUFFIX: &str = ".filepart";

/// Check if a remote path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Collapse `.`, `..`, empty segments and trailing slashes.
///
/// `..` never climbs above the root.
pub fn normalize_remote_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Parent directory of a normalized remote path (`/` for top-level entries)
pub fn remote_parent(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Last component of a remote path
pub fn remote_file_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

/// Join local path components using the platform separator.
pub fn join_local_path(base: &str, component: &str) -> String {
    let mut path = PathBuf::from(base);
    path.push(component);
    path.to_string_lossy().to_string()
}

/// Name of the part file used while `name` is being written
pub fn part_file_name(name: &str) -> String {
    format!("{}{}", name, PART_FILE_SUFFIX)
}

/// Leftover of an unfinished transfer; never a transfer source itself
pub fn is_part_file(name: &str) -> bool {
    name.len() > PART_FILE_SUFFIX.len() && name.ends_with(PART_FILE_SUFFIX)
}

/// Where an existing destination waits while a part file replaces it
pub fn set_aside_name(name: &str) -> String {
    part_file_name(&format!("{}.old", name))
}

/// `report.txt` -> `report (2).txt`; dot-files and extension-less names get
/// the counter appended.
pub fn alternative_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({}){}", &name[..idx], n, &name[idx..]),
        _ => format!("{} ({})", name, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_normalize_remote_path() {
        assert_eq!(normalize_remote_path("/a/./b//c/"), "/a/b/c");
        assert_eq!(normalize_remote_path("/a/b/../c"), "/a/c");
        assert_eq!(normalize_remote_path("/../.."), "/");
        assert_eq!(normalize_remote_path("relative/x"), "/relative/x");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(remote_parent("/a/b/c.txt"), "/a/b");
        assert_eq!(remote_parent("/a"), "/");
        assert_eq!(remote_parent("/"), "/");
        assert_eq!(remote_file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(remote_file_name("/a/dir/"), "dir");
    }

    #[test]
    fn test_alternative_name() {
        assert_eq!(alternative_name("report.txt", 2), "report (2).txt");
        assert_eq!(alternative_name("archive.tar.gz", 1), "archive.tar (1).gz");
        assert_eq!(alternative_name(".bashrc", 3), ".bashrc (3)");
        assert_eq!(alternative_name("README", 1), "README (1)");
    }

    #[test]
    fn test_part_file_names() {
        assert_eq!(part_file_name("a.txt"), "a.txt.filepart");
        assert!(is_part_file("a.txt.filepart"));
        assert!(is_part_file(&set_aside_name("a.txt")));
        assert!(!is_part_file(".filepart"));
        assert!(!is_part_file("a.filepart.txt"));
    }

    #[test]
    fn test_is_absolute_remote_path() {
        assert!(is_absolute_remote_path("/home/user"));
        assert!(!is_absolute_remote_path("relative/path"));
        assert!(!is_absolute_remote_path("C:\\Windows"));
    }
}
