//! Object-key helpers.
//!
//! Object stores have no directories, only keys. Every helper here treats
//! `/` as a hard boundary: `foo` is never considered a parent of `foobar`.

use crate::error::{CoreError, Result};

pub const SEPARATOR: char = '/';

/// Strip leading and trailing separators. The root is the empty key.
pub fn normalize_key(path: &str) -> &str {
    path.trim_matches(SEPARATOR)
}

/// Listing prefix for the immediate children of `key`.
pub fn directory_prefix(key: &str) -> String {
    let key = normalize_key(key);
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}{SEPARATOR}")
    }
}

pub fn is_directory_marker(key: &str) -> bool {
    key.ends_with(SEPARATOR)
}

/// The name of the immediate child of `prefix` that `key` lives under.
///
/// Returns `None` when `key` is not below `prefix` or is the prefix's own
/// directory marker.
pub fn child_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let name = rest.split(SEPARATOR).next().unwrap_or_default();
    if name.is_empty() { None } else { Some(name) }
}

/// Parent key of `key`, the empty key for top-level entries.
pub fn parent_key(key: &str) -> &str {
    let key = normalize_key(key);
    key.rfind(SEPARATOR).map_or("", |idx| &key[..idx])
}

pub fn join_key(base: &str, name: &str) -> String {
    let base = normalize_key(base);
    let name = normalize_key(name);
    match (base.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}{SEPARATOR}{name}"),
    }
}

/// Collapse `.` and `..` in a client-supplied path.
///
/// The result is absolute (`/`-rooted). `..` at the root stays at the root,
/// so a client can never climb out of the directory it is confined to.
pub fn normalize_client_path(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(CoreError::InvalidPath(
            "Path contains invalid characters".to_string(),
        ));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    Ok(format!("{SEPARATOR}{}", parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_prefix() {
        assert_eq!(directory_prefix(""), "");
        assert_eq!(directory_prefix("/"), "");
        assert_eq!(directory_prefix("a/b"), "a/b/");
        assert_eq!(directory_prefix("a/b/"), "a/b/");
    }

    #[test]
    fn test_child_name_respects_boundaries() {
        assert_eq!(child_name("a/", "a/b.txt"), Some("b.txt"));
        assert_eq!(child_name("a/", "a/c/d.txt"), Some("c"));
        assert_eq!(child_name("a/", "a/c/"), Some("c"));
        assert_eq!(child_name("a/", "a/"), None);
        assert_eq!(child_name("a/b/", "a/b.txt"), None);
        assert_eq!(child_name("", "top.txt"), Some("top.txt"));
    }

    #[test]
    fn test_parent_key() {
        assert_eq!(parent_key("a/b/c.txt"), "a/b");
        assert_eq!(parent_key("c.txt"), "");
        assert_eq!(parent_key("a/b/"), "a");
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "x"), "x");
        assert_eq!(join_key("home/alice", "/docs/x"), "home/alice/docs/x");
        assert_eq!(join_key("home/alice", "/"), "home/alice");
    }

    #[test]
    fn test_normalize_client_path() {
        assert_eq!(normalize_client_path(".").unwrap(), "/");
        assert_eq!(normalize_client_path("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_client_path("../../etc/passwd").unwrap(), "/etc/passwd");
        assert_eq!(normalize_client_path("a//b/").unwrap(), "/a/b");
        assert!(normalize_client_path("a\0b").is_err());
    }
}
