//! Root and key normalization shared by every backend.

/// Normalize a root path: forward slashes only, leading `/`, no trailing
/// slash (except the bare root), `.`/`..` segments resolved, duplicate
/// slashes collapsed.
pub(crate) fn normalize_root(root: &str) -> String {
    clean_path(&root.replace('\\', "/"))
}

/// Join a caller key onto a normalized root, collapsing duplicate slashes.
///
/// A trailing slash on the key is preserved since remote filesystems use it
/// as the directory marker.
pub(crate) fn build_abs_path(root: &str, key: &str) -> String {
    let joined = format!("{}/{}", root.trim_end_matches('/'), key);
    let cleaned = clean_path(&joined);
    if key.ends_with('/') && cleaned != "/" {
        format!("{}/", cleaned)
    } else {
        cleaned
    }
}

/// Strip a normalized root prefix from a backend key so callers see keys
/// relative to their own root.
pub(crate) fn strip_root(root: &str, key: &str) -> String {
    if root == "/" {
        return key.to_string();
    }
    match key.strip_prefix(root) {
        Some(rest) if rest.is_empty() => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => key.to_string(),
    }
}

fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_normalization_collapses_slashes() {
        assert_eq!(normalize_root("/a//b/"), "/a/b");
        assert_eq!(normalize_root("a/b"), "/a/b");
        assert_eq!(normalize_root("/"), "/");
        assert_eq!(normalize_root("//"), "/");
        assert_eq!(normalize_root("/a/./b/../c"), "/a/c");
    }

    #[test]
    fn join_against_root() {
        assert_eq!(build_abs_path("/a/b", "c"), "/a/b/c");
        assert_eq!(build_abs_path(&normalize_root("/a//b/"), "c"), "/a/b/c");
        assert_eq!(build_abs_path("/", "c"), "/c");
        assert_eq!(build_abs_path("/", "/c//d"), "/c/d");
        assert_eq!(build_abs_path("/r", ""), "/r");
    }

    #[test]
    fn join_keeps_dir_marker() {
        assert_eq!(build_abs_path("/a", "b/"), "/a/b/");
        assert_eq!(build_abs_path("/", "b//c/"), "/b/c/");
    }

    #[test]
    fn strip_root_returns_relative_keys() {
        assert_eq!(strip_root("/a/b", "/a/b/c"), "/c");
        assert_eq!(strip_root("/a/b", "/a/b"), "/");
        assert_eq!(strip_root("/", "/c"), "/c");
    }
}
