//! Logical path helpers
//!
//! Paths are `/`-separated; empty components (leading, trailing or doubled
//! slashes) are ignored, so `"/a//b/"` and `"a/b"` name the same node.

/// Split a path into its non-empty components
pub fn parts(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Split a path into `(parent components, final name)`
///
/// Returns `None` for the root, which has no name.
pub fn split_parent(path: &str) -> Option<(Vec<&str>, &str)> {
    let mut components = parts(path);
    let name = components.pop()?;
    Some((components, name))
}

/// Join components back into an absolute path
pub fn join(components: &[&str]) -> String {
    let mut path = String::from("/");
    path.push_str(&components.join("/"));
    path
}

/// Normalize a path to its absolute, slash-collapsed form
pub fn normalize(path: &str) -> String {
    join(&parts(path))
}

/// Whether `path` lies under `prefix` (component-wise)
pub fn starts_with(path: &str, prefix: &str) -> bool {
    let path = parts(path);
    let prefix = parts(prefix);
    path.len() >= prefix.len() && path.iter().zip(prefix.iter()).all(|(a, b)| a == b)
}
