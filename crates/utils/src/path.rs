use std::path::{Component, Path, PathBuf};

/// Returns true if `ancestor` is `path` itself or one of its parents,
/// comparing whole components (so `/usr` covers `/usr/lib` but not `/usrlocal`).
pub fn path_covers(ancestor: impl AsRef<Path>, path: impl AsRef<Path>) -> bool {
    let ancestor = normalize(ancestor.as_ref());
    let path = normalize(path.as_ref());
    path.starts_with(&ancestor)
}

/// Place the absolute path `p` underneath `root`; `/` as root is the identity.
pub fn rebase_under_root(root: impl AsRef<Path>, p: impl AsRef<Path>) -> PathBuf {
    let root = root.as_ref();
    let rel = normalize(p.as_ref());
    let rel = rel.strip_prefix("/").unwrap_or(&rel);
    if rel.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}

/// Lexically drop `.` components, trailing slashes and repeated separators.
fn normalize(p: &Path) -> PathBuf {
    p.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_covers() {
        assert!(path_covers("/usr", "/usr"));
        assert!(path_covers("/usr", "/usr/lib/x"));
        assert!(path_covers("/usr/", "/usr/lib"));
        assert!(path_covers("/", "/etc"));
        assert!(!path_covers("/usr", "/usrlocal"));
        assert!(!path_covers("/usr/lib", "/usr"));
    }

    #[test]
    fn test_rebase_under_root() {
        assert_eq!(rebase_under_root("/", "/usr"), Path::new("/usr"));
        assert_eq!(rebase_under_root("/sysroot", "/usr/lib"), Path::new("/sysroot/usr/lib"));
        assert_eq!(rebase_under_root("/sysroot", "/"), Path::new("/sysroot"));
        assert_eq!(rebase_under_root("/sysroot", "etc"), Path::new("/sysroot/etc"));
    }
}
