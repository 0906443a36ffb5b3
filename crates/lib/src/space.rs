//! Free space accounting for staging system data.

use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::error::Error;
use crate::replace::Filter;

/// Reports free space of the filesystem holding a path.
pub trait DiskSpace: std::fmt::Debug + Send + Sync {
    /// Bytes available to unprivileged writers.
    fn available(&self, path: &Utf8Path) -> Result<u64>;
}

/// [`DiskSpace`] backed by `statvfs(2)`.
#[derive(Debug, Default)]
pub struct Statvfs;

impl DiskSpace for Statvfs {
    fn available(&self, path: &Utf8Path) -> Result<u64> {
        let st = rustix::fs::statvfs(path.as_std_path())
            .with_context(|| format!("statvfs {path}"))?;
        Ok(st.f_bavail.saturating_mul(st.f_frsize))
    }
}

/// Total size of the regular files below `path`, staying on its
/// filesystem and skipping filtered paths. A missing path has size zero.
#[context("Measuring {path}")]
pub fn tree_size(path: &Utf8Path, filter: &Filter) -> Result<u64> {
    let meta = match path.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    fn walk(dir: &Utf8Path, dev: u64, filter: &Filter) -> Result<u64> {
        let mut total = 0u64;
        for e in dir.read_dir_utf8()? {
            let e = e?;
            if filter.is_filtered(e.path()) {
                continue;
            }
            let m = e.metadata()?;
            if m.dev() != dev {
                continue;
            }
            if m.is_dir() {
                total = total.saturating_add(walk(e.path(), dev, filter)?);
            } else if m.is_file() {
                total = total.saturating_add(m.len());
            }
        }
        Ok(total)
    }
    if meta.is_dir() {
        walk(path, meta.dev(), filter)
    } else if meta.is_file() {
        Ok(meta.len())
    } else {
        Ok(0)
    }
}

/// Space a copy needs: `needed` plus a signed adjustment. Content that is
/// deleted from the same filesystem before copying is passed as a
/// negative `extra`.
pub fn required_bytes(needed: u64, extra: i64) -> u64 {
    let r = i128::from(needed) + i128::from(extra);
    u64::try_from(r.max(0)).unwrap_or(u64::MAX)
}

/// Fail with [`Error::Space`] if `required` exceeds what is available at `path`.
pub fn ensure_space(space: &dyn DiskSpace, path: &Utf8Path, required: u64) -> Result<()> {
    let available = space.available(path)?;
    tracing::debug!("{path}: {available} bytes available, {required} required");
    if required > available {
        return Err(Error::Space {
            path: path.to_string(),
            available,
            required,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed(u64);

    impl DiskSpace for Fixed {
        fn available(&self, _path: &Utf8Path) -> Result<u64> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_required_bytes() {
        assert_eq!(required_bytes(1000, 0), 1000);
        // Stale content about to be removed offsets what we need
        assert_eq!(required_bytes(1000, -400), 600);
        assert_eq!(required_bytes(1000, -4000), 0);
        assert_eq!(required_bytes(1000, 24), 1024);
        assert_eq!(required_bytes(u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn test_ensure_space() {
        let p = Utf8Path::new("/persistent");
        ensure_space(&Fixed(100), p, 100).unwrap();
        let e = ensure_space(&Fixed(100), p, 101).unwrap_err();
        match e.downcast_ref::<Error>() {
            Some(Error::Space {
                available,
                required,
                ..
            }) => assert_eq!((*available, *required), (100, 101)),
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn test_tree_size() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        assert_eq!(tree_size(&root.join("missing"), &Filter::default())?, 0);
        std::fs::create_dir_all(root.join("a/b"))?;
        std::fs::write(root.join("a/x"), [0u8; 10])?;
        std::fs::write(root.join("a/b/y"), [0u8; 5])?;
        std::os::unix::fs::symlink("x", root.join("a/l"))?;
        assert_eq!(tree_size(&root.join("a"), &Filter::default())?, 15);
        let f = Filter::new([root.join("a/b")]);
        assert_eq!(tree_size(&root.join("a"), &f)?, 10);
        Ok(())
    }

    #[test]
    fn test_statvfs() {
        assert!(Statvfs.available(Utf8Path::new("/")).is_ok());
    }
}
