//! The content-addressed store that holds one full filesystem tree per
//! version.
//!
//! Backends implement [`Repository`]; [`open`] selects one by
//! [`RepoKind`]. All operations are synchronous and failures are surfaced
//! to the caller as-is; nothing here retries.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch;

mod ostree;
pub use self::ostree::OstreeRepo;

/// One changed path between two versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    /// `A` added, `D` deleted, `M` modified.
    pub kind: char,
    /// Absolute path inside the tree.
    pub path: String,
}

/// A branch-oriented versioned tree store.
pub trait Repository: std::fmt::Debug + Send + Sync {
    /// Create the store if it does not exist yet.
    fn init(&self) -> Result<()>;

    /// All valid version names, newest first.
    fn list(&self) -> Result<Vec<String>>;

    /// Commit the contents of `data_dir` as version `branch`.
    fn commit(&self, branch: &str, subject: &str, data_dir: &Utf8Path) -> Result<()>;

    /// Check out `branch` into `dst`, which must not exist.
    fn snapshot(&self, branch: &str, dst: &Utf8Path) -> Result<()>;

    /// Paths that differ between two versions.
    fn diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>>;

    /// Contents of the file at `path` in `branch`.
    fn cat(&self, branch: &str, path: &Utf8Path) -> Result<Vec<u8>>;

    /// Remove `branch` and prune objects only it referenced.
    fn delete(&self, branch: &str) -> Result<()>;

    /// The commit message of `branch`.
    fn subject(&self, branch: &str) -> Result<String>;

    /// When `branch` was committed.
    fn commit_time(&self, branch: &str) -> Result<DateTime<Utc>>;

    /// Whether `branch` exists.
    fn exists(&self, branch: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|b| b == branch))
    }

    /// The newest version.
    fn last(&self) -> Result<Option<String>> {
        Ok(self.list()?.into_iter().next())
    }

    /// The oldest version.
    fn first(&self) -> Result<Option<String>> {
        Ok(self.list()?.into_iter().last())
    }

    /// The version committed just before `branch`.
    fn previous(&self, branch: &str) -> Result<Option<String>> {
        let list = self.list()?;
        Ok(list
            .iter()
            .position(|b| b == branch)
            .and_then(|i| list.get(i + 1).cloned()))
    }
}

/// Available repository backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoKind {
    /// An ostree repository driven through the `ostree` command.
    #[default]
    Ostree,
}

/// Open the repository at `path` with the given backend.
pub fn open(kind: RepoKind, path: &Utf8Path) -> Box<dyn Repository> {
    match kind {
        RepoKind::Ostree => Box::new(OstreeRepo::new(path)),
    }
}

/// Helper for backends: keep valid names only and order them.
pub(crate) fn sorted_versions(names: impl IntoIterator<Item = String>) -> Vec<String> {
    branch::sort_newest_first(names)
}

/// The checkout location of `version` below a snapshot directory.
pub fn snapshot_path(snapshot_dir: &Utf8Path, version: &str) -> Utf8PathBuf {
    snapshot_dir.join(version)
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A directory-backed repository used by tests in place of ostree.

    use anyhow::Context;

    use super::*;

    /// Versions live in `root/<version>`; their subject sits next to them
    /// in `root/<version>.subject`.
    #[derive(Debug)]
    pub(crate) struct DirRepo {
        root: Utf8PathBuf,
    }

    /// Recursive copy that keeps symlinks as symlinks.
    pub(crate) fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(dst)?;
        for e in src.read_dir_utf8()? {
            let e = e?;
            let ft = e.file_type()?;
            let target = dst.join(e.file_name());
            if ft.is_symlink() {
                let l = std::fs::read_link(e.path())?;
                std::os::unix::fs::symlink(l, &target)?;
            } else if ft.is_dir() {
                copy_tree(e.path(), &target)?;
            } else {
                std::fs::copy(e.path(), &target)?;
            }
        }
        Ok(())
    }

    impl DirRepo {
        pub(crate) fn new(root: &Utf8Path) -> Self {
            Self {
                root: root.to_owned(),
            }
        }

        fn subject_path(&self, branch: &str) -> Utf8PathBuf {
            self.root.join(format!("{branch}.subject"))
        }
    }

    impl Repository for DirRepo {
        fn init(&self) -> Result<()> {
            std::fs::create_dir_all(&self.root)?;
            Ok(())
        }

        fn list(&self) -> Result<Vec<String>> {
            if !self.root.try_exists()? {
                return Ok(Vec::new());
            }
            let mut names = Vec::new();
            for e in self.root.read_dir_utf8()? {
                let e = e?;
                if e.file_type()?.is_dir() {
                    names.push(e.file_name().to_owned());
                }
            }
            Ok(sorted_versions(names))
        }

        fn commit(&self, branch: &str, subject: &str, data_dir: &Utf8Path) -> Result<()> {
            copy_tree(data_dir, &self.root.join(branch)).context("commit")?;
            std::fs::write(self.subject_path(branch), subject)?;
            Ok(())
        }

        fn snapshot(&self, branch: &str, dst: &Utf8Path) -> Result<()> {
            anyhow::ensure!(self.exists(branch)?, "no such branch {branch}");
            copy_tree(&self.root.join(branch), dst)
        }

        fn diff(&self, _from: &str, _to: &str) -> Result<Vec<DiffEntry>> {
            Ok(Vec::new())
        }

        fn cat(&self, branch: &str, path: &Utf8Path) -> Result<Vec<u8>> {
            let rel = path.as_str().trim_start_matches('/');
            Ok(std::fs::read(self.root.join(branch).join(rel))?)
        }

        fn delete(&self, branch: &str) -> Result<()> {
            std::fs::remove_dir_all(self.root.join(branch))?;
            std::fs::remove_file(self.subject_path(branch))?;
            Ok(())
        }

        fn subject(&self, branch: &str) -> Result<String> {
            Ok(std::fs::read_to_string(self.subject_path(branch))?)
        }

        fn commit_time(&self, branch: &str) -> Result<DateTime<Utc>> {
            let m = std::fs::metadata(self.subject_path(branch))
                .with_context(|| format!("no such branch {branch}"))?;
            Ok(m.modified()?.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::DirRepo;
    use super::*;

    #[test]
    fn test_default_methods() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let data = root.join("data");
        std::fs::create_dir_all(&data)?;
        std::fs::write(data.join("f"), "x")?;
        let repo = DirRepo::new(&root.join("repo"));
        repo.init()?;
        assert_eq!(repo.last()?, None);
        for v in ["d.0.0.20230101", "d.1.0.20230102", "d.1.1.20230102"] {
            repo.commit(v, "subject", &data)?;
        }
        assert_eq!(repo.last()?.as_deref(), Some("d.1.1.20230102"));
        assert_eq!(repo.first()?.as_deref(), Some("d.0.0.20230101"));
        assert_eq!(
            repo.previous("d.1.1.20230102")?.as_deref(),
            Some("d.1.0.20230102")
        );
        assert_eq!(repo.previous("d.0.0.20230101")?, None);
        assert!(repo.exists("d.1.0.20230102")?);
        assert!(!repo.exists("d.9.0.20230102")?);
        Ok(())
    }
}
