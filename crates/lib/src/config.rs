//! # Configuration
//!
//! The main configuration is a JSON file listing the managed repositories.
//! Each repository may additionally carry per-version YAML overrides in
//! `<config_dir>/<version>/data.yaml`; the override that the next commit
//! will record lives in `<config_dir>/ready/data.yaml`.

use anyhow::{Context, Result};
use atomic_upgrade_utils::{path_covers, rebase_under_root};
use camino::{Utf8Path, Utf8PathBuf};
use canon_json::CanonJsonSerialize;
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::repo::RepoKind;

/// Default location of the main configuration file.
pub const CONFIG_PATH: &str = "/etc/atomic-upgrade/config.json";
/// File name of a data override.
pub const DATA_FILE: &str = "data.yaml";
/// Directory (below `config_dir`) of the override for the next commit.
pub const READY_DIR: &str = "ready";

fn default_retention() -> usize {
    5
}

fn default_bootloader_update_cmd() -> String {
    "update-grub".into()
}

fn default_mount_point() -> Utf8PathBuf {
    "/".into()
}

/// One managed repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Path of the backing store.
    pub repo: Utf8PathBuf,
    /// Root of the tree whose subscribed paths are versioned.
    #[serde(default = "default_mount_point")]
    pub repo_mount_point: Utf8PathBuf,
    /// Where versions are checked out.
    pub snapshot_dir: Utf8PathBuf,
    /// Where system data is staged before a commit.
    pub stage_dir: Utf8PathBuf,
    /// Where per-version data overrides are kept.
    pub config_dir: Utf8PathBuf,
    /// Paths tracked by this repository.
    #[serde(default)]
    pub subscribe_list: Vec<Utf8PathBuf>,
    /// Paths excluded from tracking and replacement.
    #[serde(default)]
    pub filter_list: Vec<Utf8PathBuf>,
    /// Backend of the store.
    #[serde(default)]
    pub kind: RepoKind,
}

/// The main configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Distribution name, the first field of every version.
    pub distribution: String,
    /// The version the system currently runs.
    #[serde(default)]
    pub active_version: String,
    /// Scratch space for boot caches and scratch roots.
    pub cache_dir: Utf8PathBuf,
    /// Whether old versions are pruned after a commit.
    #[serde(default)]
    pub auto_cleanup: bool,
    /// How many versions auto-cleanup keeps.
    #[serde(default = "default_retention")]
    pub max_version_retention: usize,
    /// Command printing the boot-kit version, if any.
    #[serde(default)]
    pub bootkit_version_cmd: Option<String>,
    /// Command regenerating the bootloader menu.
    #[serde(default = "default_bootloader_update_cmd")]
    pub bootloader_update_cmd: String,
    /// The managed repositories.
    pub repo_list: Vec<RepoConfig>,
}

/// The `target` section of a data override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetData {
    /// Extra paths to track.
    #[serde(default)]
    pub subscribe_list: Vec<Utf8PathBuf>,
    /// Extra paths to exclude.
    #[serde(default)]
    pub filter_list: Vec<Utf8PathBuf>,
    /// Command run after a successful commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_run: Option<String>,
    /// Boot splash theme of the version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plymouth_theme: Option<String>,
}

/// A per-version data override file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataOverride {
    /// The only section.
    #[serde(default)]
    pub target: TargetData,
}

/// Add `p` to `list` unless an entry already covers it; entries that `p`
/// covers are dropped.
fn append_path(list: &mut Vec<Utf8PathBuf>, p: &Utf8Path) {
    if list.iter().any(|e| path_covers(e, p)) {
        return;
    }
    list.retain(|e| !path_covers(p, e));
    list.push(p.to_owned());
}

fn rebase(root: &Utf8Path, p: &Utf8Path) -> Utf8PathBuf {
    // Both inputs are UTF-8, so the result is too.
    Utf8PathBuf::from_path_buf(rebase_under_root(root, p)).unwrap_or_else(|p| {
        Utf8PathBuf::from(p.to_string_lossy().into_owned())
    })
}

impl RepoConfig {
    /// Track `p`.
    pub fn add_subscribe(&mut self, p: &Utf8Path) {
        append_path(&mut self.subscribe_list, p)
    }

    /// Exclude `p`.
    pub fn add_filter(&mut self, p: &Utf8Path) {
        append_path(&mut self.filter_list, p)
    }

    /// Fold the lists of a data override into this repository.
    pub fn merge_data(&mut self, data: &DataOverride) {
        for p in data.target.subscribe_list.iter() {
            self.add_subscribe(p);
        }
        for p in data.target.filter_list.iter() {
            self.add_filter(p);
        }
    }

    /// Where the subscribed path `p` lives on the running system.
    pub fn live_path(&self, p: &Utf8Path) -> Utf8PathBuf {
        rebase(&self.repo_mount_point, p)
    }

    /// The checkout directory of `version`.
    pub fn snapshot_path(&self, version: &str) -> Utf8PathBuf {
        crate::repo::snapshot_path(&self.snapshot_dir, version)
    }

    /// The data override file of `version`.
    pub fn data_path(&self, version: &str) -> Utf8PathBuf {
        self.config_dir.join(version).join(DATA_FILE)
    }

    /// Load the override of `version`; a missing file is an empty override.
    #[context("Loading data override of {version}")]
    pub fn load_data(&self, version: &str) -> Result<DataOverride> {
        let path = self.data_path(version);
        let buf = match std::fs::read_to_string(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No data override at {path}");
                return Ok(DataOverride::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        serde_yaml::from_str(&buf)
            .map_err(|e| Error::Config(format!("{path}: {e}")).into())
    }

    /// Record the pending override as the override of `version` and return it.
    #[context("Saving data override of {version}")]
    pub fn stage_data(&self, version: &str) -> Result<DataOverride> {
        let data = self.load_data(READY_DIR)?;
        let dir = self.config_dir.join(version);
        std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
        let dir = Dir::open_ambient_dir(&dir, cap_std::ambient_authority())?;
        let buf = serde_yaml::to_string(&data)?;
        dir.atomic_write(DATA_FILE, buf)?;
        Ok(data)
    }

    /// Move every path of this repository below `root`.
    pub fn relocate(&mut self, root: &Utf8Path) {
        for p in [
            &mut self.repo,
            &mut self.repo_mount_point,
            &mut self.snapshot_dir,
            &mut self.stage_dir,
            &mut self.config_dir,
        ] {
            *p = rebase(root, p);
        }
    }
}

impl Config {
    /// Parse a configuration.
    pub fn parse(buf: &str) -> Result<Self> {
        let c: Self = serde_json::from_str(buf).map_err(|e| Error::Config(e.to_string()))?;
        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(Error::Config(msg).into()) };
        if self.distribution.is_empty() || self.distribution.contains('.') {
            return fail(format!("invalid distribution {:?}", self.distribution));
        }
        if self.repo_list.is_empty() {
            return fail("no repositories configured".into());
        }
        for r in self.repo_list.iter() {
            let paths = [
                &r.repo,
                &r.repo_mount_point,
                &r.snapshot_dir,
                &r.stage_dir,
                &r.config_dir,
            ];
            if let Some(p) = paths.into_iter().find(|p| !p.is_absolute()) {
                return fail(format!("path {p} is not absolute"));
            }
        }
        Ok(())
    }

    /// Load the configuration file at `path`.
    #[context("Loading configuration {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {path}: {e}")))?;
        Self::parse(&buf)
    }

    /// Atomically write the configuration to `path`.
    #[context("Saving configuration {path}")]
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            anyhow::bail!("Invalid configuration path {path}");
        };
        let parent = if parent.as_str().is_empty() {
            Utf8Path::new(".")
        } else {
            parent
        };
        std::fs::create_dir_all(parent)?;
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())?;
        dir.atomic_replace_with(name, |f| anyhow::Ok(self.to_canon_json_writer(f)?))?;
        Ok(())
    }

    /// A copy of this configuration for a system mounted at `root`.
    pub fn with_root(&self, root: &Utf8Path) -> Self {
        let mut r = self.clone();
        r.cache_dir = rebase(root, &r.cache_dir);
        for repo in r.repo_list.iter_mut() {
            repo.relocate(root);
        }
        r
    }

    /// Where the boot files of `version` are cached.
    pub fn boot_cache_path(&self, version: &str) -> Utf8PathBuf {
        self.cache_dir.join("boot").join(version)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const CONFIG: &str = indoc! { r#"
        {
            "distribution": "deepin",
            "active_version": "deepin.1.0.20230101",
            "cache_dir": "/persistent/cache",
            "auto_cleanup": true,
            "repo_list": [
                {
                    "repo": "/persistent/osroot/repo",
                    "snapshot_dir": "/persistent/osroot/snapshot",
                    "stage_dir": "/persistent/osroot/stage",
                    "config_dir": "/persistent/osroot/config",
                    "subscribe_list": ["/usr", "/etc", "/boot"],
                    "filter_list": ["/usr/local"]
                }
            ]
        }
    "# };

    #[test]
    fn test_parse() {
        let c = Config::parse(CONFIG).unwrap();
        assert_eq!(c.max_version_retention, 5);
        assert_eq!(c.bootloader_update_cmd, "update-grub");
        assert_eq!(c.bootkit_version_cmd, None);
        let r = &c.repo_list[0];
        assert_eq!(r.repo_mount_point, "/");
        assert_eq!(r.kind, RepoKind::Ostree);
        assert_eq!(r.live_path("/usr".into()), "/usr");

        for bad in [
            "{",
            r#"{"distribution": "d", "cache_dir": "/c", "repo_list": []}"#,
            r#"{"distribution": "a.b", "cache_dir": "/c", "repo_list": []}"#,
        ] {
            let e = Config::parse(bad).unwrap_err();
            assert!(matches!(e.downcast_ref::<Error>(), Some(Error::Config(_))), "{bad}");
        }
        let relative = CONFIG.replace("/persistent/osroot/stage", "stage");
        assert!(Config::parse(&relative).is_err());
    }

    #[test]
    fn test_append_path() {
        let mut r = Config::parse(CONFIG).unwrap().repo_list.remove(0);
        r.add_subscribe("/usr/lib".into());
        r.add_subscribe("/usr".into());
        r.add_subscribe("/opt/apps".into());
        r.add_subscribe("/opt/apps/x".into());
        assert_eq!(
            r.subscribe_list,
            ["/usr", "/etc", "/boot", "/opt/apps"].map(Utf8PathBuf::from)
        );
        r.add_filter("/usr/local/bin".into());
        r.add_filter("/var/lib/docker".into());
        r.add_filter("/var/lib".into());
        assert_eq!(r.filter_list, ["/usr/local", "/var/lib"].map(Utf8PathBuf::from));
    }

    #[test]
    fn test_with_root() {
        let c = Config::parse(CONFIG).unwrap().with_root("/sysroot".into());
        assert_eq!(c.cache_dir, "/sysroot/persistent/cache");
        let r = &c.repo_list[0];
        assert_eq!(r.repo, "/sysroot/persistent/osroot/repo");
        assert_eq!(r.repo_mount_point, "/sysroot");
        assert_eq!(r.live_path("/usr".into()), "/sysroot/usr");
        // Logical paths are unchanged
        assert_eq!(r.subscribe_list[0], "/usr");
        assert_eq!(c.boot_cache_path("v"), "/sysroot/persistent/cache/boot/v");
    }

    #[test]
    fn test_save_load() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8Path::from_path(td.path()).unwrap().join("etc/config.json");
        let mut c = Config::parse(CONFIG)?;
        c.active_version = "deepin.2.0.20230102".into();
        c.save(&path)?;
        let buf = std::fs::read_to_string(&path)?;
        assert!(buf.starts_with(r#"{"active_version":"deepin.2.0.20230102","auto_cleanup":true"#));
        assert_eq!(Config::load(&path)?, c);
        let e = Config::load(&path.with_file_name("missing.json")).unwrap_err();
        assert!(matches!(
            crate::error::classify(&e),
            Some(Error::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_data_override() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let mut r = Config::parse(CONFIG)?.repo_list.remove(0);
        r.config_dir = root.join("config");
        assert_eq!(r.load_data("v1")?, DataOverride::default());
        assert_eq!(r.stage_data("v1")?, DataOverride::default());

        std::fs::create_dir_all(r.config_dir.join(READY_DIR))?;
        std::fs::write(
            r.data_path(READY_DIR),
            indoc! { r#"
                target:
                  subscribe_list:
                    - /opt
                  filter_list:
                    - /etc/hostname
                  after_run: "update-initramfs -u"
                  plymouth_theme: deepin-logo
            "# },
        )?;
        let data = r.stage_data("v2")?;
        assert_eq!(data.target.after_run.as_deref(), Some("update-initramfs -u"));
        assert_eq!(r.load_data("v2")?, data);
        r.merge_data(&data);
        assert!(r.subscribe_list.contains(&"/opt".into()));
        assert!(r.filter_list.contains(&"/etc/hostname".into()));

        std::fs::write(r.data_path("v2"), "target: [")?;
        let e = r.load_data("v2").unwrap_err();
        assert!(matches!(crate::error::classify(&e), Some(Error::Config(_))));
        Ok(())
    }
}
