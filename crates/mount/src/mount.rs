//! Helpers for inspecting the mount table and applying sets of mounts.
//!
//! A rollback touches several mount contexts at once: the live root, the
//! partitions that the target version's `/etc/fstab` describes, and scratch
//! roots assembled from snapshot directories. Everything here shells out to
//! `findmnt`, `mount` and `umount` so that the behavior matches what an
//! administrator would see when running the same commands by hand.

use std::collections::BTreeSet;
use std::process::Command;

use anyhow::{Context, Result};
use atomic_upgrade_utils::CommandRunExt;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

mod fstab;
pub use fstab::*;

/// Top-level directories bound into a scratch root from the live system.
pub const PREDEFINED_BIND_DIRS: &[&str] = &[
    "/usr", "/var", "/opt", "/root", "/home", "/tmp", "/run", "/dev",
];

/// API filesystems mounted into a scratch root: (fstype, source, target).
const API_FILESYSTEMS: &[(&str, &str, &str)] = &[
    ("devpts", "devpts", "/dev/pts"),
    ("proc", "proc", "/proc"),
    ("sysfs", "sysfs", "/sys"),
];

/// One entry of `findmnt -J` output.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    // Note if you add an entry to this list, you need to change the --output invocation below too
    pub source: String,
    pub target: String,
    #[serde(rename = "maj:min")]
    pub maj_min: String,
    pub fstype: String,
    pub options: String,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub partuuid: Option<String>,
    pub children: Option<Vec<Filesystem>>,
}

impl Filesystem {
    /// Whether the mount options include `ro`.
    pub fn is_readonly(&self) -> bool {
        self.options.split(',').any(|o| o == "ro")
    }

    /// The device path with any `[/subvolume]` suffix that findmnt adds for
    /// bind mounts and btrfs subvolumes removed.
    pub fn source_device(&self) -> &str {
        self.source
            .split_once('[')
            .map(|(dev, _)| dev)
            .unwrap_or(&self.source)
    }
}

/// The parsed output of `findmnt -J`.
#[derive(Deserialize, Debug, Default)]
pub struct Findmnt {
    pub filesystems: Vec<Filesystem>,
}

impl Findmnt {
    /// Flatten the mount tree into a list, parents before children.
    pub fn flatten(&self) -> Vec<&Filesystem> {
        fn walk<'a>(fs: &'a Filesystem, out: &mut Vec<&'a Filesystem>) {
            out.push(fs);
            for child in fs.children.iter().flatten() {
                walk(child, out);
            }
        }
        let mut out = Vec::new();
        for fs in self.filesystems.iter() {
            walk(fs, &mut out);
        }
        out
    }
}

/// Run `findmnt` with the given extra arguments and optional path.
pub fn run_findmnt(args: &[&str], path: Option<&str>) -> Result<Findmnt> {
    let o: Findmnt = Command::new("findmnt")
        .args([
            "-J",
            "-v",
            // If you change this you probably also want to change the Filesystem struct above
            "--output=SOURCE,TARGET,MAJ:MIN,FSTYPE,OPTIONS,UUID,LABEL,PARTUUID",
        ])
        .args(args)
        .args(path)
        .log_debug()
        .run_and_parse_json()?;
    Ok(o)
}

/// The full live mount table, flattened.
#[context("Reading mount table")]
pub fn mount_table() -> Result<Vec<Filesystem>> {
    let o = run_findmnt(&[], None)?;
    Ok(o.flatten().into_iter().cloned().collect())
}

/// Mount points strictly below `dir` whose source device differs from the
/// filesystem `dir` itself lives on. These must not be moved as part of the
/// parent directory and are handled as units of their own.
pub fn foreign_submounts(table: &[Filesystem], dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let owner = table
        .iter()
        .filter(|fs| dir.starts_with(&fs.target))
        .max_by_key(|fs| fs.target.len());
    let Some(owner) = owner else {
        return Vec::new();
    };
    let all: BTreeSet<&Utf8Path> = table
        .iter()
        .map(|fs| (fs, Utf8Path::new(&fs.target)))
        .filter(|(fs, t)| {
            *t != dir && t.starts_with(dir) && fs.source_device() != owner.source_device()
        })
        .map(|(_, t)| t)
        .collect();
    // Only keep the outermost ones; nested mounts are found again when the
    // outer mount point is processed.
    all.iter()
        .filter(|p| !all.iter().any(|q| q != *p && p.starts_with(q)))
        .map(|p| p.to_path_buf())
        .collect()
}

/// A mount to apply: either a bind mount or a filesystem mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Source path, device, or fstab-style spec (`UUID=...`).
    pub src: String,
    /// Where to mount.
    pub dest: Utf8PathBuf,
    /// Filesystem type; unset for bind mounts.
    pub fstype: Option<String>,
    /// Mount options passed with `-o`.
    pub options: Vec<String>,
    /// Whether this is a bind mount.
    pub bind: bool,
}

impl MountPoint {
    /// A bind mount of `src` onto `dest`.
    pub fn new_bind(src: impl Into<String>, dest: impl Into<Utf8PathBuf>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            fstype: None,
            options: Vec::new(),
            bind: true,
        }
    }

    /// A mount of a filesystem of the given type.
    pub fn new_fs(
        fstype: impl Into<String>,
        src: impl Into<String>,
        dest: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            fstype: Some(fstype.into()),
            options: Vec::new(),
            bind: false,
        }
    }

    /// Add a mount option.
    pub fn push_option(&mut self, opt: &str) {
        if !self.options.iter().any(|o| o == opt) {
            self.options.push(opt.to_owned());
        }
    }

    /// The `mount` invocation for this entry.
    pub fn to_command(&self) -> Command {
        let mut c = Command::new("mount");
        if self.bind {
            c.arg("--bind");
        } else if let Some(fstype) = self.fstype.as_deref() {
            c.args(["-t", fstype]);
        }
        if !self.options.is_empty() {
            c.arg("-o").arg(self.options.join(","));
        }
        c.arg(&self.src).arg(self.dest.as_str());
        c
    }
}

impl std::fmt::Display for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.bind {
            "bind"
        } else {
            self.fstype.as_deref().unwrap_or("auto")
        };
        write!(f, "{} -> {} ({kind})", self.src, self.dest)
    }
}

/// Something that can apply and remove mounts.
pub trait Mounter: std::fmt::Debug {
    /// Apply a single mount.
    fn mount(&self, mp: &MountPoint) -> Result<()>;
    /// Unmount `dest`, recursively if requested.
    fn umount(&self, dest: &Utf8Path, recursive: bool) -> Result<()>;
}

/// Mounts by invoking `mount(8)` and `umount(8)`.
#[derive(Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    #[context("Mounting {mp}")]
    fn mount(&self, mp: &MountPoint) -> Result<()> {
        if !mp.dest.try_exists()? {
            std::fs::create_dir_all(&mp.dest)
                .with_context(|| format!("Creating mount point {}", mp.dest))?;
        }
        mp.to_command().log_debug().run_capture_stderr()
    }

    #[context("Unmounting {dest}")]
    fn umount(&self, dest: &Utf8Path, recursive: bool) -> Result<()> {
        let mut c = Command::new("umount");
        if recursive {
            c.arg("-R");
        }
        c.arg(dest.as_str()).log_debug().run_capture_stderr()
    }
}

/// An ordered list of mounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountList(Vec<MountPoint>);

/// Error returned when applying a [`MountList`] fails partway.
#[derive(Debug)]
pub struct MountListError {
    /// The mounts that were applied before the failure, in order.
    pub mounted: MountList,
    /// The mount that failed.
    pub failed: MountPoint,
    /// Why it failed.
    pub cause: anyhow::Error,
    /// Set if unwinding the applied mounts also failed.
    pub unwind: Option<anyhow::Error>,
}

impl std::fmt::Display for MountListError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Failed to mount {} after {} successful mounts: {:#}",
            self.failed,
            self.mounted.len(),
            self.cause
        )?;
        if let Some(unwind) = self.unwind.as_ref() {
            write!(f, "; unwinding also failed: {unwind:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MountListError {}

impl From<Vec<MountPoint>> for MountList {
    fn from(v: Vec<MountPoint>) -> Self {
        Self(v)
    }
}

impl MountList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mount.
    pub fn push(&mut self, mp: MountPoint) {
        self.0.push(mp);
    }

    /// Append all mounts of another list.
    pub fn extend(&mut self, other: MountList) {
        self.0.extend(other.0);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &MountPoint> {
        self.0.iter()
    }

    /// Apply every mount in order. On failure the mounts applied so far are
    /// unwound (best effort) and reported back in the error, so the caller
    /// always knows exactly which mounts were made.
    pub fn mount(&self, m: &dyn Mounter) -> std::result::Result<MountList, MountListError> {
        let mut mounted = MountList::new();
        for mp in self.0.iter() {
            if let Err(cause) = m.mount(mp) {
                tracing::warn!("Mount {mp} failed, unwinding {} mounts", mounted.len());
                let unwind = mounted.umount(m).err();
                return Err(MountListError {
                    mounted,
                    failed: mp.clone(),
                    cause,
                    unwind,
                });
            }
            tracing::debug!("Mounted {mp}");
            mounted.push(mp.clone());
        }
        Ok(mounted)
    }

    /// Recursively unmount every destination once, deepest paths first.
    /// All entries are attempted; the first error is returned.
    pub fn umount(&self, m: &dyn Mounter) -> Result<()> {
        let mut dests: Vec<&Utf8Path> = self
            .0
            .iter()
            .map(|mp| mp.dest.as_path())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        dests.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        let mut first_err = None;
        for dest in dests {
            if let Err(e) = m.umount(dest, true) {
                tracing::warn!("Failed to unmount {dest}: {e:#}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The fixed set of mounts that make `scratch_root` usable as a root for
/// running commands: the live top-level directories found under
/// `live_root`, plus the API filesystems.
pub fn predefined_binds(live_root: &Utf8Path, scratch_root: &Utf8Path) -> MountList {
    let mut r = MountList::new();
    for dir in PREDEFINED_BIND_DIRS {
        let rel = dir.trim_start_matches('/');
        // Devices always come from the running kernel's view.
        let src = if *dir == "/dev" {
            Utf8PathBuf::from(*dir)
        } else {
            live_root.join(rel)
        };
        r.push(MountPoint::new_bind(src.as_str(), scratch_root.join(rel)));
    }
    for (fstype, src, target) in API_FILESYSTEMS {
        let rel = target.trim_start_matches('/');
        r.push(MountPoint::new_fs(*fstype, *src, scratch_root.join(rel)));
    }
    r
}

/// Bind each subscribed directory of a snapshot checkout into `scratch_root`,
/// shallowest first so deeper subscriptions stack on top.
pub fn subscription_binds(
    snapshot_root: &Utf8Path,
    scratch_root: &Utf8Path,
    subscribe: &[Utf8PathBuf],
) -> MountList {
    let mut subscribe: Vec<&Utf8PathBuf> = subscribe.iter().collect();
    subscribe.sort_by_key(|p| p.components().count());
    subscribe
        .into_iter()
        .map(|p| {
            let rel = p.as_str().trim_start_matches('/');
            MountPoint::new_bind(snapshot_root.join(rel).as_str(), scratch_root.join(rel))
        })
        .collect::<Vec<_>>()
        .into()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use indoc::indoc;

    use super::*;

    /// Records mounts and fails the Nth mount call (1-based).
    #[derive(Debug, Default)]
    pub(crate) struct FakeMounter {
        pub(crate) fail_on: Option<usize>,
        pub(crate) calls: RefCell<usize>,
        pub(crate) mounted: RefCell<Vec<Utf8PathBuf>>,
        pub(crate) unmounted: RefCell<Vec<Utf8PathBuf>>,
    }

    impl Mounter for FakeMounter {
        fn mount(&self, mp: &MountPoint) -> Result<()> {
            let n = {
                let mut calls = self.calls.borrow_mut();
                *calls += 1;
                *calls
            };
            if Some(n) == self.fail_on {
                anyhow::bail!("injected failure for {}", mp.dest);
            }
            self.mounted.borrow_mut().push(mp.dest.clone());
            Ok(())
        }

        fn umount(&self, dest: &Utf8Path, _recursive: bool) -> Result<()> {
            self.mounted.borrow_mut().retain(|d| d.as_path() != dest);
            self.unmounted.borrow_mut().push(dest.to_owned());
            Ok(())
        }
    }

    fn four_mounts() -> MountList {
        vec![
            MountPoint::new_bind("/a", "/scratch/a"),
            MountPoint::new_bind("/b", "/scratch/b"),
            MountPoint::new_bind("/c", "/scratch/c"),
            MountPoint::new_bind("/d", "/scratch/d"),
        ]
        .into()
    }

    #[test]
    fn test_mount_failure_reports_exactly_applied() {
        let m = FakeMounter {
            fail_on: Some(3),
            ..Default::default()
        };
        let err = four_mounts().mount(&m).unwrap_err();
        let mounted: Vec<_> = err.mounted.iter().map(|mp| mp.dest.as_str()).collect();
        assert_eq!(mounted, ["/scratch/a", "/scratch/b"]);
        assert_eq!(err.failed.dest, "/scratch/c");
        assert!(err.unwind.is_none());
        // The two applied mounts were unwound, and nothing else was touched
        assert!(m.mounted.borrow().is_empty());
        assert_eq!(m.unmounted.borrow().len(), 2);
        assert_eq!(*m.calls.borrow(), 3);
    }

    #[test]
    fn test_mount_all() {
        let m = FakeMounter::default();
        let r = four_mounts().mount(&m).unwrap();
        assert_eq!(r, four_mounts());
        assert_eq!(m.mounted.borrow().len(), 4);
    }

    #[test]
    fn test_umount_dedup_deepest_first() {
        let m = FakeMounter::default();
        let l: MountList = vec![
            MountPoint::new_bind("/usr", "/scratch/usr"),
            MountPoint::new_bind("/snap/usr/lib", "/scratch/usr/lib"),
            MountPoint::new_bind("/usr", "/scratch/usr"),
            MountPoint::new_fs("proc", "proc", "/scratch/proc"),
        ]
        .into();
        l.umount(&m).unwrap();
        let order = m.unmounted.borrow();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], "/scratch/usr/lib");
    }

    #[test]
    fn test_mount_command() {
        use atomic_upgrade_utils::CommandRunExt;
        let mut mp = MountPoint::new_fs("ext4", "UUID=1234", "/sysroot/data");
        mp.push_option("rw");
        mp.push_option("rw");
        mp.push_option("noatime");
        assert_eq!(
            mp.to_command().to_string_pretty(),
            "mount -t ext4 -o rw,noatime UUID=1234 /sysroot/data"
        );
        let b = MountPoint::new_bind("/persistent/snapshot/usr", "/scratch/usr");
        assert_eq!(
            b.to_command().to_string_pretty(),
            "mount --bind /persistent/snapshot/usr /scratch/usr"
        );
    }

    #[test]
    fn test_predefined_binds() {
        let l = predefined_binds("/sysroot".into(), "/var/cache/rootfs".into());
        assert_eq!(l.len(), PREDEFINED_BIND_DIRS.len() + 3);
        let first = l.iter().next().unwrap();
        assert_eq!(first.src, "/sysroot/usr");
        assert_eq!(first.dest, "/var/cache/rootfs/usr");
        let dev = l.iter().find(|mp| mp.dest == "/var/cache/rootfs/dev").unwrap();
        assert_eq!(dev.src, "/dev");
        let pts = l.iter().find(|mp| mp.dest == "/var/cache/rootfs/dev/pts").unwrap();
        assert_eq!(pts.fstype.as_deref(), Some("devpts"));
    }

    #[test]
    fn test_subscription_binds() {
        let subs = vec![Utf8PathBuf::from("/usr/lib"), Utf8PathBuf::from("/etc")];
        let l = subscription_binds("/snap/v1".into(), "/scratch".into(), &subs);
        let dests: Vec<_> = l.iter().map(|mp| mp.dest.as_str()).collect();
        assert_eq!(dests, ["/scratch/etc", "/scratch/usr/lib"]);
        assert_eq!(l.iter().next().unwrap().src, "/snap/v1/etc");
    }

    const FINDMNT: &str = indoc! { r#"
        {
           "filesystems": [
              {
                 "source": "/dev/vda3",
                 "target": "/",
                 "maj:min": "252:3",
                 "fstype": "ext4",
                 "options": "rw,relatime",
                 "uuid": "aaaa",
                 "label": null,
                 "partuuid": null,
                 "children": [
                    {
                       "source": "/dev/vda2",
                       "target": "/boot",
                       "maj:min": "252:2",
                       "fstype": "ext4",
                       "options": "ro,relatime",
                       "uuid": "bbbb",
                       "label": "boot",
                       "partuuid": null
                    },
                    {
                       "source": "/dev/vda4",
                       "target": "/var/lib/docker",
                       "maj:min": "252:4",
                       "fstype": "xfs",
                       "options": "rw",
                       "uuid": "cccc",
                       "label": null,
                       "partuuid": null,
                       "children": [
                          {
                             "source": "/dev/vda5",
                             "target": "/var/lib/docker/volumes",
                             "maj:min": "252:5",
                             "fstype": "xfs",
                             "options": "rw",
                             "uuid": "dddd",
                             "label": null,
                             "partuuid": null
                          }
                       ]
                    },
                    {
                       "source": "/dev/vda3[/var/tmp]",
                       "target": "/var/tmp",
                       "maj:min": "252:3",
                       "fstype": "ext4",
                       "options": "rw",
                       "uuid": "aaaa",
                       "label": null,
                       "partuuid": null
                    }
                 ]
              }
           ]
        }
    "# };

    pub(crate) fn fixture_table() -> Vec<Filesystem> {
        let o: Findmnt = serde_json::from_str(FINDMNT).unwrap();
        o.flatten().into_iter().cloned().collect()
    }

    #[test]
    fn test_parse_findmnt() {
        let table = fixture_table();
        assert_eq!(table.len(), 5);
        assert_eq!(table[0].target, "/");
        assert!(table[1].is_readonly());
        assert!(!table[0].is_readonly());
        assert_eq!(table[4].source_device(), "/dev/vda3");
    }

    #[test]
    fn test_foreign_submounts() {
        let table = fixture_table();
        // Bind mounts from the same device are not foreign; nested foreign
        // mounts are only reported at their outermost level.
        let r = foreign_submounts(&table, "/var".into());
        assert_eq!(r, [Utf8PathBuf::from("/var/lib/docker")]);
        let r = foreign_submounts(&table, "/var/lib/docker".into());
        assert_eq!(r, [Utf8PathBuf::from("/var/lib/docker/volumes")]);
        assert!(foreign_submounts(&table, "/usr".into()).is_empty());
    }
}
