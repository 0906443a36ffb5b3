//! Parsing of `/etc/fstab` and reconciliation of a (possibly different
//! version's) fstab against the live mount table.
//!
//! After a rollback the target version's fstab may name other partitions or
//! options than what is mounted right now; [`update_local_mounts`] brings the
//! live state in line before files are moved.

use anyhow::{Context, Result};
use atomic_upgrade_utils::rebase_under_root;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::{Filesystem, MountList, MountListError, MountPoint, Mounter};

/// Filesystem types that never describe a partition we should reconcile.
const SKIPPED_FSTYPES: &[&str] = &["swap", "none", "proc", "sysfs", "devpts", "tmpfs"];

/// One line of an fstab file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// First field: device, `UUID=`, `LABEL=` or `PARTUUID=` spec.
    pub spec: String,
    /// Second field: the mount point.
    pub file: Utf8PathBuf,
    /// Third field: filesystem type.
    pub vfstype: String,
    /// Fourth field, split on commas.
    pub mntops: Vec<String>,
}

impl FstabEntry {
    /// Whether the entry asks for a read-only mount.
    pub fn is_readonly(&self) -> bool {
        self.mntops.iter().any(|o| o == "ro")
    }

    fn has_option(&self, opt: &str) -> bool {
        self.mntops.iter().any(|o| o == opt)
    }

    /// Whether this entry identifies the source of the live filesystem `fs`.
    pub fn matches_source(&self, fs: &Filesystem) -> bool {
        let by = |prefix: &str, v: &Option<String>| {
            self.spec
                .strip_prefix(prefix)
                .map(|want| v.as_deref() == Some(want))
        };
        if let Some(r) = by("UUID=", &fs.uuid)
            .or_else(|| by("LABEL=", &fs.label))
            .or_else(|| by("PARTUUID=", &fs.partuuid))
        {
            return r;
        }
        let live = fs.source_device();
        if self.spec == live {
            return true;
        }
        // Handle /dev/disk/by-* and /dev/mapper symlinks
        match (
            std::fs::canonicalize(&self.spec),
            std::fs::canonicalize(live),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Decode the octal escapes fstab uses for whitespace (`\040`, `\011`).
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(i) = rest.find('\\') {
        out.push_str(&rest[..i]);
        let tail = &rest[i + 1..];
        let code = tail
            .get(..3)
            .filter(|d| d.bytes().all(|b| (b'0'..=b'7').contains(&b)))
            .and_then(|d| u8::from_str_radix(d, 8).ok());
        match code {
            Some(c) => {
                out.push(char::from(c));
                rest = &tail[3..];
            }
            None => {
                out.push('\\');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parse fstab content. Comment, blank and short lines are skipped.
pub fn parse_fstab(content: &str) -> Vec<FstabEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let mut fields = l.split_whitespace();
            let spec = fields.next()?;
            let file = fields.next()?;
            let vfstype = fields.next()?;
            let mntops = fields.next().unwrap_or("defaults");
            Some(FstabEntry {
                spec: unescape(spec),
                file: unescape(file).into(),
                vfstype: vfstype.to_owned(),
                mntops: mntops.split(',').map(ToOwned::to_owned).collect(),
            })
        })
        .collect()
}

/// Read and parse an fstab file.
#[context("Reading fstab {path}")]
pub fn read_fstab(path: &Utf8Path) -> Result<Vec<FstabEntry>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
    Ok(parse_fstab(&content))
}

/// A mount that must be (re)applied to match an fstab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remount {
    /// The mount to apply.
    pub mount: MountPoint,
    /// Whether something is currently mounted at the destination and must be
    /// unmounted first.
    pub unmount_first: bool,
}

/// Compute which fstab entries do not match the live mount table under
/// `root`: the wrong source is mounted, nothing is mounted, or the live mount
/// is read-only where the entry wants read-write.
pub fn plan_remounts(fstab: &[FstabEntry], live: &[Filesystem], root: &Utf8Path) -> Vec<Remount> {
    let mut r = Vec::new();
    for entry in fstab {
        if SKIPPED_FSTYPES.contains(&entry.vfstype.as_str())
            || entry.has_option("noauto")
            || !entry.file.is_absolute()
            || entry.file == "/"
        {
            continue;
        }
        let target: Utf8PathBuf = match Utf8PathBuf::from_path_buf(rebase_under_root(root, &entry.file)) {
            Ok(t) => t,
            Err(_) => continue,
        };
        // The last mount at a target is the visible one.
        let current = live.iter().rev().find(|fs| fs.target == target.as_str());
        let unmount_first = match current {
            Some(fs) if entry.matches_source(fs) && !(fs.is_readonly() && !entry.is_readonly()) => {
                continue;
            }
            Some(_) => true,
            None => false,
        };
        let mut mount = MountPoint::new_fs(&entry.vfstype, &entry.spec, target);
        for opt in entry.mntops.iter().filter(|o| o.as_str() != "defaults") {
            mount.push_option(opt);
        }
        r.push(Remount {
            mount,
            unmount_first,
        });
    }
    r
}

/// Bring the live mounts under `root` in line with `fstab`, returning the
/// mounts that were (re)applied. On failure the mounts applied so far are
/// unwound and reported back like [`MountList::mount`] does; mounts that
/// were replaced are not restored.
pub fn update_local_mounts(
    fstab: &[FstabEntry],
    live: &[Filesystem],
    root: &Utf8Path,
    m: &dyn Mounter,
) -> std::result::Result<MountList, MountListError> {
    let mut applied = MountList::new();
    for remount in plan_remounts(fstab, live, root) {
        let dest = &remount.mount.dest;
        let r = if remount.unmount_first {
            tracing::info!("Remounting {dest} to match fstab");
            m.umount(dest, true).and_then(|()| m.mount(&remount.mount))
        } else {
            tracing::info!("Mounting {dest} from fstab");
            m.mount(&remount.mount)
        };
        if let Err(cause) = r {
            tracing::warn!("Mount {dest} failed, unwinding {} mounts", applied.len());
            let unwind = applied.umount(m).err();
            return Err(MountListError {
                mounted: applied,
                failed: remount.mount,
                cause: cause.context("Updating local mounts"),
                unwind,
            });
        }
        applied.push(remount.mount);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const FSTAB: &str = indoc! { r#"
        # /etc/fstab: static file system information.
        UUID=aaaa  /          ext4  rw,relatime  0 1
        LABEL=boot /boot      ext4  rw,relatime  0 2
        UUID=eeee  /var/lib/docker xfs defaults 0 0
        /dev/vda9  /mnt/my\040data ext4 noauto 0 0
        /swapfile  none       swap  sw 0 0
        tmpfs      /tmp       tmpfs mode=1777 0 0
        UUID=ffff  /data      ext4
    "# };

    #[test]
    fn test_parse_fstab() {
        let entries = parse_fstab(FSTAB);
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[3].file, "/mnt/my data");
        assert_eq!(entries[6].mntops, ["defaults"]);
        assert!(!entries[0].is_readonly());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\040b"), "a b");
        assert_eq!(unescape(r"a\011b\\"), "a\tb\\\\");
        assert_eq!(unescape(r"trailing\0"), r"trailing\0");
    }

    #[test]
    fn test_plan_remounts() {
        let entries = parse_fstab(FSTAB);
        let live = crate::tests::fixture_table();
        let plan = plan_remounts(&entries, &live, "/".into());
        let dests: Vec<_> = plan.iter().map(|r| r.mount.dest.as_str()).collect();
        // /boot: right source but read-only; docker: wrong source; /data: not mounted.
        // The root, noauto, swap and tmpfs entries are left alone.
        similar_asserts::assert_eq!(dests, ["/boot", "/var/lib/docker", "/data"]);
        assert!(plan[0].unmount_first);
        assert!(plan[1].unmount_first);
        assert!(!plan[2].unmount_first);
        assert_eq!(plan[1].mount.options, Vec::<String>::new());
        assert_eq!(plan[0].mount.options, ["rw", "relatime"]);
        assert_eq!(plan[0].mount.src, "LABEL=boot");
    }

    #[test]
    fn test_plan_remounts_alternate_root() {
        let entries = parse_fstab("UUID=bbbb /boot ext4 ro 0 0\n");
        let live = crate::tests::fixture_table();
        // Nothing is mounted at /sysroot/boot in the fixture
        let plan = plan_remounts(&entries, &live, "/sysroot".into());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].mount.dest, "/sysroot/boot");
        // Under / it matches the live read-only mount
        assert!(plan_remounts(&entries, &live, "/".into()).is_empty());
    }

    #[test]
    fn test_update_local_mounts() {
        let m = crate::tests::FakeMounter::default();
        let entries = parse_fstab(FSTAB);
        let live = crate::tests::fixture_table();
        let applied = update_local_mounts(&entries, &live, "/".into(), &m).unwrap();
        assert_eq!(applied.len(), 3);
        assert_eq!(m.unmounted.borrow().len(), 2);
    }

    #[test]
    fn test_update_local_mounts_unwinds() {
        // The second planned mount (/var/lib/docker) fails
        let m = crate::tests::FakeMounter {
            fail_on: Some(2),
            ..Default::default()
        };
        let entries = parse_fstab(FSTAB);
        let live = crate::tests::fixture_table();
        let e = update_local_mounts(&entries, &live, "/".into(), &m).unwrap_err();
        let applied: Vec<_> = e.mounted.iter().map(|mp| mp.dest.as_str()).collect();
        assert_eq!(applied, ["/boot"]);
        assert_eq!(e.failed.dest, "/var/lib/docker");
        assert!(e.unwind.is_none());
        assert!(m.mounted.borrow().is_empty());
        assert_eq!(m.unmounted.borrow().last().unwrap(), "/boot");
    }
}
