//! # Directory replace engine
//!
//! Swapping the contents of a live directory `D` for the tree of version
//! `V` follows an on-disk protocol made of three sibling names inside `D`:
//!
//! - `D/.{V}`: the prepared tree, a faithful copy of the target version
//!   where unchanged files are hardlinks to the live ones.
//! - `D/.old{V}`: the holding directory where displaced live content is
//!   parked.
//! - `D/.old{V}.parked`: a stamp written once every live entry has been
//!   parked.
//!
//! The swap runs in two phases. Phase 1 moves live entries into the holding
//! directory and writes the stamp; phase 2 moves the prepared entries into
//! the live directory and removes the prepared tree. Every move is a
//! `rename(2)` within one filesystem and entries already moved are simply
//! absent from the source, so both phases can be rerun after a crash. The
//! names present at any moment are a complete description of the progress,
//! see [`SwapState`].
//!
//! Filtered paths (local overrides, other filesystems mounted below `D`) are
//! never touched. Directories containing a filtered path are recreated and
//! descended into instead of being moved wholesale.


use std::io::ErrorKind;
use std::process::Command;

use anyhow::{Context, Result};
use atomic_upgrade_utils::{path_covers, CommandRunExt};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir, fs::Metadata, fs::MetadataExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use rustix::fs::{AtFlags, Gid, Mode, Uid};

use crate::branch;
use crate::error::Error;

/// Progress of one directory swap, derived from the names present on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    /// None of the swap names exist.
    Clean,
    /// The prepared tree exists; live content is untouched.
    Prepared,
    /// The holding directory exists but phase 1 did not finish.
    Parking,
    /// Phase 1 finished; prepared entries are being installed.
    Installing,
    /// Phase 2 finished; the holding directory awaits cleanup.
    Installed,
}

/// Paths below a live directory that a swap must leave alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    paths: Vec<Utf8PathBuf>,
}

impl Filter {
    /// A filter made of the given absolute paths.
    pub fn new(paths: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    /// Add a path.
    pub fn push(&mut self, p: Utf8PathBuf) {
        if !self.paths.contains(&p) {
            self.paths.push(p);
        }
    }

    /// Whether `p` is a filtered path or below one.
    pub fn is_filtered(&self, p: &Utf8Path) -> bool {
        self.paths.iter().any(|f| path_covers(f, p))
    }

    /// Whether some filtered path lies strictly below `p`.
    pub fn has_filtered_below(&self, p: &Utf8Path) -> bool {
        self.paths.iter().any(|f| f != p && path_covers(p, f))
    }

    /// The filtered paths.
    pub fn iter(&self) -> impl Iterator<Item = &Utf8Path> {
        self.paths.iter().map(|p| p.as_path())
    }
}

/// What [`SwapDir::prepare`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrepareStats {
    /// Files hardlinked from the live tree.
    pub linked: u64,
    /// Files and symlinks copied from the snapshot.
    pub copied: u64,
    /// Filtered or special entries left out.
    pub skipped: u64,
}

/// One live directory being swapped to one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapDir {
    dir: Utf8PathBuf,
    version: String,
}

fn exists_nofollow(p: &Utf8Path) -> std::io::Result<bool> {
    match p.symlink_metadata() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn open_dir(p: &Utf8Path) -> Result<Dir> {
    Dir::open_ambient_dir(p, cap_std::ambient_authority()).with_context(|| format!("Opening {p}"))
}

/// Open subdirectory `name` of `d`, creating it if missing.
fn ensure_subdir(d: &Dir, name: &str) -> Result<Dir> {
    if d.symlink_metadata_optional(name)?.is_none() {
        d.create_dir(name).with_context(|| format!("Creating {name}"))?;
    }
    d.open_dir(name).with_context(|| format!("Opening {name}"))
}

/// A subdirectory that is a real directory, not a symlink to one.
fn open_subdir_nofollow(d: &Dir, name: &str) -> Result<Option<Dir>> {
    match d.symlink_metadata_optional(name)? {
        Some(m) if m.is_dir() => Ok(Some(d.open_dir(name)?)),
        _ => Ok(None),
    }
}

fn sync_dir(d: &Dir, p: &Utf8Path) -> Result<()> {
    d.open(".")
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Syncing {p}"))
}

fn remove_path(p: &Utf8Path) -> std::io::Result<()> {
    match p.symlink_metadata() {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(m) if m.is_dir() => std::fs::remove_dir_all(p),
        Ok(_) => std::fs::remove_file(p),
    }
}

/// Remove `p`; if that is refused, clear immutable attributes and retry.
pub(crate) fn remove_clearing_immutable(p: &Utf8Path) -> Result<()> {
    match remove_path(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            tracing::warn!("Removing {p} failed ({e}); clearing immutable attributes");
            Command::new("chattr")
                .args(["-R", "-i"])
                .arg(p.as_str())
                .log_debug()
                .run_capture_stderr()?;
            remove_path(p).with_context(|| format!("Removing {p}"))
        }
        Err(e) => Err(e).with_context(|| format!("Removing {p}")),
    }
}

/// Give `name` in `dst` the owner and mode recorded in `meta`.
fn copy_owner_and_mode(meta: &Metadata, dst: &Dir, name: &str) -> Result<()> {
    let (uid, gid) = (Uid::from_raw(meta.uid()), Gid::from_raw(meta.gid()));
    rustix::fs::chownat(dst, name, Some(uid), Some(gid), AtFlags::SYMLINK_NOFOLLOW)
        .with_context(|| format!("Changing owner of {name}"))?;
    if !meta.file_type().is_symlink() {
        rustix::fs::chmodat(dst, name, Mode::from_raw_mode(meta.mode()), AtFlags::empty())
            .with_context(|| format!("Changing mode of {name}"))?;
    }
    Ok(())
}

fn file_digest(d: &Dir, name: &str) -> Result<String> {
    let mut f = d.open(name).with_context(|| format!("Opening {name}"))?;
    let mut h = Hasher::new(MessageDigest::sha256())?;
    std::io::copy(&mut f, &mut h).with_context(|| format!("Hashing {name}"))?;
    Ok(hex::encode(h.finish()?))
}

/// Whether `name` in `live` can stand in for `name` in `snap`: the same
/// inode, or the same size, mode, owner and content.
fn is_same_file(meta: &Metadata, snap: &Dir, live: &Dir, name: &str) -> Result<bool> {
    let Some(lm) = live.symlink_metadata_optional(name)? else {
        return Ok(false);
    };
    if !lm.is_file() {
        return Ok(false);
    }
    if lm.dev() == meta.dev() && lm.ino() == meta.ino() {
        return Ok(true);
    }
    if lm.len() != meta.len()
        || lm.mode() != meta.mode()
        || lm.uid() != meta.uid()
        || lm.gid() != meta.gid()
    {
        return Ok(false);
    }
    Ok(file_digest(snap, name)? == file_digest(live, name)?)
}

/// Recreates a tree in a new directory, skipping entries whose counterpart
/// in the live directory is filtered.
struct Copier<'a> {
    filter: &'a Filter,
    /// Hardlink files whose live counterpart is identical instead of
    /// copying them.
    link_unchanged: bool,
    stats: PrepareStats,
}

impl Copier<'_> {
    /// Recreate the entries of `src` in `dst`. `live` is the directory
    /// at `live_path` they correspond to, when it exists.
    fn copy_dir(
        &mut self,
        src: &Dir,
        dst: &Dir,
        live: Option<&Dir>,
        live_path: &Utf8Path,
    ) -> Result<()> {
        let entries = src
            .entries_utf8()
            .with_context(|| format!("Reading snapshot of {live_path}"))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name()?;
            let child_path = live_path.join(&name);
            if self.filter.is_filtered(&child_path) {
                self.stats.skipped += 1;
                continue;
            }
            let meta = entry.metadata()?;
            let ft = meta.file_type();
            if ft.is_dir() {
                dst.create_dir(&name)
                    .with_context(|| format!("Creating copy of {child_path}"))?;
                let child_live = match live {
                    Some(d) => open_subdir_nofollow(d, &name)?,
                    None => None,
                };
                self.copy_dir(
                    &src.open_dir(&name)?,
                    &dst.open_dir(&name)?,
                    child_live.as_ref(),
                    &child_path,
                )?;
                copy_owner_and_mode(&meta, dst, &name)?;
            } else if ft.is_symlink() {
                let target = src.read_link_contents(&name)?;
                dst.symlink_contents(&target, &name)
                    .with_context(|| format!("Creating symlink for {child_path}"))?;
                copy_owner_and_mode(&meta, dst, &name)?;
                self.stats.copied += 1;
            } else if ft.is_file() {
                if let Some(live) = live.filter(|_| self.link_unchanged) {
                    if is_same_file(&meta, src, live, &name)? {
                        match live.hard_link(&name, dst, &name) {
                            Ok(()) => {
                                self.stats.linked += 1;
                                continue;
                            }
                            Err(e) => {
                                tracing::debug!("Hardlinking {child_path} failed, copying: {e}")
                            }
                        }
                    }
                }
                src.copy(&name, dst, &name)
                    .with_context(|| format!("Copying {child_path}"))?;
                copy_owner_and_mode(&meta, dst, &name)?;
                self.stats.copied += 1;
            } else {
                tracing::warn!("Skipping special file at {child_path}");
                self.stats.skipped += 1;
            }
        }
        Ok(())
    }
}

/// Copy the live tree `src` into the new directory `dst`, leaving out
/// filtered paths.
#[context("Copying {src} to {dst}")]
pub fn copy_filtered(src: &Utf8Path, dst: &Utf8Path, filter: &Filter) -> Result<PrepareStats> {
    let src_dir = open_dir(src)?;
    std::fs::create_dir_all(dst).with_context(|| format!("Creating {dst}"))?;
    let dst_dir = open_dir(dst)?;
    let mut copier = Copier {
        filter,
        link_unchanged: false,
        stats: PrepareStats::default(),
    };
    copier.copy_dir(&src_dir, &dst_dir, None, src)?;
    copy_owner_and_mode(&src_dir.dir_metadata()?, &dst_dir, ".")?;
    Ok(copier.stats)
}

/// Moves the entries of one tree into another, mirroring the layout of
/// the live directory.
struct Mover<'a> {
    swap: &'a SwapDir,
    filter: &'a Filter,
    /// Where conflicting destination entries are parked; removed if unset.
    aside: Option<&'a Dir>,
}

impl Mover<'_> {
    /// Clear `name` in `dst`, found at `rel` below the live directory.
    fn set_aside(&self, dst: &Dir, name: &str, rel: &Utf8Path) -> Result<()> {
        let live = self.swap.dir.join(rel);
        if let Some(aside) = self.aside {
            if aside.symlink_metadata_optional(rel)?.is_none() {
                if let Some(parent) = rel.parent().filter(|p| !p.as_str().is_empty()) {
                    aside.create_dir_all(parent)?;
                }
                tracing::warn!("Moving conflicting {live} aside");
                dst.rename(name, aside, rel)
                    .with_context(|| format!("Moving {live} aside"))?;
                return Ok(());
            }
        }
        tracing::warn!("Removing conflicting {live}");
        dst.remove_all_optional(name)
            .with_context(|| format!("Removing {live}"))?;
        Ok(())
    }

    /// Move the entries of `src` into `dst`, both found at `rel` in their
    /// respective trees.
    fn move_dir(&self, src: &Dir, dst: &Dir, rel: &Utf8Path) -> Result<()> {
        let entries = src
            .entries_utf8()
            .with_context(|| format!("Reading {rel}"))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name()?;
            if rel.as_str().is_empty() && self.swap.is_internal(&name) {
                continue;
            }
            let rel_child = rel.join(&name);
            let live = self.swap.dir.join(&rel_child);
            if self.filter.is_filtered(&live) {
                continue;
            }
            let is_dir = entry.file_type()?.is_dir();
            let to_meta = dst
                .symlink_metadata_optional(&name)
                .with_context(|| format!("Inspecting {live}"))?;
            let to_is_dir = to_meta.as_ref().is_some_and(|m| m.is_dir());
            if is_dir && (to_is_dir || self.filter.has_filtered_below(&live)) {
                if !to_is_dir {
                    if to_meta.is_some() {
                        self.set_aside(dst, &name, &rel_child)?;
                    }
                    dst.create_dir(&name)
                        .with_context(|| format!("Creating {live}"))?;
                }
                self.move_dir(&src.open_dir(&name)?, &dst.open_dir(&name)?, &rel_child)?;
                copy_owner_and_mode(&entry.metadata()?, dst, &name)?;
                continue;
            }
            if to_meta.is_some() {
                self.set_aside(dst, &name, &rel_child)?;
            }
            tracing::trace!("Moving {rel_child}");
            src.rename(&name, dst, &name)
                .with_context(|| format!("Moving {live}"))?;
        }
        Ok(())
    }
}

impl SwapDir {
    /// Swap state for live directory `dir` and `version`. The internal
    /// names are derived from `version`, so it must be a valid branch name
    /// that stays inside `dir`.
    pub fn new(dir: &Utf8Path, version: &str) -> Result<Self> {
        if !branch::is_valid(version) || version.contains('/') {
            return Err(Error::InvalidBranch(version.to_owned()).into());
        }
        Ok(Self {
            dir: dir.to_owned(),
            version: version.to_owned(),
        })
    }

    /// The live directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn prepared_name(&self) -> String {
        format!(".{}", self.version)
    }

    fn holding_name(&self) -> String {
        format!(".old{}", self.version)
    }

    fn stamp_name(&self) -> String {
        format!(".old{}.parked", self.version)
    }

    /// `D/.{V}`
    pub fn prepared_path(&self) -> Utf8PathBuf {
        self.dir.join(self.prepared_name())
    }

    /// `D/.old{V}`
    pub fn holding_path(&self) -> Utf8PathBuf {
        self.dir.join(self.holding_name())
    }

    /// `D/.old{V}.parked`
    pub fn stamp_path(&self) -> Utf8PathBuf {
        self.dir.join(self.stamp_name())
    }

    fn is_internal(&self, name: &str) -> bool {
        name.strip_prefix('.').is_some_and(|rest| {
            rest == self.version
                || rest
                    .strip_prefix("old")
                    .and_then(|r| r.strip_prefix(self.version.as_str()))
                    .is_some_and(|r| r.is_empty() || r == ".parked")
        })
    }

    /// Derive the progress of this swap from the filesystem.
    pub fn state(&self) -> Result<SwapState> {
        let prepared = exists_nofollow(&self.prepared_path())?;
        let holding = exists_nofollow(&self.holding_path())?;
        let stamp = exists_nofollow(&self.stamp_path())?;
        let r = match (stamp, prepared, holding) {
            (true, true, _) => SwapState::Installing,
            (true, false, _) => SwapState::Installed,
            (false, _, true) => SwapState::Parking,
            (false, true, false) => SwapState::Prepared,
            (false, false, false) => SwapState::Clean,
        };
        Ok(r)
    }

    /// Materialize the tree at `snapshot` as the prepared tree. Any leftover
    /// from an earlier attempt is removed first.
    #[context("Preparing {} from {snapshot}", self.dir)]
    pub fn prepare(&self, snapshot: &Utf8Path, filter: &Filter) -> Result<PrepareStats> {
        self.cleanup()?;
        std::fs::create_dir_all(&self.dir)?;
        let live = open_dir(&self.dir)?;
        let name = self.prepared_name();
        live.create_dir(&name)
            .with_context(|| format!("Creating {}", self.prepared_path()))?;
        let mut copier = Copier {
            filter,
            link_unchanged: true,
            stats: PrepareStats::default(),
        };
        if snapshot.try_exists()? {
            let snap = open_dir(snapshot)?;
            copier.copy_dir(&snap, &live.open_dir(&name)?, Some(&live), &self.dir)?;
            copy_owner_and_mode(&snap.dir_metadata()?, &live, &name)?;
        } else {
            tracing::warn!("{snapshot} does not exist; {} will be emptied", self.dir);
        }
        sync_dir(&live, &self.dir)?;
        let stats = copier.stats;
        tracing::debug!("Prepared {}: {stats:?}", self.prepared_path());
        Ok(stats)
    }

    /// Phase 1: park every unfiltered live entry and write the stamp.
    fn park(&self, filter: &Filter) -> Result<()> {
        let live = open_dir(&self.dir)?;
        let holding = ensure_subdir(&live, &self.holding_name())?;
        let mover = Mover {
            swap: self,
            filter,
            aside: None,
        };
        mover.move_dir(&live, &holding, Utf8Path::new(""))?;
        sync_dir(&holding, &self.holding_path())?;
        let stamp = self.stamp_name();
        live.write(&stamp, format!("{}\n", self.version))
            .and_then(|()| live.open(&stamp)?.sync_all())
            .with_context(|| format!("Writing {}", self.stamp_path()))?;
        sync_dir(&live, &self.dir)?;
        tracing::debug!("Parked {} in {}", self.dir, self.holding_path());
        Ok(())
    }

    /// Swap the live contents for the prepared tree, resuming an
    /// interrupted swap where it stopped.
    #[context("Replacing {}", self.dir)]
    pub fn replace(&self, filter: &Filter) -> Result<()> {
        match self.state()? {
            SwapState::Clean => {
                anyhow::bail!("No prepared tree {} to install", self.prepared_path())
            }
            SwapState::Installed => {
                tracing::info!("{} already holds {}", self.dir, self.version);
                return Ok(());
            }
            SwapState::Installing => tracing::info!("Resuming install into {}", self.dir),
            SwapState::Prepared | SwapState::Parking => self.park(filter)?,
        }
        let live = open_dir(&self.dir)?;
        let holding = ensure_subdir(&live, &self.holding_name())?;
        let prepared = live.open_dir(self.prepared_name())?;
        let mover = Mover {
            swap: self,
            filter,
            aside: Some(&holding),
        };
        mover.move_dir(&prepared, &live, Utf8Path::new(""))?;
        sync_dir(&live, &self.dir)?;
        drop(prepared);
        live.remove_dir_all(self.prepared_name())
            .with_context(|| format!("Removing {}", self.prepared_path()))?;
        sync_dir(&live, &self.dir)?;
        tracing::info!("Replaced {} with {}", self.dir, self.version);
        Ok(())
    }

    /// Undo a partial or complete swap, restoring the parked live content.
    #[context("Recovering {}", self.dir)]
    pub fn recover(&self, filter: &Filter) -> Result<()> {
        if !exists_nofollow(&self.holding_path())? {
            tracing::info!("No holding directory in {}, nothing to recover", self.dir);
            return Ok(());
        }
        let live = open_dir(&self.dir)?;
        let holding = live.open_dir(self.holding_name())?;
        let mover = Mover {
            swap: self,
            filter,
            aside: None,
        };
        let stamp = self.stamp_name();
        if live.symlink_metadata_optional(&stamp)?.is_some() {
            // New content was (partly) installed: move it back out first.
            let prepared = ensure_subdir(&live, &self.prepared_name())?;
            mover.move_dir(&live, &prepared, Utf8Path::new(""))?;
            sync_dir(&prepared, &self.prepared_path())?;
            live.remove_file(&stamp)
                .with_context(|| format!("Removing {}", self.stamp_path()))?;
            sync_dir(&live, &self.dir)?;
        }
        mover.move_dir(&holding, &live, Utf8Path::new(""))?;
        sync_dir(&live, &self.dir)?;
        drop(holding);
        live.remove_dir_all(self.holding_name())
            .with_context(|| format!("Removing {}", self.holding_path()))?;
        sync_dir(&live, &self.dir)?;
        tracing::info!("Recovered {}", self.dir);
        Ok(())
    }

    /// Remove the holding directory, the stamp and the prepared tree.
    #[context("Cleaning up {}", self.dir)]
    pub fn cleanup(&self) -> Result<()> {
        for p in [self.holding_path(), self.stamp_path(), self.prepared_path()] {
            remove_clearing_immutable(&p)?;
        }
        Ok(())
    }
}
