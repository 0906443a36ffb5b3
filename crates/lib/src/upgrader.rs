//! # Commit, rollback and delete orchestration
//!
//! [`Upgrader`] sequences the operations across all configured
//! repositories. A rollback is split in two: an interactive session only
//! records the intent in the progress ledger and shortens the boot menu
//! timeout; the actual swap runs in early boot (see [`Upgrader::boot_check`])
//! where nothing else is using the files being replaced.
//!
//! Every durable milestone of the swap is recorded in the ledger before the
//! work starts, and every step is idempotent, so a crash at any point is
//! either resumed or recovered on the next boot.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use atomic_upgrade_mount::{
    foreign_submounts, predefined_binds, read_fstab, subscription_binds, update_local_mounts,
    Filesystem, MountList, Mounter, SystemMounter,
};
use atomic_upgrade_utils::{rebase_under_root, CommandRunExt, ResultExt};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde::Serialize;

use crate::bootloader::{BootKit, Bootloader, CommandBootKit, Grub, GRUB_DEFAULTS};
use crate::branch::{self, BranchName};
use crate::config::{Config, RepoConfig};
use crate::error::Error;
use crate::ledger::{Ledger, RollbackState, LEDGER_DIR};
use crate::notify::{ResultRecord, RESULT_PATH};
use crate::progress::{ProgressSink, Reporter, StateCode};
use crate::replace::{self, Filter, SwapDir};
use crate::repo::{self, DiffEntry, Repository};
use crate::space::{self, DiskSpace, Statvfs};

/// Boot menu timeout while a rollback is scheduled.
const SCHEDULED_TIMEOUT: u32 = 1;
/// How long to wait for a running boot menu update.
const WAIT_IDLE: Duration = Duration::from_secs(10);
/// Subscribed path that is always swapped last.
const BOOT_DIR: &str = "/boot";

/// Source of the live mount table.
pub trait MountTable: std::fmt::Debug + Send + Sync {
    /// All mounted filesystems, parents before children.
    fn mounts(&self) -> Result<Vec<Filesystem>>;
}

/// The mount table of the running system.
#[derive(Debug, Default)]
pub struct LiveMountTable;

impl MountTable for LiveMountTable {
    fn mounts(&self) -> Result<Vec<Filesystem>> {
        atomic_upgrade_mount::mount_table()
    }
}

/// The external systems an [`Upgrader`] drives.
#[derive(Debug)]
pub struct Collaborators {
    /// One store per configured repository, in configuration order.
    pub repos: Vec<Box<dyn Repository>>,
    /// Applies mounts.
    pub mounter: Box<dyn Mounter + Send + Sync>,
    /// Reads the mount table.
    pub mount_table: Box<dyn MountTable>,
    /// The boot menu.
    pub bootloader: Box<dyn Bootloader>,
    /// Source of version names.
    pub bootkit: Box<dyn BootKit>,
    /// Free space check.
    pub space: Box<dyn DiskSpace>,
}

impl Collaborators {
    /// The real implementations for a system mounted at `root`; `config`
    /// must already be relocated there.
    pub fn system(config: &Config, root: &Utf8Path) -> Self {
        let repos = config
            .repo_list
            .iter()
            .map(|rc| repo::open(rc.kind, &rc.repo))
            .collect();
        let update_cmd = if root == "/" {
            config.bootloader_update_cmd.clone()
        } else {
            let root = shlex::try_quote(root.as_str())
                .map(|q| q.into_owned())
                .unwrap_or_else(|_| root.to_string());
            format!("chroot {root} {}", config.bootloader_update_cmd)
        };
        let defaults = to_utf8(rebase_under_root(root, GRUB_DEFAULTS));
        Self {
            repos,
            mounter: Box::new(SystemMounter),
            mount_table: Box::new(LiveMountTable),
            bootloader: Box::new(Grub::new(&defaults, &update_cmd)),
            bootkit: Box::new(CommandBootKit::new(config.bootkit_version_cmd.as_deref())),
            space: Box::new(Statvfs),
        }
    }
}

/// A flag checked between steps; setting it stops an operation before the
/// next step starts.
#[derive(Debug, Clone, Default)]
pub struct Cancellable(Arc<AtomicBool>);

impl Cancellable {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("Operation cancelled");
        }
        Ok(())
    }
}

/// When an unfinished rollback found in the ledger may be continued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    /// A running session: only a scheduled intent is picked up, and the
    /// rollback is recorded for the next boot rather than executed.
    Interactive,
    /// Early boot: any unfinished attempt is continued and executed now.
    EarlyBoot,
}

/// Arguments of [`Upgrader::commit`].
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Name of the new version; derived when unset.
    pub version: Option<String>,
    /// Commit message; derived when unset.
    pub subject: Option<String>,
    /// Copy the subscribed paths of the running system into the stage
    /// directory first; otherwise the stage directory is committed as is.
    pub use_sys_data: bool,
    /// Environment of the after-run hook.
    pub env: Vec<(String, String)>,
}

/// What [`Upgrader::rollback`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Recorded for the next boot.
    Scheduled(String),
    /// Executed now.
    Completed(String),
}

/// What [`Upgrader::boot_check`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootCheck {
    /// Nothing was pending.
    Idle,
    /// A failed attempt was undone.
    Recovered(String),
    /// A scheduled or interrupted rollback was executed.
    Executed(String),
}

/// One row of [`Upgrader::list`].
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    /// The version.
    pub version: String,
    /// Its commit message.
    pub subject: String,
    /// When it was committed.
    pub time: Option<DateTime<Utc>>,
    /// Whether the system runs it.
    pub active: bool,
}

/// One directory swapped as a unit.
#[derive(Debug)]
struct Unit {
    swap: SwapDir,
    snapshot: Utf8PathBuf,
    filter: Filter,
}

/// Drives commit, rollback and delete.
#[derive(Debug)]
pub struct Upgrader {
    /// The configuration as stored on disk.
    stored: Config,
    /// The configuration relocated below `root`.
    config: Config,
    config_path: Utf8PathBuf,
    root: Utf8PathBuf,
    result_path: Utf8PathBuf,
    c: Collaborators,
    cancel: Cancellable,
}

fn to_utf8(p: std::path::PathBuf) -> Utf8PathBuf {
    // Only ever called on paths joined from UTF-8 parts
    Utf8PathBuf::from_path_buf(p)
        .unwrap_or_else(|p| Utf8PathBuf::from(p.to_string_lossy().into_owned()))
}

fn relative(p: &Utf8Path) -> &Utf8Path {
    p.strip_prefix("/").unwrap_or(p)
}

fn first_error(results: impl IntoIterator<Item = Result<()>>) -> Result<()> {
    let mut first = None;
    for r in results {
        if let Err(e) = r {
            tracing::warn!("{e:#}");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

impl Upgrader {
    /// An upgrader for the system mounted at `root` using the real
    /// collaborators.
    pub fn new(config: Config, config_path: &Utf8Path, root: &Utf8Path) -> Result<Self> {
        let relocated = config.with_root(root);
        let c = Collaborators::system(&relocated, root);
        Self::with_collaborators(config, config_path, root, c)
    }

    /// An upgrader using the given collaborators.
    pub fn with_collaborators(
        config: Config,
        config_path: &Utf8Path,
        root: &Utf8Path,
        c: Collaborators,
    ) -> Result<Self> {
        if c.repos.len() != config.repo_list.len() {
            return Err(Error::Config(format!(
                "{} repositories configured but {} opened",
                config.repo_list.len(),
                c.repos.len()
            ))
            .into());
        }
        Ok(Self {
            config: config.with_root(root),
            stored: config,
            config_path: config_path.to_owned(),
            root: root.to_owned(),
            result_path: to_utf8(rebase_under_root(root, RESULT_PATH)),
            c,
            cancel: Cancellable::default(),
        })
    }

    /// A handle to cancel running operations.
    pub fn cancellable(&self) -> Cancellable {
        self.cancel.clone()
    }

    /// The configuration, relocated below the target root.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Where the outcome of a rollback is recorded.
    pub fn result_path(&self) -> &Utf8Path {
        &self.result_path
    }

    fn primary(&self) -> &dyn Repository {
        // Checked non-empty when the configuration was parsed.
        self.c.repos[0].as_ref()
    }

    /// Initialize every repository.
    pub fn init(&self) -> Result<()> {
        for r in self.c.repos.iter() {
            r.init()?;
        }
        Ok(())
    }

    /// All versions, newest first.
    pub fn list(&self) -> Result<Vec<VersionInfo>> {
        let repo = self.primary();
        repo.list()?
            .into_iter()
            .map(|version| {
                Ok(VersionInfo {
                    subject: repo.subject(&version)?,
                    time: repo
                        .commit_time(&version)
                        .map_err(|e| tracing::warn!("{e:#}"))
                        .ok(),
                    active: version == self.config.active_version,
                    version,
                })
            })
            .collect()
    }

    /// Paths that differ between two versions.
    pub fn diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>> {
        self.primary().diff(from, to)
    }

    /// The contents of `path` in `version`.
    pub fn cat(&self, version: &str, path: &Utf8Path) -> Result<Vec<u8>> {
        self.primary().cat(version, path)
    }

    /// The progress ledger of the target root.
    pub fn ledger(&self) -> Result<Ledger> {
        Ledger::open(&self.root)
    }

    fn save_active_version(&mut self, version: &str) -> Result<()> {
        let mut stored = self.stored.clone();
        stored.active_version = version.to_owned();
        stored.save(&self.config_path)?;
        self.stored = stored;
        self.config.active_version = version.to_owned();
        Ok(())
    }

    /// The configured filter of `rc` as live paths. Our own state is
    /// always excluded.
    fn base_filter(&self, rc: &RepoConfig) -> Filter {
        let mut f = Filter::new(rc.filter_list.iter().map(|p| rc.live_path(p)));
        f.push(self.root.join(LEDGER_DIR));
        if let Some(dir) = self.config_path.parent() {
            f.push(dir.to_owned());
        }
        f
    }

    /// Pick the name of a new version: explicit, from the boot kit, or the
    /// successor of the newest version.
    fn resolve_version(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(v) = explicit {
            let _: BranchName = v.parse()?;
            return Ok(v.to_owned());
        }
        if let Some(v) = self.c.bootkit.current_version()? {
            if branch::is_valid(&v) && !self.primary().exists(&v)? {
                return Ok(v);
            }
            tracing::info!("Ignoring boot kit version {v}");
        }
        let today = branch::today();
        match self.primary().last()? {
            Some(last) => branch::increment(&last, today),
            None => Ok(branch::gen_init_name(&self.config.distribution, today)),
        }
    }

    /// Verify there is room to stage the subscribed paths of `rc`.
    fn check_stage_space(&self, rc: &RepoConfig, filter: &Filter) -> Result<()> {
        let mut needed = 0u64;
        for sub in rc.subscribe_list.iter() {
            needed = needed.saturating_add(space::tree_size(&rc.live_path(sub), filter)?);
        }
        // Stale content is removed before copying.
        let stale = space::tree_size(&rc.stage_dir, &Filter::default())?;
        let extra = -i64::try_from(stale).unwrap_or(i64::MAX);
        let required = space::required_bytes(needed, extra);
        let measured = rc.stage_dir.parent().unwrap_or(&rc.stage_dir);
        std::fs::create_dir_all(measured).with_context(|| format!("Creating {measured}"))?;
        space::ensure_space(self.c.space.as_ref(), measured, required)
    }

    #[context("Staging system data")]
    fn stage_sys_data(&self, rc: &RepoConfig, filter: &Filter) -> Result<()> {
        if rc.stage_dir.try_exists()? {
            std::fs::remove_dir_all(&rc.stage_dir)
                .with_context(|| format!("Removing stale {}", rc.stage_dir))?;
        }
        std::fs::create_dir_all(&rc.stage_dir)?;
        for sub in rc.subscribe_list.iter() {
            self.cancel.check()?;
            let live = rc.live_path(sub);
            if !live.try_exists()? {
                tracing::warn!("Subscribed path {live} does not exist");
                continue;
            }
            let stats = replace::copy_filtered(&live, &rc.stage_dir.join(relative(sub)), filter)?;
            tracing::debug!("Staged {live}: {stats:?}");
        }
        Ok(())
    }

    /// Run the after-run hook of a commit inside a scratch root assembled
    /// from the live system and the staged tree.
    #[context("Running after-run hook")]
    fn run_after_run(&self, rc: &RepoConfig, cmd: &str, env: &[(String, String)]) -> Result<()> {
        let scratch = self.config.cache_dir.join("rootfs");
        std::fs::create_dir_all(&scratch)?;
        let mut list = predefined_binds(&self.root, &scratch);
        list.extend(subscription_binds(&rc.stage_dir, &scratch, &rc.subscribe_list));
        let mounted = list
            .mount(self.c.mounter.as_ref())
            .map_err(|e| Error::Mount(e.to_string()))?;
        let r = Command::new("chroot")
            .arg(scratch.as_str())
            .args(["/bin/sh", "-c", cmd])
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .log_debug()
            .run_capture_stderr();
        mounted
            .umount(self.c.mounter.as_ref())
            .log_err_with("Unmounting scratch root");
        r
    }

    /// Delete everything that belongs to `version`.
    fn remove_version(&self, version: &str) -> Result<()> {
        for (rc, repo) in self.config.repo_list.iter().zip(self.c.repos.iter()) {
            if repo.exists(version)? {
                repo.delete(version)?;
            }
            for p in [rc.snapshot_path(version), rc.config_dir.join(version)] {
                replace::remove_clearing_immutable(&p)?;
            }
        }
        replace::remove_clearing_immutable(&self.config.boot_cache_path(version))?;
        tracing::info!("Removed {version}");
        Ok(())
    }

    /// Prune versions beyond the retention count. The first, the active
    /// and the newest version are always kept. Returns whether the boot
    /// menu was regenerated.
    fn auto_cleanup(&self) -> Result<bool> {
        let keep = self.config.max_version_retention.max(1);
        let list = self.primary().list()?;
        let (Some(newest), Some(first)) = (list.first(), list.last()) else {
            return Ok(false);
        };
        let victims: Vec<&String> = list
            .iter()
            .skip(keep)
            .filter(|v| *v != newest && *v != first && **v != self.config.active_version)
            .collect();
        if victims.is_empty() {
            return Ok(false);
        }
        for v in victims {
            self.remove_version(v)?;
        }
        self.c.bootloader.update_menu()?;
        Ok(true)
    }

    /// Commit a new version. Returns its name.
    pub fn commit(&mut self, opts: &CommitOptions, sink: &dyn ProgressSink) -> Result<String> {
        let mut r = Reporter {
            sink,
            version: opts.version.clone().unwrap_or_default(),
        };
        match self.commit_impl(opts, &mut r) {
            Ok(v) => {
                r.emit(StateCode::CommitSucceeded, "");
                Ok(v)
            }
            Err(e) => {
                r.emit(StateCode::CommitFailed, format!("{e:#}"));
                Err(e)
            }
        }
    }

    fn commit_impl(&mut self, opts: &CommitOptions, r: &mut Reporter) -> Result<String> {
        self.init()?;
        let version = self.resolve_version(opts.version.as_deref())?;
        r.version = version.clone();
        r.emit(StateCode::CommitStart, "");
        let subject = opts
            .subject
            .clone()
            .unwrap_or_else(|| format!("Release {version}"));
        for (i, rc) in self.config.repo_list.iter().enumerate() {
            self.cancel.check()?;
            let repo = self.c.repos[i].as_ref();
            if repo.exists(&version)? {
                return Err(Error::Repo(format!("Version {version} already exists")).into());
            }
            let data = rc.stage_data(&version)?;
            let mut rc = rc.clone();
            rc.merge_data(&data);
            let filter = self.base_filter(&rc);
            if opts.use_sys_data {
                r.emit(StateCode::CommitCheckingSpace, rc.stage_dir.as_str());
                self.check_stage_space(&rc, &filter)?;
                r.emit(StateCode::CommitCopying, rc.stage_dir.as_str());
                self.stage_sys_data(&rc, &filter)?;
            } else if !rc.stage_dir.try_exists()? {
                return Err(Error::Repo(format!("Nothing staged in {}", rc.stage_dir)).into());
            }
            self.cancel.check()?;
            r.emit(StateCode::CommitCommitting, rc.repo.as_str());
            repo.commit(&version, &subject, &rc.stage_dir)?;
            if let Some(cmd) = data.target.after_run.as_deref() {
                self.run_after_run(&rc, cmd, &opts.env)?;
            }
            if opts.use_sys_data {
                std::fs::remove_dir_all(&rc.stage_dir).log_err_with("Removing stage directory");
            }
        }
        self.save_active_version(&version)?;
        let mut menu_updated = false;
        if self.config.auto_cleanup {
            r.emit(StateCode::CommitCleaning, "");
            menu_updated = self.auto_cleanup()?;
        }
        if !menu_updated {
            r.emit(StateCode::CommitBootloader, "");
            self.c.bootloader.update_menu()?;
        }
        tracing::info!("Committed {version}");
        Ok(version)
    }

    /// Delete a version that is neither the first nor the active one.
    pub fn delete(&mut self, version: &str, sink: &dyn ProgressSink) -> Result<()> {
        let r = Reporter {
            sink,
            version: version.to_owned(),
        };
        r.emit(StateCode::DeleteStart, "");
        let res = self.delete_impl(version);
        match res.as_ref() {
            Ok(()) => r.emit(StateCode::DeleteSucceeded, ""),
            Err(e) => r.emit(StateCode::DeleteFailed, format!("{e:#}")),
        }
        res
    }

    fn delete_impl(&mut self, version: &str) -> Result<()> {
        let _: BranchName = version.parse()?;
        let first = self.primary().first()?;
        if first.as_deref() == Some(version) || self.config.active_version == version {
            return Err(Error::ProtectedVersion(version.to_owned()).into());
        }
        if !self.primary().exists(version)? {
            return Err(Error::Repo(format!("Version {version} does not exist")).into());
        }
        self.remove_version(version)?;
        self.c.bootloader.update_menu()?;
        Ok(())
    }

    /// Add units for `live` and, separately, for every foreign filesystem
    /// mounted below it.
    fn push_units(
        out: &mut Vec<Unit>,
        table: &[Filesystem],
        live: &Utf8Path,
        snapshot: &Utf8Path,
        base: &Filter,
        version: &str,
    ) -> Result<()> {
        let foreign = foreign_submounts(table, live);
        let mut filter = base.clone();
        for f in foreign.iter() {
            filter.push(f.clone());
        }
        out.push(Unit {
            swap: SwapDir::new(live, version)?,
            snapshot: snapshot.to_owned(),
            filter,
        });
        for f in foreign.iter().filter(|f| !base.is_filtered(f)) {
            let Ok(rel) = f.strip_prefix(live) else {
                continue;
            };
            Self::push_units(out, table, f, &snapshot.join(rel), base, version)?;
        }
        Ok(())
    }

    /// The directories to swap for `version`, `/boot` last.
    fn plan_units(&self, version: &str) -> Result<Vec<Unit>> {
        let table = self.c.mount_table.mounts()?;
        let mut units = Vec::new();
        for rc in self.config.repo_list.iter() {
            let mut rc = rc.clone();
            rc.merge_data(&rc.load_data(version)?);
            let base = self.base_filter(&rc);
            let snap_root = rc.snapshot_path(version);
            for sub in rc.subscribe_list.iter() {
                let live = rc.live_path(sub);
                let snapshot = snap_root.join(relative(sub));
                Self::push_units(&mut units, &table, &live, &snapshot, &base, version)?;
            }
        }
        let boot = to_utf8(rebase_under_root(&self.root, BOOT_DIR));
        units.sort_by_key(|u| atomic_upgrade_utils::path_covers(&boot, u.swap.dir()));
        Ok(units)
    }

    fn checkout_snapshots(&self, version: &str) -> Result<()> {
        for (rc, repo) in self.config.repo_list.iter().zip(self.c.repos.iter()) {
            let dst = rc.snapshot_path(version);
            replace::remove_clearing_immutable(&dst)?;
            repo.snapshot(version, &dst)?;
        }
        Ok(())
    }

    /// Mount what the fstab of `version` describes but the live system
    /// lacks. Whatever got mounted is appended to `mounts`, also on failure.
    fn update_mounts(&self, version: &str, mounts: &mut MountList) -> Result<()> {
        let table = self.c.mount_table.mounts()?;
        for rc in self.config.repo_list.iter() {
            let fstab = rc.snapshot_path(version).join("etc/fstab");
            if !fstab.try_exists()? {
                continue;
            }
            let entries = read_fstab(&fstab)?;
            match update_local_mounts(&entries, &table, &self.root, self.c.mounter.as_ref()) {
                Ok(m) => mounts.extend(m),
                Err(e) => {
                    if e.unwind.is_some() {
                        mounts.extend(e.mounted.clone());
                    }
                    return Err(Error::Mount(e.to_string()).into());
                }
            }
        }
        Ok(())
    }

    fn execute_steps(
        &mut self,
        ledger: &mut Ledger,
        version: &str,
        r: &Reporter,
        units: &mut Vec<Unit>,
        mounts: &mut MountList,
    ) -> Result<()> {
        *units = self.plan_units(version)?;
        self.cancel.check()?;
        if ledger.state() != RollbackState::ReplaceFile {
            r.emit(StateCode::RollbackSnapshot, "");
            self.checkout_snapshots(version)?;
        }
        if ledger.is_need_prepare_repo_file()? {
            r.emit(StateCode::RollbackPrepare, "");
            for u in units.iter() {
                self.cancel.check()?;
                let stats = u.swap.prepare(&u.snapshot, &u.filter)?;
                tracing::info!("Prepared {}: {stats:?}", u.swap.dir());
            }
        }
        self.cancel.check()?;
        self.update_mounts(version, mounts)?;
        if ledger.is_need_replace_file()? {
            r.emit(StateCode::RollbackReplace, "");
            for u in units.iter() {
                u.swap.replace(&u.filter)?;
            }
        }
        self.save_active_version(version)?;
        Ok(())
    }

    fn recover_units(units: &[Unit]) -> Result<()> {
        first_error(units.iter().rev().map(|u| u.swap.recover(&u.filter)))
    }

    fn cleanup_units(units: &[Unit]) {
        for u in units {
            u.swap.cleanup().log_err_with("Cleaning up");
        }
    }

    fn finish(&self, ledger: &Ledger, state: RollbackState, version: &str) {
        ResultRecord {
            state,
            command: format!("rollback {version}"),
        }
        .write(&self.result_path)
        .log_err_with("Recording result");
        self.c
            .bootloader
            .set_timeout(ledger.grub_timeout())
            .log_err_with("Restoring boot menu timeout");
        self.c
            .bootloader
            .update_menu()
            .log_err_with("Updating boot menu");
    }

    /// Swap the live system to `version`, recovering on failure.
    fn execute(&mut self, ledger: &mut Ledger, version: &str, r: &Reporter) -> Result<()> {
        match ledger.state() {
            RollbackState::ReadyStart => {
                ledger.set_rollback_info(version, ledger.grub_timeout())?;
            }
            RollbackState::PrepareRepoFile | RollbackState::ReplaceFile => {
                tracing::info!("Resuming rollback to {version}");
            }
            _ => {
                let timeout = self.c.bootloader.timeout()?;
                ledger.set_ready()?;
                ledger.set_rollback_info(version, timeout)?;
            }
        }
        let mut units = Vec::new();
        let mut mounts = MountList::new();
        let res = self.execute_steps(ledger, version, r, &mut units, &mut mounts);
        mounts
            .umount(self.c.mounter.as_ref())
            .log_err_with("Unmounting temporary mounts");
        match res {
            Ok(()) => {
                ledger.set_succeeded()?;
                Self::cleanup_units(&units);
                for rc in self.config.repo_list.iter() {
                    replace::remove_clearing_immutable(&rc.snapshot_path(version))
                        .log_err_with("Removing snapshot");
                }
                r.emit(StateCode::RollbackBootloader, "");
                self.finish(ledger, RollbackState::Succeeded, version);
                tracing::info!("Rolled back to {version}");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Rollback to {version} failed: {e:#}");
                r.emit(StateCode::RollbackRecovering, format!("{e:#}"));
                ledger.set_restore()?;
                if units.is_empty() {
                    units = self.plan_units(version).log_err_default();
                }
                Self::recover_units(&units).context("Recovering after failed rollback")?;
                ledger.set_failed()?;
                Self::cleanup_units(&units);
                self.finish(ledger, RollbackState::Failed, version);
                Err(e)
            }
        }
    }

    fn rollback_target(
        &self,
        ledger: &Ledger,
        version: Option<&str>,
        policy: ResumePolicy,
    ) -> Result<String> {
        if let Some(v) = version {
            let _: BranchName = v.parse()?;
            if !self.primary().exists(v)? {
                return Err(Error::Repo(format!("Version {v} does not exist")).into());
            }
            return Ok(v.to_owned());
        }
        let resumable = match policy {
            ResumePolicy::Interactive => ledger.state() == RollbackState::ReadyStart,
            ResumePolicy::EarlyBoot => ledger.is_unfinished(),
        };
        let pending = ledger.rollback_version();
        if resumable && branch::is_valid(pending) {
            return Ok(pending.to_owned());
        }
        let active = &self.config.active_version;
        self.primary()
            .previous(active)?
            .ok_or_else(|| anyhow!("No version to roll back to from {active:?}"))
    }

    /// Roll back to `version` (by default: a scheduled one, or the version
    /// before the active one).
    pub fn rollback(
        &mut self,
        version: Option<&str>,
        policy: ResumePolicy,
        sink: &dyn ProgressSink,
    ) -> Result<RollbackOutcome> {
        let mut r = Reporter {
            sink,
            version: version.unwrap_or_default().to_owned(),
        };
        let res = self.rollback_impl(version, policy, &mut r);
        if let Err(e) = res.as_ref() {
            r.emit(StateCode::RollbackFailed, format!("{e:#}"));
        }
        res
    }

    fn rollback_impl(
        &mut self,
        version: Option<&str>,
        policy: ResumePolicy,
        r: &mut Reporter,
    ) -> Result<RollbackOutcome> {
        let mut ledger = Ledger::open(&self.root)?;
        let state = ledger.state();
        let interrupted = matches!(
            state,
            RollbackState::PrepareRepoFile | RollbackState::ReplaceFile | RollbackState::Restore
        );
        if interrupted && (policy == ResumePolicy::Interactive || state == RollbackState::Restore) {
            anyhow::bail!(
                "An interrupted rollback to {} is pending recovery; reboot to finish it",
                ledger.rollback_version()
            );
        }
        let target = self.rollback_target(&ledger, version, policy)?;
        if interrupted && ledger.rollback_version() != target {
            anyhow::bail!(
                "An interrupted rollback to {} must finish first",
                ledger.rollback_version()
            );
        }
        r.version = target.clone();
        r.emit(StateCode::RollbackStart, "");
        self.cancel.check()?;
        match policy {
            ResumePolicy::Interactive => {
                let timeout = if state == RollbackState::ReadyStart {
                    ledger.grub_timeout()
                } else {
                    self.c.bootloader.timeout()?
                };
                ledger.set_ready()?;
                ledger.set_rollback_info(&target, timeout)?;
                self.c.bootloader.set_timeout(SCHEDULED_TIMEOUT)?;
                self.c.bootloader.update_menu()?;
                self.c.bootloader.wait_idle(WAIT_IDLE)?;
                r.emit(StateCode::RollbackScheduled, "");
                Ok(RollbackOutcome::Scheduled(target))
            }
            ResumePolicy::EarlyBoot => {
                self.execute(&mut ledger, &target, r)?;
                r.emit(StateCode::RollbackSucceeded, "");
                Ok(RollbackOutcome::Completed(target))
            }
        }
    }

    /// The early boot hook: undo a failed attempt, or run a scheduled or
    /// interrupted rollback.
    pub fn boot_check(&mut self, sink: &dyn ProgressSink) -> Result<BootCheck> {
        let ledger = Ledger::open(&self.root)?;
        let version = ledger.rollback_version().to_owned();
        match ledger.state() {
            RollbackState::Restore => {
                let mut ledger = ledger;
                let r = Reporter {
                    sink,
                    version: version.clone(),
                };
                r.emit(StateCode::RollbackRecovering, "");
                let units = self.plan_units(&version)?;
                Self::recover_units(&units)?;
                ledger.set_failed()?;
                Self::cleanup_units(&units);
                self.finish(&ledger, RollbackState::Failed, &version);
                r.emit(StateCode::RollbackFailed, "recovered");
                Ok(BootCheck::Recovered(version))
            }
            _ if ledger.is_unfinished() && branch::is_valid(&version) => {
                drop(ledger);
                match self.rollback(None, ResumePolicy::EarlyBoot, sink)? {
                    RollbackOutcome::Completed(v) | RollbackOutcome::Scheduled(v) => {
                        Ok(BootCheck::Executed(v))
                    }
                }
            }
            s => {
                tracing::debug!("Nothing to do in state {s:?}");
                Ok(BootCheck::Idle)
            }
        }
    }
}
