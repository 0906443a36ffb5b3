//! # The rollback progress ledger
//!
//! A small JSON record that says how far the current rollback attempt
//! got. It is the only state that must survive a crash or a reboot: on the
//! next start the orchestrator reads it to decide whether to resume,
//! recover, or start fresh.
//!
//! Every mutation is written to a randomly named sibling temporary file,
//! fsynced, and swapped into place by renaming the previous record to a
//! `.bak` sibling and the new one over the target. A crash at any point
//! leaves either the previous or the new record on disk; if it happens
//! between the two renames only the backup exists and loading falls back to
//! it.

use std::io::Write;

use anyhow::{Context, Result};
use atomic_upgrade_utils::ResultExt;
use camino::Utf8Path;
use canon_json::CanonJsonSerialize;
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::cap_tempfile;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::branch;

/// Directory holding the ledger, relative to the target root.
pub const LEDGER_DIR: &str = "etc/atomic-upgrade";
/// File name of the ledger.
pub const LEDGER_NAME: &str = "state.records";

/// The progress of one rollback attempt.
///
/// The in-progress states are totally ordered by [`RollbackState::rank`];
/// the two terminal states are only ever tested for directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum RollbackState {
    /// No attempt recorded.
    #[default]
    Unknown,
    /// A rollback was requested; nothing was touched yet.
    ReadyStart,
    /// Prepared trees are being built.
    PrepareRepoFile,
    /// Live directories are being swapped.
    ReplaceFile,
    /// A failed attempt is being undone.
    Restore,
    /// The last attempt completed.
    Succeeded,
    /// The last attempt failed and was undone.
    Failed,
}

impl From<RollbackState> for i32 {
    fn from(s: RollbackState) -> Self {
        match s {
            RollbackState::Unknown => -1,
            RollbackState::ReadyStart => 0,
            RollbackState::PrepareRepoFile => 1,
            RollbackState::ReplaceFile => 2,
            RollbackState::Restore => 3,
            RollbackState::Succeeded => 100,
            RollbackState::Failed => 101,
        }
    }
}

impl TryFrom<i32> for RollbackState {
    type Error = String;

    fn try_from(v: i32) -> std::result::Result<Self, Self::Error> {
        let r = match v {
            -1 => Self::Unknown,
            0 => Self::ReadyStart,
            1 => Self::PrepareRepoFile,
            2 => Self::ReplaceFile,
            3 => Self::Restore,
            100 => Self::Succeeded,
            101 => Self::Failed,
            o => return Err(format!("Unknown rollback state {o}")),
        };
        Ok(r)
    }
}

impl RollbackState {
    /// Whether this marks the end of an attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Position in the in-progress sequence; terminal states have none.
    pub fn rank(self) -> Option<i32> {
        (!self.is_terminal()).then(|| i32::from(self))
    }
}

/// The on-disk record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Record {
    current_state: RollbackState,
    #[serde(default)]
    rollback_version: String,
    #[serde(default)]
    grub_timeout: u32,
}

/// Handle to the ledger file of one target root.
#[derive(Debug)]
pub struct Ledger {
    dir: Dir,
    record: Record,
    /// A step that was in progress when the record was loaded, which the
    /// next matching guard must hand out once more.
    interrupted: Option<RollbackState>,
}

fn backup_name() -> String {
    format!("{LEDGER_NAME}.bak")
}

fn parse_record(name: &str, buf: &str) -> Option<Record> {
    match serde_json::from_str::<Record>(buf) {
        Ok(r) => Some(r),
        Err(e) => {
            tracing::warn!("Ignoring unparsable ledger {name}: {e}");
            None
        }
    }
}

impl Ledger {
    /// Load the ledger under `root`, creating its directory as needed.
    /// A missing, truncated or unparsable file loads as [`RollbackState::Unknown`].
    #[context("Opening progress ledger in {root}")]
    pub fn open(root: &Utf8Path) -> Result<Self> {
        let path = root.join(LEDGER_DIR);
        std::fs::create_dir_all(&path).with_context(|| format!("Creating {path}"))?;
        let dir = Dir::open_ambient_dir(&path, cap_std::ambient_authority())?;
        Self::open_dir(dir)
    }

    /// Load the ledger from an already opened directory.
    pub fn open_dir(dir: Dir) -> Result<Self> {
        let mut record = None;
        for name in [LEDGER_NAME.to_owned(), backup_name()] {
            let buf = match dir.read_to_string(&name) {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("Reading {name}")),
            };
            if name != LEDGER_NAME {
                tracing::warn!("Loading ledger from backup {name}");
            }
            record = parse_record(&name, &buf);
            if record.is_some() {
                break;
            }
        }
        let mut record: Record = record.unwrap_or_default();
        // Every in-progress state names the version being swapped in
        let in_progress = record
            .current_state
            .rank()
            .is_some_and(|r| r >= i32::from(RollbackState::ReadyStart));
        if in_progress && !branch::is_valid(&record.rollback_version) {
            tracing::warn!(
                "Ignoring ledger in state {:?} with invalid version {:?}",
                record.current_state,
                record.rollback_version
            );
            record = Record::default();
        }
        let interrupted = matches!(
            record.current_state,
            RollbackState::PrepareRepoFile | RollbackState::ReplaceFile
        )
        .then_some(record.current_state);
        tracing::debug!("Loaded ledger: {record:?}");
        Ok(Self {
            dir,
            record,
            interrupted,
        })
    }

    #[context("Saving progress ledger")]
    fn save(&self) -> Result<()> {
        let mut buf = Vec::new();
        self.record.to_canon_json_writer(&mut buf)?;
        let mut t = cap_tempfile::TempFile::new(&self.dir)?;
        t.as_file_mut().write_all(&buf)?;
        t.as_file().sync_all()?;
        let backup = backup_name();
        if self.dir.symlink_metadata_optional(LEDGER_NAME)?.is_some() {
            self.dir.rename(LEDGER_NAME, &self.dir, &backup)?;
        }
        t.replace(LEDGER_NAME)?;
        self.dir
            .open(".")
            .and_then(|d| d.sync_all())
            .context("Syncing ledger directory")?;
        self.dir
            .remove_file_optional(&backup)
            .log_err_with("Removing ledger backup");
        tracing::trace!("Saved ledger: {:?}", self.record);
        Ok(())
    }

    fn set_state(&mut self, state: RollbackState) -> Result<()> {
        self.record.current_state = state;
        self.save()
    }

    /// Start a new attempt.
    pub fn set_ready(&mut self) -> Result<()> {
        self.interrupted = None;
        self.set_state(RollbackState::ReadyStart)
    }

    /// Mark that a failed attempt is being undone.
    pub fn set_restore(&mut self) -> Result<()> {
        self.interrupted = None;
        self.set_state(RollbackState::Restore)
    }

    /// Record the target version and the bootloader timeout to restore later.
    pub fn set_rollback_info(&mut self, version: &str, grub_timeout: u32) -> Result<()> {
        self.record.rollback_version = version.to_owned();
        self.record.grub_timeout = grub_timeout;
        self.save()
    }

    /// Finish the attempt successfully.
    pub fn set_succeeded(&mut self) -> Result<()> {
        self.record.rollback_version.clear();
        self.set_state(RollbackState::Succeeded)
    }

    /// Finish the attempt as failed.
    pub fn set_failed(&mut self) -> Result<()> {
        self.record.rollback_version.clear();
        self.set_state(RollbackState::Failed)
    }

    fn need_step(&mut self, step: RollbackState) -> Result<bool> {
        let cur = self.record.current_state;
        let (Some(cur_rank), Some(step_rank)) = (cur.rank(), step.rank()) else {
            return Ok(false);
        };
        if cur_rank < step_rank {
            self.set_state(step)?;
            return Ok(true);
        }
        if cur == step && self.interrupted == Some(step) {
            tracing::info!("Resuming interrupted step {step:?}");
            self.interrupted = None;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether prepared trees must be (re)built; advances the ledger.
    pub fn is_need_prepare_repo_file(&mut self) -> Result<bool> {
        self.need_step(RollbackState::PrepareRepoFile)
    }

    /// Whether live directories must be (re)swapped; advances the ledger.
    pub fn is_need_replace_file(&mut self) -> Result<bool> {
        self.need_step(RollbackState::ReplaceFile)
    }

    /// The current state.
    pub fn state(&self) -> RollbackState {
        self.record.current_state
    }

    /// The version the current attempt targets; empty if none.
    pub fn rollback_version(&self) -> &str {
        &self.record.rollback_version
    }

    /// The bootloader timeout captured when the attempt started.
    pub fn grub_timeout(&self) -> u32 {
        self.record.grub_timeout
    }

    /// Whether the last attempt failed.
    pub fn is_failed(&self) -> bool {
        self.state() == RollbackState::Failed
    }

    /// Whether the last attempt succeeded.
    pub fn is_succeeded(&self) -> bool {
        self.state() == RollbackState::Succeeded
    }

    /// Whether an attempt was started (possibly completed).
    pub fn is_ready_rollback(&self) -> bool {
        self.state()
            .rank()
            .is_some_and(|r| r >= i32::from(RollbackState::ReadyStart))
            || self.state().is_terminal()
    }

    /// Whether an attempt was started and never reached a terminal state.
    pub fn is_unfinished(&self) -> bool {
        self.is_ready_rollback() && !self.is_failed() && !self.is_succeeded()
    }

    /// Forget everything: remove the file and reset to [`RollbackState::Unknown`].
    #[context("Clearing progress ledger")]
    pub fn clear(&mut self) -> Result<()> {
        self.dir.remove_file_optional(LEDGER_NAME)?;
        self.dir.remove_file_optional(backup_name())?;
        self.record = Record::default();
        self.interrupted = None;
        Ok(())
    }

    /// The record as a JSON value, for status output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "CurrentState": i32::from(self.record.current_state),
            "RollbackVersion": self.record.rollback_version,
            "GrubTimeout": self.record.grub_timeout,
        })
    }
}
