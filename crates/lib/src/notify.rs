//! Telling the user how a rollback went.
//!
//! The rollback itself may finish in early boot, long before anyone is
//! logged in. Its outcome is written to a result record; the session side
//! later picks it up with [`deliver_pending`].

use std::process::Command;

use anyhow::{Context, Result};
use atomic_upgrade_utils::CommandRunExt;
use camino::Utf8Path;
use fn_error_context::context;

use crate::ledger::RollbackState;

/// Default location of the result record.
pub const RESULT_PATH: &str = "/var/lib/atomic-upgrade/rollback.result";

/// Shows a message to the user.
pub trait Notifier: std::fmt::Debug + Send + Sync {
    /// Send one notification.
    fn notify(&self, summary: &str, body: &str) -> Result<()>;
}

/// Desktop notifications through `notify-send`.
#[derive(Debug, Default)]
pub struct NotifySend;

impl Notifier for NotifySend {
    fn notify(&self, summary: &str, body: &str) -> Result<()> {
        Command::new("notify-send")
            .args(["--app-name=atomic-upgrade", summary, body])
            .log_debug()
            .run_capture_stderr()
    }
}

/// The outcome of a finished rollback: a single `state,command` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    /// Terminal ledger state.
    pub state: RollbackState,
    /// What was run, e.g. `rollback deepin.1.0.20230101`.
    pub command: String,
}

impl ResultRecord {
    fn parse(line: &str) -> Option<Self> {
        let (state, command) = line.trim().split_once(',')?;
        let state: RollbackState = state.trim().parse::<i32>().ok()?.try_into().ok()?;
        Some(Self {
            state,
            command: command.to_owned(),
        })
    }

    /// Write the record, replacing any previous one.
    #[context("Writing result record {path}")]
    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = format!("{},{}\n", i32::from(self.state), self.command);
        std::fs::write(path, line)?;
        Ok(())
    }

    /// Read the record; a missing or garbled record reads as `None`.
    pub fn read(path: &Utf8Path) -> Result<Option<Self>> {
        let buf = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let r = Self::parse(&buf);
        if r.is_none() {
            tracing::warn!("Ignoring garbled result record {path}: {buf:?}");
        }
        Ok(r)
    }

    fn message(&self) -> (&'static str, String) {
        match self.state {
            RollbackState::Succeeded => (
                "System restored",
                format!("{} completed successfully", self.command),
            ),
            _ => (
                "System restore failed",
                format!("{} failed; the previous system was kept", self.command),
            ),
        }
    }
}

/// Send the pending result, if any, and remove the record. Returns the
/// delivered record.
#[context("Delivering rollback result")]
pub fn deliver_pending(path: &Utf8Path, notifier: &dyn Notifier) -> Result<Option<ResultRecord>> {
    let Some(record) = ResultRecord::read(path)? else {
        if path.try_exists()? {
            std::fs::remove_file(path)?;
        }
        return Ok(None);
    };
    let (summary, body) = record.message();
    notifier.notify(summary, &body)?;
    std::fs::remove_file(path).with_context(|| format!("Removing {path}"))?;
    Ok(Some(record))
}
