//! Cross-process single instance lock: an exclusive `flock(2)` on a PID file.
//!
//! The kernel drops the lock when its holder exits, so a file left behind
//! by a crashed process is simply locked again. The file itself is never
//! removed; unlinking a locked file would let a second process lock a
//! fresh inode at the same path.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};
use atomic_upgrade_utils::ResultExt;
use camino::Utf8Path;
use fn_error_context::context;
use rustix::fs::{flock, FlockOperation};

use crate::error::Error;

/// Default location of the lock file.
pub const PID_FILE: &str = "/run/atomic-upgrade/atomic-upgrade.pid";

/// Held while a mutating operation runs; released on drop.
#[derive(Debug)]
pub struct PidLock {
    file: File,
}

impl PidLock {
    /// Take the lock at `path` without waiting. Fails with
    /// [`Error::AlreadyRunning`] naming the PID recorded by the holder.
    #[context("Acquiring lock {path}")]
    pub fn acquire(path: &Utf8Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        }
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Opening {path}"))?;
        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(rustix::io::Errno::WOULDBLOCK) => {
                let mut buf = String::new();
                file.read_to_string(&mut buf).log_err_with("Reading lock holder");
                let holder = buf.trim().parse::<u32>().unwrap_or_default();
                return Err(Error::AlreadyRunning(holder).into());
            }
            Err(e) => return Err(e).context("flock"),
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        tracing::debug!("Acquired {path}");
        Ok(Self { file })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // Closing the file releases the lock
        self.file.set_len(0).log_err_with("Clearing lock file");
    }
}
