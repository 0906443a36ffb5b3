//! Repository backend on top of the `ostree` command line tool.

use std::io::Read;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use atomic_upgrade_utils::CommandRunExt;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fn_error_context::context;

use super::{sorted_versions, DiffEntry, Repository};
use crate::error::Error;

/// An ostree repository in `bare` mode.
#[derive(Debug)]
pub struct OstreeRepo {
    path: Utf8PathBuf,
}

/// The fields of `ostree show` we care about.
#[derive(Debug, PartialEq, Eq)]
struct CommitInfo {
    date: DateTime<Utc>,
    subject: String,
}

/// Parse the human-readable output of `ostree show <ref>`.
fn parse_show(output: &str) -> Result<CommitInfo> {
    let mut date = None;
    let mut lines = output.lines();
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Date:") {
            let d = DateTime::parse_from_str(v.trim(), "%Y-%m-%d %H:%M:%S %z")
                .with_context(|| format!("Parsing commit date {v:?}"))?;
            date = Some(d.with_timezone(&Utc));
        }
    }
    let subject = lines
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_owned();
    let date = date.ok_or_else(|| anyhow!("Missing Date in ostree show output"))?;
    Ok(CommitInfo { date, subject })
}

/// Parse `ostree diff` output lines of the form `M    /usr/bin/foo`.
fn parse_diff(output: &str) -> Vec<DiffEntry> {
    output
        .lines()
        .filter_map(|l| {
            let mut chars = l.chars();
            let kind = chars.next()?;
            let path = chars.as_str().trim();
            if !matches!(kind, 'A' | 'D' | 'M') || path.is_empty() {
                return None;
            }
            Some(DiffEntry {
                kind,
                path: path.to_owned(),
            })
        })
        .collect()
}

impl OstreeRepo {
    /// A handle to the repository at `path`; nothing is touched until used.
    pub fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    fn cmd(&self, verb: &str) -> Command {
        let mut c = Command::new("ostree");
        c.arg(verb).arg(format!("--repo={}", self.path));
        c
    }

    fn show(&self, branch: &str) -> Result<CommitInfo> {
        let out = self
            .cmd("show")
            .arg(branch)
            .run_get_string()
            .map_err(|e| Error::Repo(format!("show {branch}: {e:#}")))?;
        parse_show(&out)
    }
}

impl Repository for OstreeRepo {
    #[context("Initializing repository {}", self.path)]
    fn init(&self) -> Result<()> {
        if self.path.join("config").try_exists()? {
            tracing::debug!("Repository {} already initialized", self.path);
            return Ok(());
        }
        std::fs::create_dir_all(&self.path)?;
        self.cmd("init")
            .arg("--mode=bare")
            .log_debug()
            .run_capture_stderr()
            .map_err(|e| Error::Repo(format!("init: {e:#}")).into())
    }

    fn list(&self) -> Result<Vec<String>> {
        let out = self
            .cmd("refs")
            .run_get_string()
            .map_err(|e| Error::Repo(format!("refs: {e:#}")))?;
        Ok(sorted_versions(
            out.lines().map(str::trim).filter(|l| !l.is_empty()).map(ToOwned::to_owned),
        ))
    }

    #[context("Committing {branch}")]
    fn commit(&self, branch: &str, subject: &str, data_dir: &Utf8Path) -> Result<()> {
        self.cmd("commit")
            .arg(format!("--branch={branch}"))
            .arg(format!("--subject={subject}"))
            .arg(format!("--tree=dir={data_dir}"))
            .log_debug()
            .run_capture_stderr()
            .map_err(|e| Error::Repo(format!("commit {branch}: {e:#}")).into())
    }

    #[context("Checking out {branch} to {dst}")]
    fn snapshot(&self, branch: &str, dst: &Utf8Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.cmd("checkout")
            .arg(branch)
            .arg(dst.as_str())
            .log_debug()
            .run_capture_stderr()
            .map_err(|e| Error::Repo(format!("checkout {branch}: {e:#}")).into())
    }

    fn diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>> {
        let out = self
            .cmd("diff")
            .args([from, to])
            .run_get_string()
            .map_err(|e| Error::Repo(format!("diff {from} {to}: {e:#}")))?;
        Ok(parse_diff(&out))
    }

    fn cat(&self, branch: &str, path: &Utf8Path) -> Result<Vec<u8>> {
        let mut out = self
            .cmd("cat")
            .arg(branch)
            .arg(path.as_str())
            .run_get_output()
            .map_err(|e| Error::Repo(format!("cat {branch} {path}: {e:#}")))?;
        let mut buf = Vec::new();
        out.read_to_end(&mut buf)?;
        Ok(buf)
    }

    #[context("Deleting {branch}")]
    fn delete(&self, branch: &str) -> Result<()> {
        self.cmd("refs")
            .args(["--delete", branch])
            .log_debug()
            .run_capture_stderr()
            .map_err(|e| Error::Repo(format!("refs --delete {branch}: {e:#}")))?;
        self.cmd("prune")
            .args(["--refs-only", "--depth=0"])
            .log_debug()
            .run_capture_stderr()
            .map_err(|e| Error::Repo(format!("prune: {e:#}")).into())
    }

    fn subject(&self, branch: &str) -> Result<String> {
        Ok(self.show(branch)?.subject)
    }

    fn commit_time(&self, branch: &str) -> Result<DateTime<Utc>> {
        Ok(self.show(branch)?.date)
    }
}
