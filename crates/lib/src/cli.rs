//! # atomic-upgrade command line
//!
//! Mutating commands run through the [`Worker`] on the blocking thread
//! pool; their progress signals are printed as they arrive.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use atomic_upgrade_utils::rebase_under_root;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use comfy_table::presets::NOTHING;
use comfy_table::Table;

use crate::config::{Config, CONFIG_PATH};
use crate::lock::PID_FILE;
use crate::notify::{self, NotifySend};
use crate::progress::{ChannelSink, LogSink};
use crate::upgrader::{CommitOptions, ResumePolicy, RollbackOutcome, Upgrader};
use crate::worker::Worker;

/// Options for `commit`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct CommitOpts {
    /// Name of the new version; derived from the boot kit or the newest
    /// version when omitted.
    #[clap(long)]
    pub(crate) version: Option<String>,

    /// Commit message.
    #[clap(long)]
    pub(crate) subject: Option<String>,

    /// Copy the subscribed paths of the running system instead of
    /// committing the stage directory as it is.
    #[clap(long)]
    pub(crate) sys_data: bool,

    /// Environment for the after-run hook, as KEY=VALUE.
    #[clap(long = "env", value_parser = parse_env)]
    pub(crate) env: Vec<(String, String)>,
}

/// Options for `rollback`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RollbackOpts {
    /// Target version; defaults to a scheduled one or the version before
    /// the active one.
    pub(crate) version: Option<String>,

    /// Root of the system to operate on.
    #[clap(long, default_value = "/")]
    pub(crate) root: Utf8PathBuf,

    /// Execute the rollback now instead of scheduling it for the next boot.
    /// Only safe when nothing runs from the target root.
    #[clap(long)]
    pub(crate) early_boot: bool,
}

/// Manage atomic system versions.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "atomic-upgrade", version)]
pub(crate) struct Cli {
    /// Configuration file (relative to the target root for early boot
    /// operations).
    #[clap(long, global = true, default_value = CONFIG_PATH)]
    pub(crate) config: Utf8PathBuf,

    #[clap(subcommand)]
    pub(crate) cmd: Opt,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum Opt {
    /// Create the configured repositories.
    Init,
    /// Record the current system (or the stage directory) as a new version.
    Commit(CommitOpts),
    /// Return to an earlier version.
    Rollback(RollbackOpts),
    /// Remove a version.
    Delete {
        /// The version to remove.
        version: String,
    },
    /// List versions, newest first.
    List {
        /// Print JSON instead of a table.
        #[clap(long)]
        json: bool,
    },
    /// Show paths that differ between two versions.
    Diff {
        /// Old version.
        from: String,
        /// New version.
        to: String,
    },
    /// Print a file of a version.
    Cat {
        /// The version.
        version: String,
        /// Absolute path inside the version.
        path: Utf8PathBuf,
    },
    /// Print the rollback ledger as JSON.
    Status,
    /// Tell the user how the last rollback went.
    Notify,
    /// Finish or undo a rollback; run from early boot.
    BootCheck {
        /// Where the real root is mounted.
        #[clap(long, default_value = "/sysroot")]
        root: Utf8PathBuf,
    },
}

fn parse_env(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

/// Load the configuration for the system at `root`.
fn load_upgrader(config: &Utf8Path, root: &Utf8Path) -> Result<Upgrader> {
    let path = rebase_under_root(root, config);
    let path = Utf8PathBuf::from_path_buf(path)
        .map_err(|p| anyhow::anyhow!("Non-UTF-8 path {}", p.display()))?;
    let cfg = Config::load(&path)?;
    Upgrader::new(cfg, &path, root)
}

/// Run `f` on the worker, printing progress signals as they arrive.
async fn run_mutating<T, F>(mut upgrader: Upgrader, f: F) -> Result<T>
where
    F: FnOnce(&mut Upgrader, &ChannelSink) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (sink, mut rx) = ChannelSink::new();
    let printer = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            println!("{p}");
        }
    });
    let r = Worker::new()
        .run(Utf8Path::new(PID_FILE), move || f(&mut upgrader, &sink))
        .await;
    printer.await?;
    r
}

fn print_list(upgrader: &Upgrader, json: bool) -> Result<()> {
    let versions = upgrader.list()?;
    let mut out = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &versions)?;
        writeln!(out)?;
        return Ok(());
    }
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_header(["", "VERSION", "SUBJECT", "COMMITTED"]);
    for v in versions {
        let time = v
            .time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let active = if v.active { "*" } else { "" };
        table.add_row([active.to_owned(), v.version, v.subject, time]);
    }
    writeln!(out, "{table}")?;
    Ok(())
}

/// Run the parsed command.
async fn run_from_opt(cli: Cli) -> Result<()> {
    let root = Utf8Path::new("/");
    match cli.cmd {
        Opt::Init => load_upgrader(&cli.config, root)?.init(),
        Opt::Commit(opts) => {
            let upgrader = load_upgrader(&cli.config, root)?;
            let opts = CommitOptions {
                version: opts.version,
                subject: opts.subject,
                use_sys_data: opts.sys_data,
                env: opts.env,
            };
            let v = run_mutating(upgrader, move |u, sink| u.commit(&opts, sink)).await?;
            println!("Committed {v}");
            Ok(())
        }
        Opt::Rollback(opts) => {
            let upgrader = load_upgrader(&cli.config, &opts.root)?;
            let policy = if opts.early_boot {
                ResumePolicy::EarlyBoot
            } else {
                ResumePolicy::Interactive
            };
            let version = opts.version;
            let outcome = run_mutating(upgrader, move |u, sink| {
                u.rollback(version.as_deref(), policy, sink)
            })
            .await?;
            match outcome {
                RollbackOutcome::Scheduled(v) => {
                    println!("Rollback to {v} is scheduled; reboot to apply it")
                }
                RollbackOutcome::Completed(v) => println!("Rolled back to {v}"),
            }
            Ok(())
        }
        Opt::Delete { version } => {
            let upgrader = load_upgrader(&cli.config, root)?;
            run_mutating(upgrader, move |u, sink| u.delete(&version, sink)).await
        }
        Opt::List { json } => print_list(&load_upgrader(&cli.config, root)?, json),
        Opt::Diff { from, to } => {
            let upgrader = load_upgrader(&cli.config, root)?;
            let mut out = std::io::stdout().lock();
            for e in upgrader.diff(&from, &to)? {
                writeln!(out, "{}    {}", e.kind, e.path)?;
            }
            Ok(())
        }
        Opt::Cat { version, path } => {
            let upgrader = load_upgrader(&cli.config, root)?;
            let buf = upgrader.cat(&version, &path)?;
            std::io::stdout().lock().write_all(&buf)?;
            Ok(())
        }
        Opt::Status => {
            let upgrader = load_upgrader(&cli.config, root)?;
            let status = upgrader.ledger()?.to_json();
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Opt::Notify => {
            let upgrader = load_upgrader(&cli.config, root)?;
            let delivered = notify::deliver_pending(upgrader.result_path(), &NotifySend)?;
            if delivered.is_some() {
                let mut ledger = upgrader.ledger()?;
                if ledger.state().is_terminal() {
                    ledger.clear()?;
                }
            }
            Ok(())
        }
        Opt::BootCheck { root } => boot_check(&cli.config, &root).await,
    }
}

/// The early boot hook: finish a scheduled rollback or undo a failed one
/// on the system mounted at `root`.
pub async fn boot_check(config: &Utf8Path, root: &Utf8Path) -> Result<()> {
    let upgrader = load_upgrader(config, root)
        .with_context(|| format!("Loading configuration below {root}"))?;
    let r = Worker::new()
        .run(Utf8Path::new(PID_FILE), move || {
            let mut upgrader = upgrader;
            upgrader.boot_check(&LogSink)
        })
        .await?;
    tracing::info!("Boot check: {r:?}");
    Ok(())
}

/// Parse the arguments and run the command.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Cli::parse_from(args)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(parse_env("A=b=c").unwrap(), ("A".into(), "b=c".into()));
        assert_eq!(parse_env("A=").unwrap(), ("A".into(), "".into()));
        assert!(parse_env("=x").is_err());
        assert!(parse_env("novalue").is_err());
    }

    #[test]
    fn test_parse_args() {
        let cli = Cli::try_parse_from([
            "atomic-upgrade",
            "commit",
            "--sys-data",
            "--env",
            "LANG=C",
            "--env",
            "X=1",
        ])
        .unwrap();
        assert_eq!(cli.config, CONFIG_PATH);
        assert_eq!(
            cli.cmd,
            Opt::Commit(CommitOpts {
                version: None,
                subject: None,
                sys_data: true,
                env: vec![("LANG".into(), "C".into()), ("X".into(), "1".into())],
            })
        );

        let cli = Cli::try_parse_from([
            "atomic-upgrade",
            "rollback",
            "deepin.1.0.20230101",
            "--root",
            "/sysroot",
            "--early-boot",
            "--config",
            "/tmp/c.json",
        ])
        .unwrap();
        assert_eq!(cli.config, "/tmp/c.json");
        assert_eq!(
            cli.cmd,
            Opt::Rollback(RollbackOpts {
                version: Some("deepin.1.0.20230101".into()),
                root: "/sysroot".into(),
                early_boot: true,
            })
        );

        let cli = Cli::try_parse_from(["atomic-upgrade", "boot-check"]).unwrap();
        assert_eq!(
            cli.cmd,
            Opt::BootCheck {
                root: "/sysroot".into()
            }
        );
        assert!(Cli::try_parse_from(["atomic-upgrade", "delete"]).is_err());
        assert!(Cli::try_parse_from(["atomic-upgrade", "commit", "--env", "bad"]).is_err());
    }

    #[test]
    fn test_load_upgrader_below_root() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let path = root.join("etc/atomic-upgrade/config.json");
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(
            &path,
            r#"{"distribution": "d", "cache_dir": "/var/cache/atomic-upgrade",
                "repo_list": [{"repo": "/persistent/repo", "snapshot_dir": "/persistent/snapshot",
                "stage_dir": "/persistent/stage", "config_dir": "/persistent/config"}]}"#,
        )?;
        let u = load_upgrader(Utf8Path::new(CONFIG_PATH), root)?;
        assert_eq!(u.config().repo_list[0].repo, root.join("persistent/repo"));
        assert!(u.result_path().starts_with(root));
        assert!(load_upgrader(Utf8Path::new("/nonexistent.json"), root).is_err());
        Ok(())
    }
}
