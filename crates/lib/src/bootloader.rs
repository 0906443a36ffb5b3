//! Bootloader and boot-kit collaborators.

use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use atomic_upgrade_utils::CommandRunExt;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

/// Where grub reads its settings from.
pub const GRUB_DEFAULTS: &str = "/etc/default/grub";
/// Processes that regenerate the grub menu.
const GRUB_UPDATERS: &[&str] = &["update-grub", "grub-mkconfig", "grub2-mkconfig"];
/// Timeout grub uses when none is configured.
const GRUB_DEFAULT_TIMEOUT: u32 = 5;
const TIMEOUT_KEY: &str = "GRUB_TIMEOUT=";

/// The boot menu.
pub trait Bootloader: std::fmt::Debug + Send + Sync {
    /// Regenerate the menu so it lists the current versions.
    fn update_menu(&self) -> Result<()>;
    /// The menu timeout in seconds.
    fn timeout(&self) -> Result<u32>;
    /// Change the menu timeout.
    fn set_timeout(&self, secs: u32) -> Result<()>;
    /// Wait up to `max` for a running menu update to finish.
    fn wait_idle(&self, max: Duration) -> Result<()>;
}

/// Parse a shell-style command line into a [`Command`].
pub(crate) fn command_from_str(cmdline: &str) -> Result<Command> {
    let argv = shlex::split(cmdline)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid command {cmdline:?}"))?;
    let mut c = Command::new(&argv[0]);
    c.args(&argv[1..]);
    Ok(c)
}

/// Grub, driven through `/etc/default/grub` and its update command.
#[derive(Debug)]
pub struct Grub {
    defaults: Utf8PathBuf,
    update_cmd: String,
    proc_root: Utf8PathBuf,
}

fn parse_timeout(content: &str) -> Option<u32> {
    content
        .lines()
        .filter_map(|l| l.trim().strip_prefix(TIMEOUT_KEY))
        .last()
        .and_then(|v| v.trim().trim_matches(|c| c == '"' || c == '\'').parse().ok())
}

fn replace_timeout(content: &str, secs: u32) -> String {
    let line = format!("{TIMEOUT_KEY}{secs}");
    let mut found = false;
    let mut out: Vec<String> = content
        .lines()
        .map(|l| {
            if l.trim().starts_with(TIMEOUT_KEY) {
                found = true;
                line.clone()
            } else {
                l.to_owned()
            }
        })
        .collect();
    if !found {
        out.push(line);
    }
    let mut r = out.join("\n");
    r.push('\n');
    r
}

impl Grub {
    /// Grub configured at `defaults`, regenerating its menu with `update_cmd`.
    pub fn new(defaults: &Utf8Path, update_cmd: &str) -> Self {
        Self {
            defaults: defaults.to_owned(),
            update_cmd: update_cmd.to_owned(),
            proc_root: "/proc".into(),
        }
    }

    fn updater_running(&self) -> Result<bool> {
        for e in self.proc_root.read_dir_utf8()? {
            let e = e?;
            if !e.file_name().bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            // Processes may exit while we look
            let Ok(comm) = std::fs::read_to_string(e.path().join("comm")) else {
                continue;
            };
            if GRUB_UPDATERS.contains(&comm.trim()) {
                tracing::debug!("{} is running as {}", comm.trim(), e.file_name());
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Bootloader for Grub {
    #[context("Updating boot menu")]
    fn update_menu(&self) -> Result<()> {
        command_from_str(&self.update_cmd)?
            .log_debug()
            .run_capture_stderr()
    }

    fn timeout(&self) -> Result<u32> {
        let content = match std::fs::read_to_string(&self.defaults) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("Reading {}", self.defaults)),
        };
        Ok(parse_timeout(&content).unwrap_or(GRUB_DEFAULT_TIMEOUT))
    }

    #[context("Setting boot menu timeout to {secs}")]
    fn set_timeout(&self, secs: u32) -> Result<()> {
        let (Some(parent), Some(name)) = (self.defaults.parent(), self.defaults.file_name()) else {
            anyhow::bail!("Invalid path {}", self.defaults);
        };
        let content = match std::fs::read_to_string(&self.defaults) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())?;
        dir.atomic_write(name, replace_timeout(&content, secs))?;
        Ok(())
    }

    fn wait_idle(&self, max: Duration) -> Result<()> {
        let start = Instant::now();
        while self.updater_running()? {
            if start.elapsed() >= max {
                tracing::warn!("Boot menu update still running after {max:?}");
                break;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    }
}

/// The kernel/initramfs tooling, asked for the version of what it ships.
pub trait BootKit: std::fmt::Debug + Send + Sync {
    /// The version to name the next commit after, if the boot kit has one.
    fn current_version(&self) -> Result<Option<String>>;
}

/// [`BootKit`] that runs a configured command and reads its output.
#[derive(Debug, Default)]
pub struct CommandBootKit {
    cmd: Option<String>,
}

impl CommandBootKit {
    /// Query with `cmd`; without a command no version is ever reported.
    pub fn new(cmd: Option<&str>) -> Self {
        Self {
            cmd: cmd.map(ToOwned::to_owned),
        }
    }
}

impl BootKit for CommandBootKit {
    fn current_version(&self) -> Result<Option<String>> {
        let Some(cmd) = self.cmd.as_deref() else {
            return Ok(None);
        };
        let out = command_from_str(cmd)?
            .log_debug()
            .run_get_string()
            .context("Querying boot kit version")?;
        let v = out.trim();
        Ok((!v.is_empty()).then(|| v.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const DEFAULTS: &str = indoc! { r#"
        GRUB_DEFAULT=0
        GRUB_TIMEOUT="10"
        GRUB_CMDLINE_LINUX=""
    "# };

    #[test]
    fn test_timeout_edit() {
        assert_eq!(parse_timeout(DEFAULTS), Some(10));
        assert_eq!(parse_timeout("GRUB_DEFAULT=0\n"), None);
        let edited = replace_timeout(DEFAULTS, 1);
        similar_asserts::assert_eq!(
            edited,
            "GRUB_DEFAULT=0\nGRUB_TIMEOUT=1\nGRUB_CMDLINE_LINUX=\"\"\n"
        );
        assert_eq!(replace_timeout("", 3), "GRUB_TIMEOUT=3\n");
    }

    #[test]
    fn test_grub() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let defaults = root.join("grub");
        let mut g = Grub::new(&defaults, "true");
        assert_eq!(g.timeout()?, GRUB_DEFAULT_TIMEOUT);
        std::fs::write(&defaults, DEFAULTS)?;
        assert_eq!(g.timeout()?, 10);
        g.set_timeout(1)?;
        assert_eq!(g.timeout()?, 1);
        g.update_menu()?;

        let procs = root.join("proc");
        std::fs::create_dir_all(procs.join("42"))?;
        std::fs::create_dir_all(procs.join("self"))?;
        std::fs::write(procs.join("42/comm"), "bash\n")?;
        g.proc_root = procs.clone();
        assert!(!g.updater_running()?);
        std::fs::write(procs.join("42/comm"), "grub-mkconfig\n")?;
        assert!(g.updater_running()?);
        g.wait_idle(Duration::ZERO)?;

        let failing = Grub::new(&defaults, "false");
        assert!(failing.update_menu().is_err());
        Ok(())
    }

    #[test]
    fn test_bootkit() -> Result<()> {
        assert_eq!(CommandBootKit::new(None).current_version()?, None);
        let k = CommandBootKit::new(Some("echo deepin.3.0.20230101"));
        assert_eq!(k.current_version()?.as_deref(), Some("deepin.3.0.20230101"));
        assert_eq!(CommandBootKit::new(Some("true")).current_version()?, None);
        assert!(command_from_str("'unterminated").is_err());
        Ok(())
    }
}
