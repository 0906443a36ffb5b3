//! Code for atomic-upgrade that goes into the initramfs: before the real
//! root is switched to, finish a scheduled rollback or undo a failed one.

use anyhow::Result;
use atomic_upgrade_lib::config::CONFIG_PATH;
use camino::Utf8Path;

/// Where the initramfs mounts the real root.
const SYSROOT: &str = "/sysroot";

fn boot_check(root: &str) -> Result<()> {
    let root = Utf8Path::new(root);
    if !root.join("usr").try_exists()? {
        anyhow::bail!("{root} does not look like a root filesystem");
    }
    tracing::debug!("Checking for a pending rollback in {root}");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let r = runtime.block_on(atomic_upgrade_lib::cli::boot_check(
        Utf8Path::new(CONFIG_PATH),
        root,
    ));
    if let Err(e) = r.as_ref() {
        tracing::error!("Boot check on {root} failed: {e:#}");
    }
    r
}

fn main() -> Result<()> {
    atomic_upgrade_utils::initialize_tracing();
    let v = std::env::args().collect::<Vec<_>>();
    let args = match v.as_slice() {
        [] => anyhow::bail!("Missing argument".to_string()),
        [_, rest @ ..] => rest,
    };
    match args {
        [] => anyhow::bail!("Missing argument".to_string()),
        [s] if s == "boot-check" => boot_check(SYSROOT),
        [s, root] if s == "boot-check" => boot_check(root),
        [o, ..] => anyhow::bail!(format!("Unknown command {o}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_check_needs_usr() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().to_str().unwrap();
        let e = boot_check(root).unwrap_err();
        assert!(e.to_string().contains("does not look like a root filesystem"));
    }
}
