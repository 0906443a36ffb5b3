//! The main entrypoint for atomic-upgrade, which just performs global
//! initialization, and then calls out into the library.

use std::io::Write as _;

use anyhow::Result;
use owo_colors::OwoColorize;

/// The code called after we've done process global init and created
/// an async runtime.
async fn async_main() -> Result<()> {
    atomic_upgrade_utils::initialize_tracing();
    tracing::trace!("starting atomic-upgrade");
    atomic_upgrade_lib::cli::run_from_iter(std::env::args()).await
}

/// Create an async runtime and do the rest of the work there.
fn run() -> Result<()> {
    // Nothing here is CPU heavy; blocking work goes to spawn_blocking.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move { async_main().await })
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    if let Err(e) = run() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
