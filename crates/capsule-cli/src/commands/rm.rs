//! `capsule rm` — Remove a container and release its resources.

use std::process::ExitCode;

use clap::Args;

use capsule_runtime::Engine;

use crate::output;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container name.
    pub container: String,

    /// Kill the container first if it is running.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `rm` command.
///
/// Teardown steps that fail are reported as warnings; the removal itself
/// still succeeds and can be repeated.
///
/// # Errors
///
/// Returns an error if the container is unknown, or running without
/// `--force`.
pub fn execute(args: &RmArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    let report = engine.remove(&args.container, args.force)?;
    for failure in report.failures() {
        tracing::warn!(name = %args.container, "{failure}");
    }
    output::println(&args.container)?;
    Ok(ExitCode::SUCCESS)
}
