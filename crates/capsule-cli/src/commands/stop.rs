//! `capsule stop` — Stop a running container.

use std::process::ExitCode;

use clap::Args;

use capsule_runtime::Engine;

use crate::output;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container name.
    pub container: String,

    /// Send SIGKILL instead of SIGTERM.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or not running.
pub fn execute(args: &StopArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    let record = engine.stop(&args.container, args.force)?;
    output::println(&record.name)?;
    Ok(ExitCode::SUCCESS)
}
