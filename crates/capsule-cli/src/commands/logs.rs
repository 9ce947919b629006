//! `capsule logs` — Print the log of a detached container.

use std::process::ExitCode;

use clap::Args;

use capsule_runtime::Engine;
use capsule_runtime::logs::tail;

use crate::output;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container name.
    pub container: String,

    /// Only print the last N lines.
    #[arg(short = 'n', long)]
    pub tail: Option<usize>,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or its log unreadable.
pub fn execute(args: &LogsArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    let logs = engine.logs(&args.container)?;
    let shown = args.tail.map_or(logs.as_str(), |n| tail(&logs, n));
    output::print(shown)?;
    Ok(ExitCode::SUCCESS)
}
