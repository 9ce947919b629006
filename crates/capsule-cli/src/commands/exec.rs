//! `capsule exec` — Execute a command inside a running container.

use std::process::ExitCode;

use clap::Args;

use capsule_runtime::Engine;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container name.
    pub container: String,

    /// Command to execute.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command.
///
/// The command shares the terminal and its exit code becomes ours.
///
/// # Errors
///
/// Returns an error if the container is not running or the helper cannot
/// be started.
pub fn execute(args: &ExecArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    let code = engine.exec(&args.container, &args.command)?;
    Ok(super::exit_code(code))
}
