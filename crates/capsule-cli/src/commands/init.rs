//! Hidden re-entry points: `capsule init` and `capsule enter`.
//!
//! Neither is meant to be typed by a user. The runtime starts `init` as a
//! container's first process and `enter` as the namespace-joining helper
//! behind `capsule exec`.

use std::process::ExitCode;

use capsule_runtime::{exec, process};

/// Becomes the container's init: reads the command from the handoff pipe,
/// sets up the root filesystem, and executes the command. Returns only on
/// failure.
///
/// # Errors
///
/// Returns the error that stopped the container before its command ran.
pub fn execute_init() -> anyhow::Result<ExitCode> {
    match process::run_init() {
        Ok(never) => match never {},
        Err(e) => {
            tracing::error!(error = %e, "container init failed");
            Err(e.into())
        }
    }
}

/// Runs an `exec` command inside the container named by the environment.
///
/// # Errors
///
/// Returns an error if the namespaces cannot be joined or the command
/// cannot be started.
pub fn execute_enter() -> anyhow::Result<ExitCode> {
    let code = exec::run_enter().inspect_err(|e| {
        tracing::error!(error = %e, "exec helper failed");
    })?;
    Ok(super::exit_code(code))
}
