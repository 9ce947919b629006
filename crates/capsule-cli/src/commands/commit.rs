//! `capsule commit` — Save a container's filesystem as a new image.

use std::process::ExitCode;

use clap::Args;

use capsule_runtime::Engine;

use crate::output;

/// Arguments for the `commit` command.
#[derive(Args, Debug)]
pub struct CommitArgs {
    /// Container name.
    pub container: String,

    /// Name of the new image.
    pub image: String,
}

/// Executes the `commit` command and prints the archive digest.
///
/// # Errors
///
/// Returns an error if the container or its filesystem is missing, or an
/// image with that name already exists.
pub fn execute(args: &CommitArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    let (info, digest) = engine.commit(&args.container, &args.image)?;
    tracing::info!(image = %info.name, archive = %info.archive.display(), "image saved");
    output::println(&digest.to_string())?;
    Ok(ExitCode::SUCCESS)
}
