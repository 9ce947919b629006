//! `capsule images` — List local images.

use std::process::ExitCode;

use clap::Args;

use capsule_runtime::Engine;

use crate::output::{self, Table, format_bytes};

/// Arguments for the `images` command.
#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Print names only.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `images` command.
///
/// # Errors
///
/// Returns an error if the image store cannot be read.
pub fn execute(args: &ImagesArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    let images = engine.images()?;
    if args.quiet {
        for image in &images {
            output::println(&image.name)?;
        }
        return Ok(ExitCode::SUCCESS);
    }
    let mut table = Table::new(["NAME", "SIZE", "CACHED"]);
    for image in &images {
        table.row([
            image.name.clone(),
            format_bytes(image.size_bytes),
            if image.extracted { "yes" } else { "no" }.to_string(),
        ]);
    }
    output::print(&table.render())?;
    Ok(ExitCode::SUCCESS)
}
