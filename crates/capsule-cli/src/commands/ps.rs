//! `capsule ps` — List containers.

use std::process::ExitCode;

use clap::Args;

use capsule_common::types::ContainerRecord;
use capsule_runtime::Engine;

use crate::output::{self, Table, or_dash};

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Print names only.
    #[arg(short, long, conflicts_with = "json")]
    pub quiet: bool,

    /// Print the full records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `ps` command.
///
/// Records whose process is gone are reported as exited.
///
/// # Errors
///
/// Returns an error if the registry cannot be read.
pub fn execute(args: &PsArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    let containers = engine.list()?;
    if args.json {
        output::println(&serde_json::to_string_pretty(&containers)?)?;
    } else if args.quiet {
        for c in &containers {
            output::println(&c.name)?;
        }
    } else {
        output::print(&render(&containers))?;
    }
    Ok(ExitCode::SUCCESS)
}

fn render(containers: &[ContainerRecord]) -> String {
    let mut table = Table::new([
        "NAME", "ID", "PID", "STATUS", "IMAGE", "IP", "COMMAND", "CREATED",
    ]);
    for c in containers {
        table.row([
            c.name.clone(),
            c.id.to_string(),
            or_dash(c.pid),
            c.status.to_string(),
            c.image.clone(),
            or_dash(c.ip_address.as_deref()),
            c.command.join(" "),
            c.created_at.clone(),
        ]);
    }
    table.render()
}
