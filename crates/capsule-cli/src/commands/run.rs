//! `capsule run` — Create and start a container.

use std::process::ExitCode;

use clap::Args;

use capsule_common::types::{PortMapping, ResourceLimits, VolumeBinding, parse_env};
use capsule_runtime::{Engine, RunOutcome, RunRequest};

use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run in the background and log output to a file.
    #[arg(short, long)]
    pub detach: bool,

    /// Bind a host directory, as `hostPath:containerPath`.
    #[arg(short = 'v', long = "volume", value_name = "HOST:CONTAINER")]
    pub volumes: Vec<VolumeBinding>,

    /// Memory limit, written verbatim to `memory.max`.
    #[arg(short, long)]
    pub memory: Option<String>,

    /// CPU weight, written verbatim to `cpu.weight`.
    #[arg(long)]
    pub cpu_weight: Option<String>,

    /// CPUs the container may use, written verbatim to `cpuset.cpus`.
    #[arg(long)]
    pub cpuset: Option<String>,

    /// Container name; defaults to the generated id.
    #[arg(long)]
    pub name: Option<String>,

    /// Network to attach to.
    #[arg(long = "net")]
    pub network: Option<String>,

    /// Publish a TCP port, as `hostPort:containerPort`.
    #[arg(short = 'p', long = "publish", value_name = "HOST:CONTAINER")]
    pub ports: Vec<PortMapping>,

    /// Set an environment variable, as `KEY=VALUE`.
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Image to build the root filesystem from.
    pub image: String,

    /// Command to run; defaults to `sh`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    fn into_request(self) -> RunRequest {
        RunRequest {
            name: self.name,
            image: self.image,
            command: self.command,
            volumes: self.volumes,
            limits: ResourceLimits {
                memory_max: self.memory,
                cpu_weight: self.cpu_weight,
                cpuset_cpus: self.cpuset,
            },
            env: self.env,
            detached: self.detach,
            network: self.network,
            ports: self.ports,
        }
    }
}

/// Executes the `run` command.
///
/// Detached runs print the container name. Interactive runs keep the
/// terminal attached, survive Ctrl+C so the container can be torn down,
/// and exit with the container's exit code.
///
/// # Errors
///
/// Returns an error if the container cannot be created.
pub fn execute(args: RunArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    if !args.detach {
        // Ctrl+C reaches the container too; outlive it to clean up.
        ctrlc::set_handler(|| tracing::debug!("interrupt received, waiting for container"))
            .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;
    }

    match engine.run(args.into_request())? {
        RunOutcome::Detached(record) => {
            output::println(&record.name)?;
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Exited {
            name,
            code,
            cleanup,
        } => {
            for failure in cleanup.failures() {
                tracing::warn!(name = %name, "{failure}");
            }
            Ok(super::exit_code(code))
        }
    }
}
