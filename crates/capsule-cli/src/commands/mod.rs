//! CLI command definitions and dispatch.

pub mod commit;
pub mod exec;
pub mod images;
pub mod init;
pub mod logs;
pub mod network;
pub mod ps;
pub mod rm;
pub mod run;
pub mod stop;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use capsule_common::config::RuntimeConfig;
use capsule_common::constants::{DEFAULT_ROOT, ROOT_ENV};
use capsule_runtime::Engine;

/// Capsule — daemon-less container runtime.
#[derive(Parser, Debug)]
#[command(name = "capsule", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding all runtime state.
    #[arg(long, global = true, env = ROOT_ENV, default_value = DEFAULT_ROOT)]
    pub root: PathBuf,

    /// Format of diagnostic output on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Diagnostic output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and start a container.
    Run(run::RunArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Print the log of a detached container.
    Logs(logs::LogsArgs),
    /// Execute a command inside a running container.
    Exec(exec::ExecArgs),
    /// Stop a running container.
    Stop(stop::StopArgs),
    /// Remove a container and release its resources.
    Rm(rm::RmArgs),
    /// Save a container's filesystem as a new image.
    Commit(commit::CommitArgs),
    /// List local images.
    Images(images::ImagesArgs),
    /// Manage container networks.
    #[command(subcommand)]
    Network(network::NetworkCommand),
    /// Container init process (internal).
    #[command(hide = true)]
    Init,
    /// Namespace entry helper for `exec` (internal).
    #[command(hide = true)]
    Enter,
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = RuntimeConfig::with_root(cli.root);
    match cli.command {
        Command::Init => init::execute_init(),
        Command::Enter => init::execute_enter(),
        Command::Run(args) => run::execute(args, &engine(&config)?),
        Command::Ps(args) => ps::execute(&args, &engine(&config)?),
        Command::Logs(args) => logs::execute(&args, &engine(&config)?),
        Command::Exec(args) => exec::execute(&args, &engine(&config)?),
        Command::Stop(args) => stop::execute(&args, &engine(&config)?),
        Command::Rm(args) => rm::execute(&args, &engine(&config)?),
        Command::Commit(args) => commit::execute(&args, &engine(&config)?),
        Command::Images(args) => images::execute(&args, &engine(&config)?),
        Command::Network(cmd) => network::execute(cmd, &engine(&config)?),
    }
}

fn engine(config: &RuntimeConfig) -> anyhow::Result<Engine> {
    Ok(Engine::from_config(config)?)
}

/// Maps a container exit status onto the CLI's own.
pub fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
