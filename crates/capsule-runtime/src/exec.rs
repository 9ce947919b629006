//! Running commands inside a live container.
//!
//! The caller re-invokes the runtime binary with the hidden `enter`
//! subcommand, passing the target pid and the JSON-encoded command through
//! the environment. That helper is a fresh single-threaded process, so it
//! can join the container's mount namespace; it then forks the command,
//! which lands in the container's pid namespace as well.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use capsule_common::constants::{EXEC_CMD_ENV, EXEC_PID_ENV};
use capsule_common::error::{CapsuleError, Result};
use capsule_core::namespace::enter;

use crate::process::InitProgram;

/// Target and command handed to the namespace-entry helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnterRequest {
    /// Host pid of the container's init process.
    pub pid: u32,
    /// Command to run, program first.
    pub command: Vec<String>,
}

impl EnterRequest {
    /// Reads the request from `CAPSULE_EXEC_PID` and `CAPSULE_EXEC_CMD`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] if either variable is missing or
    /// malformed, or the command is empty.
    pub fn from_env() -> Result<Self> {
        Self::parse(
            std::env::var(EXEC_PID_ENV).ok().as_deref(),
            std::env::var(EXEC_CMD_ENV).ok().as_deref(),
        )
    }

    fn parse(pid: Option<&str>, command: Option<&str>) -> Result<Self> {
        let config = |message: String| CapsuleError::Config { message };
        let pid = pid
            .ok_or_else(|| config(format!("{EXEC_PID_ENV} is not set")))?
            .parse::<u32>()
            .map_err(|e| config(format!("{EXEC_PID_ENV}: {e}")))?;
        let command: Vec<String> = serde_json::from_str(
            command.ok_or_else(|| config(format!("{EXEC_CMD_ENV} is not set")))?,
        )
        .map_err(|e| config(format!("{EXEC_CMD_ENV}: {e}")))?;
        if command.first().is_none_or(String::is_empty) {
            return Err(config("exec command is empty".into()));
        }
        Ok(Self { pid, command })
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// Runs `command` inside the container whose init is `pid`, through
/// `helper`, with the caller's terminal attached. Returns the command's
/// exit code.
///
/// # Errors
///
/// Returns [`CapsuleError::Config`] for an empty command, or
/// [`CapsuleError::ResourceSetup`] if the helper cannot be started.
pub fn exec_in(helper: &InitProgram, pid: u32, command: &[String]) -> Result<i32> {
    if command.is_empty() {
        return Err(CapsuleError::Config {
            message: "exec command is empty".into(),
        });
    }
    tracing::info!(pid, command = ?command, "exec into container");
    let status = Command::new(helper.program())
        .args(helper.args())
        .env(EXEC_PID_ENV, pid.to_string())
        .env(EXEC_CMD_ENV, serde_json::to_string(command)?)
        .status()
        .map_err(|e| CapsuleError::setup("exec helper", e))?;
    Ok(exit_code(status))
}

/// Parses a `/proc/<pid>/environ` blob into variable pairs.
#[must_use]
pub fn parse_environ(raw: &[u8]) -> Vec<(String, String)> {
    raw.split(|b| *b == 0)
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (key, value) = entry.split_once('=')?;
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Helper side of [`exec_in`]: joins the target's namespaces and runs the
/// command there with the target's environment, from `/`.
///
/// # Errors
///
/// Returns an error if the request is malformed, the target is gone, a
/// namespace cannot be joined, or the command cannot be started.
pub fn run_enter() -> Result<i32> {
    let request = EnterRequest::from_env()?;
    let environ_path = PathBuf::from(format!("/proc/{}/environ", request.pid));
    let raw = std::fs::read(&environ_path).map_err(|e| CapsuleError::io(&environ_path, e))?;
    let env = parse_environ(&raw);

    enter::join_namespaces(request.pid)?;
    tracing::debug!(pid = request.pid, "joined container namespaces");

    let status = Command::new(&request.command[0])
        .args(&request.command[1..])
        .env_clear()
        .envs(env)
        .current_dir("/")
        .status()
        .map_err(|e| CapsuleError::setup("exec", format!("{}: {e}", request.command[0])))?;
    Ok(exit_code(status))
}
