//! Signal delivery and liveness checks for container processes.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use capsule_common::error::{CapsuleError, Result};

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| CapsuleError::Config {
            message: format!("pid out of range: {pid}"),
        })
}

/// Sends `signal` to `pid`. A process that no longer exists is not an error.
///
/// # Errors
///
/// Returns [`CapsuleError::ResourceSetup`] if delivery fails for any other
/// reason, such as missing permission.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(to_pid(pid)?, signal) {
        Ok(()) => {
            tracing::debug!(pid, signal = %signal, "signal sent");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "process already gone");
            Ok(())
        }
        Err(e) => Err(CapsuleError::setup("signal", format!("{signal} to {pid}: {e}"))),
    }
}

/// Returns whether a process with this pid exists and has not exited.
///
/// A zombie waiting to be reaped by its parent counts as exited.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = to_pid(pid) else {
        return false;
    };
    // EPERM still means the process exists.
    if matches!(kill(raw, None), Err(Errno::ESRCH)) {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !matches!(process_state(&stat), Some('Z' | 'X')),
        Err(_) => true,
    }
}

/// Extracts the state letter from `/proc/<pid>/stat` content. The command
/// name may itself contain spaces and parentheses.
fn process_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// Polls until `pid` disappears or `timeout` elapses.
///
/// Returns whether the process is gone.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
