//! Joining the namespaces of a running process with `setns(2)`.

use std::fs::File;
use std::path::PathBuf;

use nix::sched::{CloneFlags, setns};

use capsule_common::error::{CapsuleError, Result};

/// Namespaces joined by [`join_namespaces`], in joining order.
///
/// The mount namespace comes last: once it is entered, `/proc` paths of
/// the host are no longer reachable.
pub const JOIN_ORDER: [(&str, CloneFlags); 5] = [
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("mnt", CloneFlags::CLONE_NEWNS),
];

/// Returns the `/proc/<pid>/ns/<kind>` path of a namespace.
#[must_use]
pub fn namespace_path(pid: u32, kind: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/{kind}"))
}

/// Moves the calling thread into the IPC, UTS, network, PID, and mount
/// namespaces of `pid`.
///
/// All namespace files are opened before the first `setns(2)`. Joining a
/// PID namespace only affects children forked afterwards.
///
/// # Errors
///
/// Returns an I/O error if a namespace file cannot be opened, or
/// [`CapsuleError::ResourceSetup`] if a `setns(2)` call fails.
pub fn join_namespaces(pid: u32) -> Result<()> {
    let handles = JOIN_ORDER
        .iter()
        .map(|(kind, flag)| {
            let path = namespace_path(pid, kind);
            File::open(&path)
                .map(|file| (*kind, *flag, file))
                .map_err(|e| CapsuleError::io(path, e))
        })
        .collect::<Result<Vec<_>>>()?;

    for (kind, flag, file) in &handles {
        setns(file, *flag).map_err(|e| CapsuleError::setup("setns", format!("{kind}: {e}")))?;
        tracing::debug!(pid, namespace = kind, "joined namespace");
    }
    Ok(())
}
