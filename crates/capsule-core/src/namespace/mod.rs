//! Linux namespace management for container isolation.
//!
//! A container gets fresh mount, PID, IPC, UTS, and network namespaces at
//! `clone(2)` time. No user namespace is created, so container root is
//! host root and no uid mapping is needed. [`enter`] joins the namespaces
//! of a running container from the outside.

pub mod enter;

use nix::sched::CloneFlags;

/// Which namespaces a container process is cloned into.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate the mount table.
    pub mount: bool,
    /// Isolate the PID tree; the container command becomes PID 1.
    pub pid: bool,
    /// Isolate System V IPC and POSIX message queues.
    pub ipc: bool,
    /// Isolate hostname and domain name.
    pub uts: bool,
    /// Isolate the network stack.
    pub network: bool,
}

impl NamespaceConfig {
    /// A configuration that creates no namespace at all.
    ///
    /// Used to exercise the bootstrap without privileges.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            mount: false,
            pid: false,
            ipc: false,
            uts: false,
            network: false,
        }
    }

    /// Converts the configuration into `clone(2)` flags.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWPID, self.pid);
        flags.set(CloneFlags::CLONE_NEWIPC, self.ipc);
        flags.set(CloneFlags::CLONE_NEWUTS, self.uts);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            mount: true,
            pid: true,
            ipc: true,
            uts: true,
            network: true,
        }
    }
}
