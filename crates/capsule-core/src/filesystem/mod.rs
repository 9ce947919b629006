//! Filesystem management for container isolation.
//!
//! Overlay and bind mounts for building a container's root filesystem,
//! the in-namespace `pivot_root` sequence, and the pseudo-filesystems
//! an init process needs before handing over to user code.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;

pub use mount::{Mounter, SyscallMounter};
pub use overlayfs::OverlayConfig;
