//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`. Must run inside a
//! fresh mount namespace with the new root as the working directory.

use std::path::Path;

use nix::mount::{MntFlags, umount2};
use nix::unistd::{chdir, pivot_root as sys_pivot_root};

use capsule_common::constants::PIVOT_STAGING_DIR;
use capsule_common::error::{CapsuleError, Result};

use super::mount::make_root_private;

/// Makes the current working directory the root of the mount namespace.
///
/// The steps run in a fixed order: remount `/` private and recursive,
/// create the staging directory, pivot with the old root parked there,
/// enter the new `/`, detach the old root, and remove the staging
/// directory.
///
/// # Errors
///
/// Returns an error on the first step that fails.
pub fn pivot_to_cwd() -> Result<()> {
    make_root_private()?;

    let new_root = std::env::current_dir().map_err(|e| CapsuleError::io(".", e))?;
    let staging = new_root.join(PIVOT_STAGING_DIR);
    std::fs::create_dir_all(&staging).map_err(|e| CapsuleError::io(&staging, e))?;

    tracing::info!(new_root = %new_root.display(), "performing pivot_root");
    sys_pivot_root(&new_root, &staging).map_err(|e| CapsuleError::setup("pivot_root", e))?;
    chdir("/").map_err(|e| CapsuleError::setup("chdir", e))?;

    let old_root = Path::new("/").join(PIVOT_STAGING_DIR);
    umount2(&old_root, MntFlags::MNT_DETACH)
        .map_err(|e| CapsuleError::setup("old root unmount", e))?;
    std::fs::remove_dir(&old_root).map_err(|e| CapsuleError::io(&old_root, e))?;
    Ok(())
}
