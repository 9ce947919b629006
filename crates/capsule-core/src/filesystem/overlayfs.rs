//! `OverlayFS` management for layered container filesystems.
//!
//! Stacks the shared read-only image layer under a per-container writable
//! layer, presenting the copy-on-write union at the merge directory.

use std::path::PathBuf;

use nix::mount::{MsFlags, mount};

use capsule_common::error::{CapsuleError, Result};

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers (bottom to top).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Renders the `lowerdir=…,upperdir=…,workdir=…` mount data.
    ///
    /// Overlay lists the uppermost lower layer first, so the layers are
    /// joined top to bottom.
    #[must_use]
    pub fn options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={lowers},upperdir={},workdir={}",
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// The upper, work, and merged directories must already exist.
///
/// # Errors
///
/// Returns an error if the mount syscall fails.
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    let opts = config.options();
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| CapsuleError::setup("overlay mount", e))?;

    tracing::info!(merged = %config.merged_dir.display(), "overlayfs mounted");
    Ok(())
}
