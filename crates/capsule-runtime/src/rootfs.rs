//! Container root filesystem construction and teardown.
//!
//! A running space is the overlay of a shared image layer (lower) and a
//! per-container writable layer (upper, with its overlay work directory),
//! presented at the merge directory, plus any host directories bound into
//! it. Mounts stack, so they come apart in reverse: volume binds first,
//! then the overlay, then the directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use capsule_common::config::Layout;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::VolumeBinding;
use capsule_core::filesystem::{Mounter, OverlayConfig};
use capsule_core::teardown::{CleanupReport, Teardown};
use capsule_image::ImageStore;

/// Paths of a container's assembled root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningSpace {
    /// Shared read-only image layer.
    pub lower: PathBuf,
    /// Writable layer.
    pub upper: PathBuf,
    /// Overlay work directory.
    pub worker: PathBuf,
    /// Merge point the container sees as `/`.
    pub merge: PathBuf,
}

/// Builds and removes container root filesystems.
#[derive(Clone)]
pub struct RootfsManager {
    layout: Layout,
    images: ImageStore,
    mounter: Arc<dyn Mounter>,
}

impl RootfsManager {
    /// Creates a manager storing per-container trees under `layout`.
    #[must_use]
    pub fn new(layout: Layout, images: ImageStore, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            layout,
            images,
            mounter,
        }
    }

    /// Builds the root filesystem of container `name` from `image`.
    ///
    /// On success the returned [`Teardown`] undoes every step, newest
    /// first. On failure the completed steps have already been undone.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown image, or the
    /// error of the first directory or mount step that fails.
    pub fn create(
        &self,
        image: &str,
        name: &str,
        volumes: &[VolumeBinding],
    ) -> Result<(RunningSpace, Teardown)> {
        let mut teardown = Teardown::new();
        match self.build(image, name, volumes, &mut teardown) {
            Ok(space) => Ok((space, teardown)),
            Err(e) => {
                tracing::warn!(name, error = %e, "root filesystem setup failed, rolling back");
                let _ = teardown.run();
                Err(e)
            }
        }
    }

    fn build(
        &self,
        image: &str,
        name: &str,
        volumes: &[VolumeBinding],
        teardown: &mut Teardown,
    ) -> Result<RunningSpace> {
        let lower = self.images.materialize(image)?.path;

        let overlay_dir = self.layout.overlay_dir(name);
        if overlay_dir.exists() {
            return Err(CapsuleError::setup(
                "root filesystem",
                format!("{} already exists", overlay_dir.display()),
            ));
        }
        let space = RunningSpace {
            lower,
            upper: self.layout.upper_dir(name),
            worker: self.layout.worker_dir(name),
            merge: self.layout.merge_dir(name),
        };
        let (layout, owner) = (self.layout.clone(), name.to_string());
        teardown.push("remove container layers", move || {
            remove_layers(&layout, &owner)
        });
        for dir in [&space.upper, &space.worker, &space.merge] {
            std::fs::create_dir_all(dir).map_err(|e| CapsuleError::io(dir, e))?;
        }

        self.mounter.mount_overlay(&OverlayConfig {
            lower_dirs: vec![space.lower.clone()],
            upper_dir: space.upper.clone(),
            work_dir: space.worker.clone(),
            merged_dir: space.merge.clone(),
        })?;
        let (mounter, merge) = (Arc::clone(&self.mounter), space.merge.clone());
        teardown.push("unmount overlay", move || mounter.unmount(&merge));

        for volume in volumes {
            let target = volume.target_in(&space.merge);
            std::fs::create_dir_all(&volume.host).map_err(|e| CapsuleError::io(&volume.host, e))?;
            std::fs::create_dir_all(&target).map_err(|e| CapsuleError::io(&target, e))?;
            self.mounter.bind_mount(&volume.host, &target)?;
            let mounter = Arc::clone(&self.mounter);
            teardown.push(format!("unmount volume {volume}"), move || {
                mounter.unmount(&target)
            });
            tracing::debug!(name, volume = %volume, "volume bound");
        }

        tracing::info!(name, image, merge = %space.merge.display(), "root filesystem ready");
        Ok(space)
    }

    /// Tears down the root filesystem of `name`, keeping the image layer.
    ///
    /// Every step runs even if an earlier one fails. Steps whose target is
    /// already gone succeed, so a second call after a partial failure
    /// picks up where the first stopped.
    pub fn delete(&self, name: &str, volumes: &[VolumeBinding]) -> CleanupReport {
        let mut report = CleanupReport::new();
        let merge = self.layout.merge_dir(name);

        for volume in volumes.iter().rev() {
            let target = volume.target_in(&merge);
            report.attempt(&format!("unmount volume {volume}"), || {
                self.unmount_if_mounted(&target)
            });
        }
        report.attempt("unmount overlay", || self.unmount_if_mounted(&merge));
        report.attempt("remove container layers", || {
            remove_layers(&self.layout, name)
        });
        report
    }

    fn unmount_if_mounted(&self, target: &Path) -> Result<()> {
        if self.mounter.is_mounted(target)? {
            self.mounter.unmount(target)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RootfsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootfsManager")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Removes the merge, upper, and work directories of a container.
///
/// The merge directory is removed with `rmdir(2)`, which refuses while
/// anything is still mounted there, so a failed unmount can never lead to
/// deleting the image layer or a bound host directory.
fn remove_layers(layout: &Layout, name: &str) -> Result<()> {
    remove_dir(&layout.merge_dir(name))?;
    for dir in [layout.upper_dir(name), layout.worker_dir(name)] {
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CapsuleError::io(dir, e)),
        }
    }
    remove_dir(&layout.overlay_dir(name))
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CapsuleError::io(dir, e)),
    }
}
