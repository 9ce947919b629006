//! Runtime configuration and the on-disk layout derived from it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_ROOT, IMAGE_ARCHIVE_EXTENSION, INFO_FILE, LOG_FILE};

/// Root configuration for the Capsule runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base directory for registry, overlay, image, and network state.
    pub root: PathBuf,
}

impl RuntimeConfig {
    /// Creates a configuration rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the path layout for this configuration.
    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout::new(&self.root)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }
}

/// Every persistent path the runtime uses, derived from one root.
///
/// ```text
/// {root}/container/{name}/info.json
/// {root}/container/{name}/container.log
/// {root}/overlay/container/{name}/{upper,worker,mnt}
/// {root}/overlay/image/{image}.tar
/// {root}/overlay/image/layers/{image}/   extracted lower layer
/// {root}/overlay/image/locks/{image}     extraction lock
/// {root}/overlay/image/staging/{image}/  extraction in progress
/// {root}/network/{network}.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one subdirectory per registered container.
    #[must_use]
    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("container")
    }

    /// Registry directory of one container.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.registry_dir().join(name)
    }

    /// Registry record of one container.
    #[must_use]
    pub fn info_path(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(INFO_FILE)
    }

    /// Log file of a detached container.
    #[must_use]
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(LOG_FILE)
    }

    /// Per-container overlay tree (upper, worker, and merge directories).
    #[must_use]
    pub fn overlay_dir(&self, name: &str) -> PathBuf {
        self.root.join("overlay").join("container").join(name)
    }

    /// Writable upper layer of a container.
    #[must_use]
    pub fn upper_dir(&self, name: &str) -> PathBuf {
        self.overlay_dir(name).join("upper")
    }

    /// Overlay work directory of a container.
    #[must_use]
    pub fn worker_dir(&self, name: &str) -> PathBuf {
        self.overlay_dir(name).join("worker")
    }

    /// Merge point the container's root filesystem is presented at.
    #[must_use]
    pub fn merge_dir(&self, name: &str) -> PathBuf {
        self.overlay_dir(name).join("mnt")
    }

    /// Image store directory holding archives and extracted layers.
    #[must_use]
    pub fn image_dir(&self) -> PathBuf {
        self.root.join("overlay").join("image")
    }

    /// Archive an image name resolves to.
    #[must_use]
    pub fn image_archive(&self, image: &str) -> PathBuf {
        self.image_dir()
            .join(format!("{image}.{IMAGE_ARCHIVE_EXTENSION}"))
    }

    /// Shared read-only lower layer extracted from an image archive.
    ///
    /// Layers, locks, and staging trees live in their own subdirectories,
    /// keyed by the bare image name, so no image name can reach another
    /// image's archive or cache.
    #[must_use]
    pub fn image_lower_dir(&self, image: &str) -> PathBuf {
        self.image_dir().join("layers").join(image)
    }

    /// Advisory lock guarding the first extraction of an image.
    #[must_use]
    pub fn image_lock(&self, image: &str) -> PathBuf {
        self.image_dir().join("locks").join(image)
    }

    /// Scratch tree an image is extracted into before being renamed into
    /// place as its lower layer.
    #[must_use]
    pub fn image_staging_dir(&self, image: &str) -> PathBuf {
        self.image_dir().join("staging").join(image)
    }

    /// Directory of persisted network definitions.
    #[must_use]
    pub fn network_dir(&self) -> PathBuf {
        self.root.join("network")
    }

    /// Persisted definition of one network.
    #[must_use]
    pub fn network_path(&self, network: &str) -> PathBuf {
        self.network_dir().join(format!("{network}.json"))
    }
}
