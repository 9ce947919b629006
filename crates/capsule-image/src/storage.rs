//! Local image store.
//!
//! An image name maps to `{root}/overlay/image/{name}.tar`. The first
//! container started from an image extracts it once into
//! `{root}/overlay/image/layers/{name}/`, which every later container shares as
//! its read-only lower layer. Extraction runs under an exclusive advisory
//! lock and lands through a rename, so concurrent first starts extract
//! exactly once and a crashed extraction never looks complete.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use capsule_common::config::Layout;
use capsule_common::constants::IMAGE_ARCHIVE_EXTENSION;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::validate_identifier;

use crate::hash::{self, Sha256Digest};
use crate::layer;

/// A materialized lower layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    /// Directory holding the extracted image.
    pub path: PathBuf,
    /// Whether this call performed the extraction.
    pub extracted: bool,
}

/// An image archive present in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image name.
    pub name: String,
    /// Archive location.
    pub archive: PathBuf,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// Whether the lower layer cache has been populated.
    pub extracted: bool,
}

/// Manages image archives and their extracted layers.
#[derive(Debug, Clone)]
pub struct ImageStore {
    layout: Layout,
}

impl ImageStore {
    /// Creates a store over the image directory of `layout`.
    #[must_use]
    pub const fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Resolves an image name to its archive path.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] for names that are not valid
    /// identifiers, which also rules out path traversal.
    pub fn archive_path(&self, image: &str) -> Result<PathBuf> {
        validate_identifier("image", image)?;
        Ok(self.layout.image_archive(image))
    }

    /// Returns the shared lower layer for `image`, extracting it on first use.
    ///
    /// Calling this again for the same image leaves the cache untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if the archive does not exist, or
    /// an I/O error if locking or extraction fails.
    pub fn materialize(&self, image: &str) -> Result<Materialized> {
        let archive = self.archive_path(image)?;
        if !archive.is_file() {
            return Err(CapsuleError::NotFound {
                kind: "image",
                id: image.to_string(),
            });
        }
        let lower = self.layout.image_lower_dir(image);

        let _guard = self.lock(image)?;
        if lower.is_dir() {
            tracing::debug!(image, path = %lower.display(), "image layer cached");
            return Ok(Materialized {
                path: lower,
                extracted: false,
            });
        }

        let staging = self.layout.image_staging_dir(image);
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(|e| CapsuleError::io(&staging, e))?;
        }
        if let Err(e) = layer::extract_layer(&archive, &staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        create_parent(&lower)?;
        std::fs::rename(&staging, &lower).map_err(|e| CapsuleError::io(&lower, e))?;
        tracing::info!(image, path = %lower.display(), "image layer extracted");
        Ok(Materialized {
            path: lower,
            extracted: true,
        })
    }

    fn lock(&self, image: &str) -> Result<Flock<File>> {
        let path = self.layout.image_lock(image);
        create_parent(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| CapsuleError::io(&path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CapsuleError::io(&path, errno.into()))
    }

    /// Lists the archives in the store, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the image directory cannot be read.
    pub fn list(&self) -> Result<Vec<ImageInfo>> {
        let dir = self.layout.image_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CapsuleError::io(&dir, e)),
        };

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CapsuleError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(IMAGE_ARCHIVE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let metadata = entry.metadata().map_err(|e| CapsuleError::io(&path, e))?;
            if !metadata.is_file() {
                continue;
            }
            images.push(ImageInfo {
                name: name.to_string(),
                extracted: self.layout.image_lower_dir(name).is_dir(),
                size_bytes: metadata.len(),
                archive: path,
            });
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    /// Packs `source` (a container's merged root) into a new image archive.
    ///
    /// The archive is written beside its final path and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] if an image with this name already
    /// exists, or an I/O error if packing fails.
    pub fn commit(&self, source: &Path, image: &str) -> Result<(ImageInfo, Sha256Digest)> {
        let archive = self.archive_path(image)?;
        if archive.exists() {
            return Err(CapsuleError::Config {
                message: format!("image already exists: {image}"),
            });
        }
        let dir = self.layout.image_dir();
        std::fs::create_dir_all(&dir).map_err(|e| CapsuleError::io(&dir, e))?;

        let partial = dir.join(format!(".{image}.{IMAGE_ARCHIVE_EXTENSION}.partial"));
        if let Err(e) = layer::pack_layer(source, &partial) {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, &archive).map_err(|e| CapsuleError::io(&archive, e))?;

        let digest = hash::hash_file(&archive)?;
        let size_bytes = std::fs::metadata(&archive)
            .map_err(|e| CapsuleError::io(&archive, e))?
            .len();
        tracing::info!(image, digest = %digest, size = size_bytes, "image committed");
        Ok((
            ImageInfo {
                name: image.to_string(),
                archive,
                size_bytes,
                extracted: false,
            },
            digest,
        ))
    }
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) => std::fs::create_dir_all(dir).map_err(|e| CapsuleError::io(dir, e)),
        None => Ok(()),
    }
}
