//! Filesystem layer packing and unpacking.
//!
//! A layer is a tar archive of a root filesystem tree, optionally
//! gzip-compressed. Compression is recognised by extension or by the gzip
//! magic bytes, so a compressed archive stored under a `.tar` name still
//! extracts.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use capsule_common::error::{CapsuleError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Extracts a tar archive into `target`, creating it if needed.
///
/// Permissions are always preserved; ownership only when running as root.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or extraction fails.
pub fn extract_layer(archive_path: &Path, target: &Path) -> Result<()> {
    tracing::info!(
        archive = %archive_path.display(),
        target = %target.display(),
        "extracting layer"
    );

    std::fs::create_dir_all(target).map_err(|e| CapsuleError::io(target, e))?;
    let mut file = File::open(archive_path).map_err(|e| CapsuleError::io(archive_path, e))?;
    let gzip = is_gzip_archive(archive_path)
        || has_gzip_magic(&mut file).map_err(|e| CapsuleError::io(archive_path, e))?;

    let unpacked = if gzip {
        unpack(tar::Archive::new(flate2::read::GzDecoder::new(file)), target)
    } else {
        unpack(tar::Archive::new(file), target)
    };
    unpacked.map_err(|e| CapsuleError::io(target, e))
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, target: &Path) -> std::io::Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());
    archive.set_overwrite(true);
    archive.unpack(target)
}

/// Packs the contents of `source` into a plain tar archive at `archive_path`.
///
/// Entries are stored relative to `source`, so extracting the archive
/// reproduces the tree at the extraction root. Symlinks are stored as links.
///
/// # Errors
///
/// Returns an error if the tree cannot be read or the archive written.
pub fn pack_layer(source: &Path, archive_path: &Path) -> Result<()> {
    tracing::info!(
        source = %source.display(),
        archive = %archive_path.display(),
        "packing layer"
    );
    let file = File::create(archive_path).map_err(|e| CapsuleError::io(archive_path, e))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", source)
        .map_err(|e| CapsuleError::io(source, e))?;
    let file = builder
        .into_inner()
        .map_err(|e| CapsuleError::io(archive_path, e))?;
    file.sync_all().map_err(|e| CapsuleError::io(archive_path, e))
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}

/// Peeks at the first two bytes and rewinds.
fn has_gzip_magic(file: &mut File) -> std::io::Result<bool> {
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    let _ = file.seek(SeekFrom::Start(0))?;
    Ok(n == magic.len() && magic == GZIP_MAGIC)
}
