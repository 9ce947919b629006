//! Mount utilities for container filesystem setup.
//!
//! Host-side mounts go through the [`Mounter`] trait so that the root
//! filesystem manager can be driven without privileges in tests.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};

use capsule_common::error::{CapsuleError, Result};

use super::overlayfs::{self, OverlayConfig};

/// Host-side mount operations used to assemble a container root filesystem.
pub trait Mounter: Send + Sync {
    /// Mounts an overlay described by `config` at its merge directory.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ResourceSetup`] if the mount fails.
    fn mount_overlay(&self, config: &OverlayConfig) -> Result<()>;

    /// Bind-mounts `source` onto `target`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ResourceSetup`] if the mount fails.
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    /// Detaches whatever is mounted at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ResourceSetup`] if the unmount fails.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Returns whether something is mounted at `target`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the mount table cannot be read.
    fn is_mounted(&self, target: &Path) -> Result<bool>;
}

/// [`Mounter`] issuing real `mount(2)` and `umount2(2)` calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallMounter;

impl Mounter for SyscallMounter {
    fn mount_overlay(&self, config: &OverlayConfig) -> Result<()> {
        overlayfs::mount_overlay(config)
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        bind_mount(source, target)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        unmount(target)
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        is_mount_point(target)
    }
}

/// Creates a recursive bind mount from `source` to `target`.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| CapsuleError::setup("bind mount", format!("{}: {e}", target.display())))?;
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "bind mount created"
    );
    Ok(())
}

/// Lazily detaches the mount at `target`.
///
/// # Errors
///
/// Returns an error if the `umount2(2)` syscall fails.
pub fn unmount(target: &Path) -> Result<()> {
    umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| CapsuleError::setup("unmount", format!("{}: {e}", target.display())))?;
    tracing::debug!(target = %target.display(), "unmounted");
    Ok(())
}

/// Remounts `/` private and recursive so later mounts do not propagate
/// back to the host namespace.
///
/// # Errors
///
/// Returns an error if the remount fails.
pub fn make_root_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| CapsuleError::setup("private remount", e))
}

/// Mounts a fresh `proc` at `/proc`, without exec, setuid, or device access.
///
/// # Errors
///
/// Returns an error if the target cannot be created or the mount fails.
pub fn mount_proc() -> Result<()> {
    let target = Path::new("/proc");
    std::fs::create_dir_all(target).map_err(|e| CapsuleError::io(target, e))?;
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| CapsuleError::setup("proc mount", e))
}

/// Mounts an empty `tmpfs` at `/dev`.
///
/// # Errors
///
/// Returns an error if the target cannot be created or the mount fails.
pub fn mount_dev_tmpfs() -> Result<()> {
    let target = Path::new("/dev");
    std::fs::create_dir_all(target).map_err(|e| CapsuleError::io(target, e))?;
    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755"),
    )
    .map_err(|e| CapsuleError::setup("dev mount", e))
}

/// Returns whether `path` is a mount point in the caller's mount namespace.
/// A path that does not exist is not a mount point.
///
/// # Errors
///
/// Returns an I/O error if `/proc/self/mountinfo` cannot be read.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let Ok(path) = std::fs::canonicalize(path) else {
        return Ok(false);
    };
    let mountinfo = Path::new("/proc/self/mountinfo");
    let file = std::fs::File::open(mountinfo).map_err(|e| CapsuleError::io(mountinfo, e))?;
    Ok(BufReader::new(file)
        .lines()
        .map_while(std::io::Result::ok)
        .filter_map(|line| parse_mountinfo_line(&line))
        .any(|(mount_point, _)| mount_point == path))
}

/// Extracts the mount point and filesystem type from one mountinfo line.
pub fn parse_mountinfo_line(line: &str) -> Option<(PathBuf, String)> {
    let (mount, fs) = line.split_once(" - ")?;
    let fs_type = fs.split_whitespace().next()?;
    let mount_point = mount.split_whitespace().nth(4)?;
    Some((
        PathBuf::from(unescape_mount_field(mount_point)),
        fs_type.to_string(),
    ))
}

/// Decodes the octal escapes (`\040` for space) used in mountinfo fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let code = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(code) = u8::try_from(code) {
                    out.push(code);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
