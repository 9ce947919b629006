//! Cgroups v2 resource management.
//!
//! Each container process gets its own cgroup under the unified hierarchy.
//! The hierarchy is located by scanning mount metadata for a `cgroup2`
//! filesystem, and limits must be written before the process is enrolled:
//! the required call order is [`ResourceController::create`], then
//! [`ResourceController::set`], then [`ResourceController::apply`].

pub mod cpu;
pub mod memory;

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use capsule_common::constants::{APP_NAME, CGROUP_GROUP_SUFFIX};
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::{CgroupHandle, ResourceLimits};

use crate::filesystem::mount::parse_mountinfo_line;

/// Creates, limits, populates, and removes per-container cgroups.
pub trait ResourceController: Send + Sync {
    /// Creates a fresh cgroup named after the runtime, the current time,
    /// and `pid`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if no cgroup v2 hierarchy is mounted or the
    /// directory cannot be created.
    fn create(&self, pid: u32) -> Result<CgroupHandle>;

    /// Writes every present limit into its control file, stopping at the
    /// first failure.
    ///
    /// # Errors
    ///
    /// Returns the first write error; the caller must clear the cgroup.
    fn set(&self, cgroup: &CgroupHandle, limits: &ResourceLimits) -> Result<()>;

    /// Moves `pid` into the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    fn apply(&self, cgroup: &CgroupHandle, pid: u32) -> Result<()>;

    /// Removes the cgroup. Fails while member processes remain.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    fn clear(&self, cgroup: &CgroupHandle) -> Result<()>;
}

/// [`ResourceController`] backed by the kernel's cgroup v2 filesystem.
#[derive(Debug, Clone)]
pub struct Cgroup2Controller {
    mountinfo: PathBuf,
    group: String,
}

impl Cgroup2Controller {
    /// Creates a controller that discovers the hierarchy through
    /// `/proc/self/mountinfo`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mountinfo("/proc/self/mountinfo")
    }

    /// Creates a controller reading mount metadata from `mountinfo`.
    #[must_use]
    pub fn with_mountinfo(mountinfo: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
            group: CGROUP_GROUP_SUFFIX.to_string(),
        }
    }

    /// Returns the directory container cgroups are created in.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mount metadata cannot be read or contains
    /// no `cgroup2` mount.
    pub fn group_root(&self) -> Result<PathBuf> {
        let file = std::fs::File::open(&self.mountinfo)
            .map_err(|e| CapsuleError::io(&self.mountinfo, e))?;
        let mount = find_cgroup2_mount(BufReader::new(file)).ok_or_else(|| {
            CapsuleError::io(
                &self.mountinfo,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no cgroup2 mount found"),
            )
        })?;
        Ok(mount.join(&self.group))
    }
}

impl Default for Cgroup2Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceController for Cgroup2Controller {
    fn create(&self, pid: u32) -> Result<CgroupHandle> {
        let group = self.group_root()?;
        std::fs::create_dir_all(&group).map_err(|e| CapsuleError::io(&group, e))?;
        let path = group.join(cgroup_dir_name(pid));
        std::fs::create_dir(&path).map_err(|e| CapsuleError::io(&path, e))?;
        tracing::info!(path = %path.display(), "cgroup created");
        Ok(CgroupHandle::new(path))
    }

    fn set(&self, cgroup: &CgroupHandle, limits: &ResourceLimits) -> Result<()> {
        if let Some(mem) = &limits.memory_max {
            memory::set_memory_max(cgroup.path(), mem)?;
        }
        if let Some(weight) = &limits.cpu_weight {
            cpu::set_cpu_weight(cgroup.path(), weight)?;
        }
        if let Some(cpus) = &limits.cpuset_cpus {
            cpu::set_cpuset_cpus(cgroup.path(), cpus)?;
        }
        Ok(())
    }

    fn apply(&self, cgroup: &CgroupHandle, pid: u32) -> Result<()> {
        write_control(cgroup.path(), "cgroup.procs", &pid.to_string())?;
        tracing::debug!(pid, cgroup = %cgroup, "added process to cgroup");
        Ok(())
    }

    fn clear(&self, cgroup: &CgroupHandle) -> Result<()> {
        match std::fs::remove_dir(cgroup.path()) {
            Ok(()) => {
                tracing::info!(path = %cgroup, "cgroup removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::io(cgroup.path(), e)),
        }
    }
}

/// Writes `value` into the control file `file` of a cgroup.
pub(crate) fn write_control(cgroup_path: &Path, file: &str, value: &str) -> Result<()> {
    let path = cgroup_path.join(file);
    std::fs::write(&path, value).map_err(|e| CapsuleError::io(path, e))
}

/// Returns a directory name unique per runtime, second, and pid.
fn cgroup_dir_name(pid: u32) -> String {
    format!(
        "{APP_NAME}-{}-{pid}",
        chrono::Local::now().format("%Y%m%d%H%M%S")
    )
}

/// Scans `/proc/<pid>/mountinfo` content for the first `cgroup2` mount point.
pub fn find_cgroup2_mount<R: BufRead>(reader: R) -> Option<PathBuf> {
    reader
        .lines()
        .map_while(std::io::Result::ok)
        .filter_map(|line| parse_mountinfo_line(&line))
        .find_map(|(mount_point, fs_type)| (fs_type == "cgroup2").then_some(mount_point))
}
