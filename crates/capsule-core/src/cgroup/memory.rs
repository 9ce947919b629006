//! Memory resource control via cgroups v2.

use std::path::Path;

use capsule_common::error::Result;

/// Sets the hard memory limit for a cgroup.
///
/// The value is written verbatim, so both byte counts and suffixed forms
/// accepted by the kernel (`100M`, `max`) work.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, value: &str) -> Result<()> {
    super::write_control(cgroup_path, "memory.max", value)?;
    tracing::debug!(value, "memory max set");
    Ok(())
}
