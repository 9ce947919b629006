//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight` and `cpuset.cpus`.

use std::path::Path;

use capsule_common::error::Result;

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: &str) -> Result<()> {
    super::write_control(cgroup_path, "cpu.weight", weight)?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}

/// Pins a cgroup to a set of CPUs, e.g. `0-1` or `0,2`.
///
/// # Errors
///
/// Returns an error if writing to `cpuset.cpus` fails.
pub fn set_cpuset_cpus(cgroup_path: &Path, cpus: &str) -> Result<()> {
    super::write_control(cgroup_path, "cpuset.cpus", cpus)?;
    tracing::debug!(cpus, "cpuset set");
    Ok(())
}
