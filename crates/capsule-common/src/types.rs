//! Domain primitive types used across the Capsule workspace.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{CONTAINER_ID_LEN, MAX_NAME_LEN};
use crate::error::{CapsuleError, Result};

/// Unique identifier for a container instance: a fixed-length decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID of [`CONTAINER_ID_LEN`] decimal digits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn generate() -> Self {
        let modulus = 10u128.pow(CONTAINER_ID_LEN as u32);
        let value = uuid::Uuid::new_v4().as_u128() % modulus;
        Self(format!("{value:0width$}", width = CONTAINER_ID_LEN))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checks that a container name is usable as a single path component.
///
/// # Errors
///
/// Returns [`CapsuleError::Config`] if the name is empty, too long, starts
/// with a dot, or contains characters outside `[A-Za-z0-9_.-]`.
pub fn validate_name(name: &str) -> Result<()> {
    validate_identifier("container name", name)
}

/// Checks that an image or network name is usable as a file name.
///
/// # Errors
///
/// Same rules as [`validate_name`].
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    let invalid = |why: &str| CapsuleError::Config {
        message: format!("invalid {kind} {name:?}: {why}"),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is too long"));
    }
    if name.starts_with('.') {
        return Err(invalid("name may not start with '.'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid("only [A-Za-z0-9_.-] are allowed"));
    }
    Ok(())
}

/// Resource limits for a container's cgroup.
///
/// Each present field is written verbatim into the matching cgroup v2
/// control file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Value for `memory.max` (e.g. `100m`, `max`).
    pub memory_max: Option<String>,
    /// Value for `cpu.weight` (1-10000).
    pub cpu_weight: Option<String>,
    /// Value for `cpuset.cpus` (e.g. `0-1`).
    pub cpuset_cpus: Option<String>,
}

impl ResourceLimits {
    /// Returns whether no limit is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.memory_max.is_none() && self.cpu_weight.is_none() && self.cpuset_cpus.is_none()
    }
}

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    /// Directory on the host.
    pub host: PathBuf,
    /// Mount point inside the container, absolute.
    pub container: PathBuf,
}

impl VolumeBinding {
    /// Returns the mount point resolved under the given merge directory.
    #[must_use]
    pub fn target_in(&self, merge_dir: &Path) -> PathBuf {
        let relative = self
            .container
            .strip_prefix("/")
            .unwrap_or(&self.container);
        merge_dir.join(relative)
    }
}

impl FromStr for VolumeBinding {
    type Err = CapsuleError;

    /// Parses a `hostPath:containerPath` volume spec.
    fn from_str(spec: &str) -> Result<Self> {
        let invalid = |why: &str| CapsuleError::Config {
            message: format!("invalid volume {spec:?}: {why}"),
        };
        let parts: Vec<&str> = spec.split(':').collect();
        let [host, container] = parts.as_slice() else {
            return Err(invalid("expected hostPath:containerPath"));
        };
        if host.is_empty() || container.is_empty() {
            return Err(invalid("both paths are required"));
        }
        let container = PathBuf::from(container);
        if container
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(invalid("container path may not contain '..'"));
        }
        let container = if container.is_absolute() {
            container
        } else {
            Path::new("/").join(container)
        };
        Ok(Self {
            host: PathBuf::from(host),
            container,
        })
    }
}

impl fmt::Display for VolumeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())
    }
}

/// A TCP port forwarded from the host to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host: u16,
    /// Port inside the container.
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = CapsuleError;

    /// Parses a `hostPort:containerPort` spec.
    fn from_str(spec: &str) -> Result<Self> {
        let invalid = || CapsuleError::Config {
            message: format!("invalid port mapping {spec:?}: expected hostPort:containerPort"),
        };
        let (host, container) = spec.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            host: host.parse().map_err(|_| invalid())?,
            container: container.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// Parses a `KEY=VALUE` environment assignment.
///
/// # Errors
///
/// Returns [`CapsuleError::Config`] if there is no `=` or the key is empty.
pub fn parse_env(spec: &str) -> Result<(String, String)> {
    match spec.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(CapsuleError::Config {
            message: format!("invalid environment variable {spec:?}: expected KEY=VALUE"),
        }),
    }
}

/// Opaque handle to a container's cgroup directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CgroupHandle(PathBuf);

impl CgroupHandle {
    /// Wraps a cgroup directory path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Returns the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CgroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Lifecycle state of a persisted container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The container's init process is alive.
    Running,
    /// The container was stopped with `stop`.
    Stopped,
    /// The container's process exited on its own.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Persistent record of a container, stored as `info.json` in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container identifier.
    pub id: ContainerId,
    /// Unique name; defaults to the id.
    pub name: String,
    /// Host pid of the init process; present only while running.
    pub pid: Option<u32>,
    /// Command executed inside the container.
    pub command: Vec<String>,
    /// Image the root filesystem was built from.
    pub image: String,
    /// Volume bindings, in mount order.
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    /// The container's cgroup.
    pub cgroup: CgroupHandle,
    /// Current lifecycle state.
    pub status: ContainerStatus,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Network the container is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Address assigned by the network driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Host-to-container port forwards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
}

impl ContainerRecord {
    /// Returns whether the record claims a live process.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Moves the record to `status`, clearing the pid unless it is `Running`.
    pub fn mark(&mut self, status: ContainerStatus) {
        self.status = status;
        if status != ContainerStatus::Running {
            self.pid = None;
        }
    }
}
