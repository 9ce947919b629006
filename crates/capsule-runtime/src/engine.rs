//! Lifecycle engine that composes the runtime's parts into container
//! operations.
//!
//! `run` builds a container in a fixed order: name reservation, root
//! filesystem, process, cgroup, record, network, and finally the command
//! handoff that lets the process start. Every completed step registers its
//! undo, so a failure anywhere rolls the container back to nothing. `remove`
//! walks the same resources in reverse and never stops at the first error.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;

use capsule_common::config::{Layout, RuntimeConfig};
use capsule_common::constants::{DEFAULT_COMMAND, ENTER_SUBCOMMAND};
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::{
    ContainerId, ContainerRecord, ContainerStatus, PortMapping, ResourceLimits, VolumeBinding,
    validate_identifier, validate_name,
};
use capsule_core::cgroup::{Cgroup2Controller, ResourceController};
use capsule_core::filesystem::{Mounter, SyscallMounter};
use capsule_core::namespace::NamespaceConfig;
use capsule_core::signal;
use capsule_core::teardown::{CleanupReport, Teardown};
use capsule_image::{ImageInfo, ImageStore};
use capsule_image::hash::Sha256Digest;

use crate::exec;
use crate::logs;
use crate::network::{DriverRegistry, Network, NetworkManager, Subnet};
use crate::process::{self, ContainerProcess, InitProgram, SpawnConfig, StdioMode};
use crate::rootfs::RootfsManager;
use crate::state::Registry;

/// How long `remove --force` waits for a killed container to disappear.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Everything `run` needs to start a container.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Container name; defaults to the generated id.
    pub name: Option<String>,
    /// Image the root filesystem is built from.
    pub image: String,
    /// Command to execute; defaults to `sh`.
    pub command: Vec<String>,
    /// Host directories bound into the container.
    pub volumes: Vec<VolumeBinding>,
    /// Resource limits written before the process starts.
    pub limits: ResourceLimits,
    /// Variables added to the container environment.
    pub env: Vec<(String, String)>,
    /// Leave the container running in the background, logging to a file.
    pub detached: bool,
    /// Network to attach to.
    pub network: Option<String>,
    /// Ports to publish; requires a network.
    pub ports: Vec<PortMapping>,
}

/// Result of a successful `run`.
#[derive(Debug)]
pub enum RunOutcome {
    /// The container keeps running in the background.
    Detached(ContainerRecord),
    /// An interactive container finished and was torn down.
    Exited {
        /// Name of the finished container.
        name: String,
        /// Exit code of the container's init process.
        code: i32,
        /// Failures encountered while tearing it down.
        cleanup: CleanupReport,
    },
}

/// Swappable collaborators of an [`Engine`].
pub struct EngineParts {
    /// Performs overlay and bind mounts.
    pub mounter: Arc<dyn Mounter>,
    /// Manages per-container cgroups.
    pub controller: Arc<dyn ResourceController>,
    /// Network drivers by name.
    pub drivers: DriverRegistry,
    /// Program a container process executes to become its init.
    pub init: InitProgram,
    /// Program that joins a container's namespaces for `exec`.
    pub exec_helper: InitProgram,
    /// Namespaces each container gets.
    pub namespaces: NamespaceConfig,
}

impl EngineParts {
    /// The production setup: kernel mounts and cgroups, the bridge driver,
    /// and the running binary re-invoked for `init` and `enter`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the path of the running binary is unknown.
    pub fn host() -> Result<Self> {
        Ok(Self {
            mounter: Arc::new(SyscallMounter),
            controller: Arc::new(Cgroup2Controller::new()),
            drivers: DriverRegistry::with_defaults(),
            init: InitProgram::current_exe()?,
            exec_helper: InitProgram::reinvoke(ENTER_SUBCOMMAND)?,
            namespaces: NamespaceConfig::default(),
        })
    }
}

/// The container lifecycle engine.
pub struct Engine {
    layout: Layout,
    registry: Registry,
    images: ImageStore,
    rootfs: RootfsManager,
    networks: NetworkManager,
    controller: Arc<dyn ResourceController>,
    init: InitProgram,
    exec_helper: InitProgram,
    namespaces: NamespaceConfig,
}

impl Engine {
    /// Creates an engine storing its state under `layout`.
    #[must_use]
    pub fn new(layout: Layout, parts: EngineParts) -> Self {
        let images = ImageStore::new(layout.clone());
        Self {
            registry: Registry::new(layout.clone()),
            rootfs: RootfsManager::new(layout.clone(), images.clone(), parts.mounter),
            networks: NetworkManager::new(layout.clone(), parts.drivers),
            images,
            controller: parts.controller,
            init: parts.init,
            exec_helper: parts.exec_helper,
            namespaces: parts.namespaces,
            layout,
        }
    }

    /// Creates the production engine for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host parts cannot be set up.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self::new(config.layout(), EngineParts::host()?))
    }

    /// Creates and starts a container.
    ///
    /// Detached containers are left running. Interactive containers are
    /// waited for and then removed; their exit code is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] for invalid input,
    /// [`CapsuleError::NameConflict`] if the name is taken,
    /// [`CapsuleError::NotFound`] for an unknown image or network, or the
    /// error of the setup step that failed after rolling back.
    pub fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let id = ContainerId::generate();
        let name = request.name.clone().unwrap_or_else(|| id.to_string());
        validate_name(&name)?;
        validate_identifier("image", &request.image)?;
        if !request.ports.is_empty() && request.network.is_none() {
            return Err(CapsuleError::Config {
                message: "publishing ports requires --net".into(),
            });
        }
        if let Some(network) = &request.network {
            let _ = self.networks.load(network)?;
        }
        let command = if request.command.is_empty() {
            vec![DEFAULT_COMMAND.to_string()]
        } else {
            request.command.clone()
        };

        self.registry.reserve(&name)?;
        let mut undo = Teardown::new();
        let registry = self.registry.clone();
        let owner = name.clone();
        undo.push("release container name", move || registry.remove(&owner));

        let (space, fs_undo) = match self.rootfs.create(&request.image, &name, &request.volumes) {
            Ok(built) => built,
            Err(e) => {
                roll_back(&name, None, undo);
                return Err(e);
            }
        };
        undo.extend(fs_undo);

        let stdio = if request.detached {
            StdioMode::Log(self.layout.log_path(&name))
        } else {
            StdioMode::Inherit
        };
        let mut child = match process::spawn(&SpawnConfig {
            init: &self.init,
            namespaces: self.namespaces,
            workdir: &space.merge,
            env: &request.env,
            stdio,
        }) {
            Ok(child) => child,
            Err(e) => {
                roll_back(&name, None, undo);
                return Err(e);
            }
        };

        let record = match self.start(id, &name, &request, command, &mut child, &mut undo) {
            Ok(record) => record,
            Err(e) => {
                roll_back(&name, Some(child), undo);
                return Err(e);
            }
        };
        drop(undo);
        tracing::info!(name = %name, pid = child.pid(), image = %request.image, "container started");

        if request.detached {
            return Ok(RunOutcome::Detached(record));
        }
        let code = child.wait()?;
        tracing::info!(name = %name, code, "container exited");
        let cleanup = self.tear_down(&record);
        Ok(RunOutcome::Exited {
            name,
            code,
            cleanup,
        })
    }

    /// Enrolls the blocked child in its cgroup, persists its record,
    /// attaches it to its network, and releases it with the command.
    fn start(
        &self,
        id: ContainerId,
        name: &str,
        request: &RunRequest,
        command: Vec<String>,
        child: &mut ContainerProcess,
        undo: &mut Teardown,
    ) -> Result<ContainerRecord> {
        let pid = child.pid();
        let cgroup = self.controller.create(pid)?;
        let (controller, handle) = (Arc::clone(&self.controller), cgroup.clone());
        undo.push("remove cgroup", move || controller.clear(&handle));
        self.controller.set(&cgroup, &request.limits)?;
        self.controller.apply(&cgroup, pid)?;

        let mut record = ContainerRecord {
            id,
            name: name.to_string(),
            pid: Some(pid),
            command,
            image: request.image.clone(),
            volumes: request.volumes.clone(),
            cgroup,
            status: ContainerStatus::Running,
            created_at: chrono::Utc::now().to_rfc3339(),
            network: None,
            ip_address: None,
            port_mappings: Vec::new(),
        };
        self.registry.save(&record)?;

        if let Some(network) = &request.network {
            self.networks.connect(network, &mut record, pid, &request.ports)?;
            let (networks, attached) = (self.networks.clone(), record.clone());
            undo.push("disconnect network", move || networks.disconnect(&attached));
            self.registry.save(&record)?;
        }

        child.hand_off(&record.command)?;
        Ok(record)
    }

    /// Stops a running container with SIGTERM, or SIGKILL when forced.
    ///
    /// The record is marked stopped; its filesystem and cgroup stay in
    /// place until the container is removed.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container,
    /// [`CapsuleError::InvalidState`] if it is not running, or the error of
    /// signal delivery.
    pub fn stop(&self, name: &str, force: bool) -> Result<ContainerRecord> {
        let record = self.registry.get(name)?;
        let Some(pid) = record.pid.filter(|_| record.is_running()) else {
            return Err(CapsuleError::InvalidState {
                name: name.to_string(),
                state: record.status.to_string(),
                action: "stop",
            });
        };
        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        signal::send_signal(pid, sig)?;
        let record = self.registry.update_status(name, ContainerStatus::Stopped)?;
        tracing::info!(name, pid, signal = %sig, "container stopped");
        Ok(record)
    }

    /// Removes a container and every resource it holds.
    ///
    /// A running container is refused unless `force` is set, in which case
    /// it is killed first. The returned report lists teardown steps that
    /// failed; the record is deleted regardless.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container, or
    /// [`CapsuleError::InvalidState`] for a running one without `force`.
    pub fn remove(&self, name: &str, force: bool) -> Result<CleanupReport> {
        let record = self.registry.get(name)?;
        if let Some(pid) = record.pid.filter(|_| record.is_running()) {
            if !force {
                return Err(CapsuleError::InvalidState {
                    name: name.to_string(),
                    state: record.status.to_string(),
                    action: "remove",
                });
            }
            signal::send_signal(pid, Signal::SIGKILL)?;
            if !signal::wait_for_exit(pid, KILL_GRACE) {
                tracing::warn!(name, pid, "container still alive after SIGKILL");
            }
        }
        let report = self.tear_down(&record);
        tracing::info!(name, clean = report.is_clean(), "container removed");
        Ok(report)
    }

    /// Releases network, cgroup, filesystem, and record, in that order.
    ///
    /// The record is only deleted once everything before it was released.
    /// Otherwise it is kept, without a pid, so that `remove` can be retried.
    fn tear_down(&self, record: &ContainerRecord) -> CleanupReport {
        let mut report = CleanupReport::new();
        report.attempt("disconnect network", || self.networks.disconnect(record));
        report.attempt("remove cgroup", || self.controller.clear(&record.cgroup));
        report.merge(self.rootfs.delete(&record.name, &record.volumes));
        if report.is_clean() {
            report.attempt("delete record", || self.registry.remove(&record.name));
        } else {
            tracing::warn!(name = %record.name, "teardown incomplete, keeping record");
            let mut kept = record.clone();
            if kept.is_running() {
                kept.mark(ContainerStatus::Exited);
            }
            report.attempt("keep record", || self.registry.save(&kept));
        }
        report
    }

    /// Lists every container, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        self.registry.list()
    }

    /// Looks up one container.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container.
    pub fn inspect(&self, name: &str) -> Result<ContainerRecord> {
        self.registry.get(name)
    }

    /// Returns the log of a detached container.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container, or an
    /// I/O error if the log cannot be read.
    pub fn logs(&self, name: &str) -> Result<String> {
        let _ = self.registry.get(name)?;
        logs::read_logs(&self.layout, name)
    }

    /// Runs an extra command inside a running container and returns its
    /// exit code.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container,
    /// [`CapsuleError::InvalidState`] if it is not running, or an error if
    /// the helper cannot be started.
    pub fn exec(&self, name: &str, command: &[String]) -> Result<i32> {
        let record = self.registry.get(name)?;
        let Some(pid) = record.pid.filter(|_| record.is_running()) else {
            return Err(CapsuleError::InvalidState {
                name: name.to_string(),
                state: record.status.to_string(),
                action: "exec into",
            });
        };
        exec::exec_in(&self.exec_helper, pid, command)
    }

    /// Packs the current root filesystem of a container into a new image.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container or one
    /// whose filesystem is gone, or the image store's error.
    pub fn commit(&self, name: &str, image: &str) -> Result<(ImageInfo, Sha256Digest)> {
        let record = self.registry.get(name)?;
        let merge = self.layout.merge_dir(&record.name);
        if !merge.is_dir() {
            return Err(CapsuleError::NotFound {
                kind: "container filesystem",
                id: name.to_string(),
            });
        }
        self.images.commit(&merge, image)
    }

    /// Lists the images in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the image directory cannot be read.
    pub fn images(&self) -> Result<Vec<ImageInfo>> {
        self.images.list()
    }

    /// Creates a network.
    ///
    /// # Errors
    ///
    /// See [`NetworkManager::create`].
    pub fn create_network(
        &self,
        name: &str,
        driver: &str,
        subnet: Subnet,
        gateway: Option<Ipv4Addr>,
    ) -> Result<Network> {
        self.networks.create(name, driver, subnet, gateway)
    }

    /// Lists networks.
    ///
    /// # Errors
    ///
    /// See [`NetworkManager::list`].
    pub fn networks(&self) -> Result<Vec<Network>> {
        self.networks.list()
    }

    /// Removes a network with no attached containers.
    ///
    /// # Errors
    ///
    /// See [`NetworkManager::remove`].
    pub fn remove_network(&self, name: &str) -> Result<()> {
        self.networks.remove(name)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("layout", &self.layout)
            .field("init", &self.init)
            .field("namespaces", &self.namespaces)
            .finish_non_exhaustive()
    }
}

/// Kills the half-started child, if any, then undoes every completed step.
fn roll_back(name: &str, child: Option<ContainerProcess>, undo: Teardown) {
    tracing::warn!(name, steps = undo.len(), "container setup failed, rolling back");
    if let Some(child) = child {
        child.abort();
    }
    let report = undo.run();
    if !report.is_clean() {
        tracing::warn!(name, failures = ?report.failures(), "rollback incomplete");
    }
}
