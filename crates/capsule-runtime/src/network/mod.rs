//! Container networking.
//!
//! Networks persist as JSON under `{root}/network/`, each carrying its
//! address allocator and attached endpoints. Host-side wiring is delegated
//! to a [`NetworkDriver`] looked up in a [`DriverRegistry`]. Every
//! read-modify-write of a network file runs under an exclusive lock on a
//! sibling lock file, so concurrent runs on one network never hand out the
//! same address.

pub mod allocator;
pub mod bridge;
pub mod driver;

use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use capsule_common::config::Layout;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::{validate_identifier, ContainerId, ContainerRecord, PortMapping};

pub use allocator::{IpAllocator, Subnet};
pub use bridge::BridgeDriver;
pub use driver::{DriverRegistry, HostShell, NetworkDriver, Shell};

/// A container attached to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Name of the attached container.
    pub container: String,
    /// Host-side interface.
    pub host_device: String,
    /// Interface moved into the container.
    pub peer_device: String,
    /// Address assigned to the container.
    pub address: Ipv4Addr,
    /// Ports published on the host.
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
}

impl Endpoint {
    /// Derives the host and peer interface names for a container.
    #[must_use]
    pub fn device_names(id: &ContainerId) -> (String, String) {
        let suffix: String = id.as_str().chars().take(bridge::MAX_IFNAME_LEN - 3).collect();
        (format!("cap{suffix}"), format!("cif{suffix}"))
    }
}

/// A persisted network definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name, also the bridge interface name.
    pub name: String,
    /// Driver that wires this network on the host.
    pub driver: String,
    /// Address block.
    pub subnet: Subnet,
    /// Gateway address, reserved in the allocator.
    pub gateway: Ipv4Addr,
    /// Host offsets assigned within the subnet.
    pub allocator: IpAllocator,
    /// Attached containers.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Network {
    /// Builds an empty network with its gateway reserved.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] if the gateway is not a host address
    /// of `subnet`.
    pub fn new(
        name: impl Into<String>,
        driver: impl Into<String>,
        subnet: Subnet,
        gateway: Ipv4Addr,
    ) -> Result<Self> {
        let mut allocator = IpAllocator::new(&subnet);
        let offset = subnet.offset_of(gateway).ok_or_else(|| CapsuleError::Config {
            message: format!("gateway {gateway} is outside {subnet}"),
        })?;
        allocator.reserve(offset).map_err(|_| CapsuleError::Config {
            message: format!("gateway {gateway} is not a usable host address of {subnet}"),
        })?;
        Ok(Self {
            name: name.into(),
            driver: driver.into(),
            subnet,
            gateway,
            allocator,
            endpoints: Vec::new(),
        })
    }

    /// Returns the endpoint of `container`, if attached.
    #[must_use]
    pub fn endpoint(&self, container: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.container == container)
    }

    fn attach(&mut self, id: &ContainerId, container: &str, ports: &[PortMapping]) -> Result<Endpoint> {
        if self.endpoint(container).is_some() {
            return Err(CapsuleError::Config {
                message: format!("container {container} is already attached to {}", self.name),
            });
        }
        let offset = self.allocator.allocate()?;
        let (host_device, peer_device) = Endpoint::device_names(id);
        let endpoint = Endpoint {
            container: container.to_string(),
            host_device,
            peer_device,
            address: self.subnet.address_at(offset),
            port_mappings: ports.to_vec(),
        };
        self.endpoints.push(endpoint.clone());
        Ok(endpoint)
    }

    fn detach(&mut self, container: &str) -> Option<Endpoint> {
        let index = self.endpoints.iter().position(|e| e.container == container)?;
        let endpoint = self.endpoints.remove(index);
        if let Some(offset) = self.subnet.offset_of(endpoint.address) {
            self.allocator.release(offset);
        }
        Some(endpoint)
    }
}

/// Creates, attaches to, and removes networks.
#[derive(Debug, Clone)]
pub struct NetworkManager {
    layout: Layout,
    drivers: DriverRegistry,
}

impl NetworkManager {
    /// Creates a manager over the network directory of `layout`.
    #[must_use]
    pub const fn new(layout: Layout, drivers: DriverRegistry) -> Self {
        Self { layout, drivers }
    }

    fn lock(&self, name: &str) -> Result<Flock<File>> {
        let dir = self.layout.network_dir();
        std::fs::create_dir_all(&dir).map_err(|e| CapsuleError::io(&dir, e))?;
        let path = dir.join(format!(".{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| CapsuleError::io(&path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CapsuleError::io(&path, errno.into()))
    }

    fn save(&self, network: &Network) -> Result<()> {
        let path = self.layout.network_path(&network.name);
        let tmp = self.layout.network_dir().join(format!(".{}.json.tmp", network.name));
        std::fs::write(&tmp, serde_json::to_vec_pretty(network)?)
            .map_err(|e| CapsuleError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CapsuleError::io(&path, e))
    }

    /// Creates a network and its host objects.
    ///
    /// Without a gateway, the first host address of the subnet is used.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] for invalid names or addresses or
    /// a name that is taken, [`CapsuleError::NotFound`] for an unknown
    /// driver, or the driver's error.
    pub fn create(
        &self,
        name: &str,
        driver: &str,
        subnet: Subnet,
        gateway: Option<Ipv4Addr>,
    ) -> Result<Network> {
        validate_identifier("network", name)?;
        let backend = self.drivers.get(driver)?;
        let gateway = gateway.unwrap_or_else(|| subnet.address_at(1));
        let network = Network::new(name, driver, subnet, gateway)?;

        let _guard = self.lock(name)?;
        if self.layout.network_path(name).exists() {
            return Err(CapsuleError::Config {
                message: format!("network already exists: {name}"),
            });
        }
        backend.create(&network)?;
        if let Err(e) = self.save(&network) {
            let _ = backend.delete(&network);
            return Err(e);
        }
        tracing::info!(network = name, driver, subnet = %subnet, %gateway, "network created");
        Ok(network)
    }

    /// Loads the network `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if it does not exist.
    pub fn load(&self, name: &str) -> Result<Network> {
        validate_identifier("network", name)?;
        read_network(&self.layout.network_path(name))?.ok_or_else(|| CapsuleError::NotFound {
            kind: "network",
            id: name.to_string(),
        })
    }

    /// Lists every network, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a definition cannot be read.
    pub fn list(&self) -> Result<Vec<Network>> {
        let dir = self.layout.network_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CapsuleError::io(&dir, e)),
        };
        let mut networks = Vec::new();
        for entry in entries {
            let path: PathBuf = entry.map_err(|e| CapsuleError::io(&dir, e))?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|n| n.starts_with('.'));
            if hidden || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(network) = read_network(&path)? {
                networks.push(network);
            }
        }
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    /// Removes a network with no attached endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if it does not exist,
    /// [`CapsuleError::Config`] while containers are attached, or the
    /// driver's error.
    pub fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.lock(name)?;
        let network = self.load(name)?;
        if !network.endpoints.is_empty() {
            let attached: Vec<_> = network.endpoints.iter().map(|e| e.container.as_str()).collect();
            return Err(CapsuleError::Config {
                message: format!(
                    "network {name} still has attached containers: {}",
                    attached.join(", ")
                ),
            });
        }
        self.drivers.get(&network.driver)?.delete(&network)?;
        let path = self.layout.network_path(name);
        std::fs::remove_file(&path).map_err(|e| CapsuleError::io(&path, e))?;
        tracing::info!(network = name, "network removed");
        Ok(())
    }

    /// Attaches the container process `pid` to `network`, recording the
    /// assigned address and published ports in `record`.
    ///
    /// On failure the address is released and `record` is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown network or driver,
    /// [`CapsuleError::ResourceSetup`] if the subnet is exhausted, or the
    /// driver's error.
    pub fn connect(
        &self,
        network_name: &str,
        record: &mut ContainerRecord,
        pid: u32,
        ports: &[PortMapping],
    ) -> Result<()> {
        let _guard = self.lock(network_name)?;
        let mut network = self.load(network_name)?;
        let backend = self.drivers.get(&network.driver)?;
        let endpoint = network.attach(&record.id, &record.name, ports)?;
        self.save(&network)?;

        if let Err(e) = backend.connect(&network, &endpoint, pid) {
            let _ = network.detach(&record.name);
            if let Err(save_err) = self.save(&network) {
                tracing::warn!(network = network_name, error = %save_err, "could not release address");
            }
            return Err(e);
        }

        record.network = Some(network_name.to_string());
        record.ip_address = Some(endpoint.address.to_string());
        record.port_mappings = endpoint.port_mappings;
        Ok(())
    }

    /// Detaches the container of `record` from its network, if any.
    ///
    /// The address is released even when the driver fails to remove host
    /// objects, so a failed detach never blocks removing the network later.
    /// A network that no longer exists counts as detached.
    ///
    /// # Errors
    ///
    /// Returns the driver's error, or an error if the network file cannot
    /// be rewritten.
    pub fn disconnect(&self, record: &ContainerRecord) -> Result<()> {
        let Some(network_name) = record.network.as_deref() else {
            return Ok(());
        };
        let _guard = self.lock(network_name)?;
        let mut network = match self.load(network_name) {
            Ok(network) => network,
            Err(e) if e.is_not_found() => {
                tracing::warn!(network = network_name, name = %record.name, "network already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(endpoint) = network.detach(&record.name) else {
            return Ok(());
        };
        let driver_result = self
            .drivers
            .get(&network.driver)
            .and_then(|backend| backend.disconnect(&network, &endpoint));
        self.save(&network)?;
        driver_result
    }
}

fn read_network(path: &Path) -> Result<Option<Network>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CapsuleError::io(path, e)),
    }
}
