//! Network driver capability and the registry drivers are looked up in.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

use capsule_common::constants::BRIDGE_DRIVER;
use capsule_common::error::{CapsuleError, Result};

use super::bridge::BridgeDriver;
use super::{Endpoint, Network};

/// Host-side wiring for one kind of network.
///
/// Every method acts on host state only; persistence and address
/// allocation belong to the caller.
pub trait NetworkDriver: Send + Sync {
    /// Name the driver is registered under.
    fn name(&self) -> &str;

    /// Creates the host objects backing `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if any host command fails.
    fn create(&self, network: &Network) -> Result<()>;

    /// Removes the host objects backing `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if any host command fails.
    fn delete(&self, network: &Network) -> Result<()>;

    /// Attaches the network namespace of `pid` as `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if any host command fails.
    fn connect(&self, network: &Network, endpoint: &Endpoint, pid: u32) -> Result<()>;

    /// Detaches `endpoint`. Detaching an endpoint whose devices are already
    /// gone succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if any host command fails.
    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;
}

/// Runs host networking tools.
pub trait Shell: Send + Sync {
    /// Runs `program` with `args`, failing on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ResourceSetup`] if the program cannot be
    /// started or exits unsuccessfully.
    fn run(&self, program: &str, args: &[String]) -> Result<()>;
}

/// [`Shell`] backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HostShell;

impl Shell for HostShell {
    fn run(&self, program: &str, args: &[String]) -> Result<()> {
        tracing::debug!(program, args = ?args, "running network command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| CapsuleError::setup("network command", format!("{program}: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(CapsuleError::setup(
            "network command",
            format!("{program} {}: {}", args.join(" "), stderr.trim()),
        ))
    }
}

/// Drivers available to the engine, keyed by name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn NetworkDriver>>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in bridge driver.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BridgeDriver::new(Arc::new(HostShell))));
        registry
    }

    /// Adds `driver`, replacing any driver registered under the same name.
    pub fn register(&mut self, driver: Arc<dyn NetworkDriver>) {
        let _ = self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Looks up a driver by name.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if no driver has that name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn NetworkDriver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| CapsuleError::NotFound {
                kind: "network driver",
                id: name.to_string(),
            })
    }

    /// Returns the registered driver names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
