//! Linux bridge driver.
//!
//! A network is a bridge named after it, carrying the gateway address, with
//! masquerading for traffic leaving the subnet. Each endpoint is a veth
//! pair: the host end is enslaved to the bridge, the peer is moved into the
//! container's network namespace and configured there through `nsenter`.
//! Published ports are DNAT rules in the `nat` table.

use std::path::PathBuf;
use std::sync::Arc;

use capsule_common::constants::BRIDGE_DRIVER;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::PortMapping;
use capsule_core::teardown::CleanupReport;

use super::driver::{NetworkDriver, Shell};
use super::{Endpoint, Network};

/// Longest interface name the kernel accepts.
pub const MAX_IFNAME_LEN: usize = 15;

/// Bridge, veth, and iptables wiring driven through a [`Shell`].
pub struct BridgeDriver {
    shell: Arc<dyn Shell>,
    sysfs_net: PathBuf,
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

impl BridgeDriver {
    /// Creates a driver that runs host tools through `shell`.
    #[must_use]
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self::with_sysfs(shell, "/sys/class/net")
    }

    /// Creates a driver that checks for existing interfaces under `sysfs_net`.
    #[must_use]
    pub fn with_sysfs(shell: Arc<dyn Shell>, sysfs_net: impl Into<PathBuf>) -> Self {
        Self {
            shell,
            sysfs_net: sysfs_net.into(),
        }
    }

    fn link_exists(&self, name: &str) -> bool {
        self.sysfs_net.join(name).exists()
    }

    fn ip(&self, items: &[&str]) -> Result<()> {
        self.shell.run("ip", &args(items))
    }

    fn iptables(&self, items: &[&str]) -> Result<()> {
        self.shell.run("iptables", &args(items))
    }

    fn in_netns(&self, pid: u32, items: &[&str]) -> Result<()> {
        let target = pid.to_string();
        let mut full = args(&["-t", &target, "-n", "ip"]);
        full.extend(args(items));
        self.shell.run("nsenter", &full)
    }

    fn masquerade(&self, action: &str, network: &Network) -> Result<()> {
        let subnet = network.subnet.to_string();
        self.iptables(&[
            "-t", "nat", action, "POSTROUTING", "-s", &subnet, "!", "-o", &network.name, "-j",
            "MASQUERADE",
        ])
    }

    fn forward(&self, action: &str, network: &Network) -> Result<()> {
        self.iptables(&[action, "FORWARD", "-i", &network.name, "-j", "ACCEPT"])
    }

    fn dnat(&self, action: &str, endpoint: &Endpoint, port: PortMapping) -> Result<()> {
        let host = port.host.to_string();
        let destination = format!("{}:{}", endpoint.address, port.container);
        self.iptables(&[
            "-t", "nat", action, "PREROUTING", "-p", "tcp", "--dport", &host, "-j", "DNAT",
            "--to-destination", &destination,
        ])
    }
}

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE_DRIVER
    }

    fn create(&self, network: &Network) -> Result<()> {
        if network.name.len() > MAX_IFNAME_LEN {
            return Err(CapsuleError::Config {
                message: format!(
                    "bridge network names are limited to {MAX_IFNAME_LEN} characters: {}",
                    network.name
                ),
            });
        }
        let gateway = format!("{}/{}", network.gateway, network.subnet.prefix());

        self.ip(&["link", "add", &network.name, "type", "bridge"])?;
        let configured = self
            .ip(&["addr", "add", &gateway, "dev", &network.name])
            .and_then(|()| self.ip(&["link", "set", &network.name, "up"]))
            .and_then(|()| self.masquerade("-A", network))
            .and_then(|()| self.forward("-A", network));
        if let Err(e) = configured {
            let _ = self.masquerade("-D", network);
            let _ = self.ip(&["link", "del", &network.name]);
            return Err(e);
        }

        if let Err(e) = self.shell.run("sysctl", &args(&["-w", "net.ipv4.ip_forward=1"])) {
            tracing::warn!(error = %e, "could not enable ip forwarding");
        }
        tracing::info!(network = %network.name, subnet = %network.subnet, "bridge created");
        Ok(())
    }

    fn delete(&self, network: &Network) -> Result<()> {
        let mut report = CleanupReport::new();
        report.attempt("remove forward rule", || self.forward("-D", network));
        report.attempt("remove masquerade rule", || self.masquerade("-D", network));
        if self.link_exists(&network.name) {
            report.attempt("delete bridge", || self.ip(&["link", "del", &network.name]));
        }
        report.into_result()?;
        tracing::info!(network = %network.name, "bridge deleted");
        Ok(())
    }

    fn connect(&self, network: &Network, endpoint: &Endpoint, pid: u32) -> Result<()> {
        let host = endpoint.host_device.as_str();
        let peer = endpoint.peer_device.as_str();
        let address = format!("{}/{}", endpoint.address, network.subnet.prefix());
        let gateway = network.gateway.to_string();
        let netns = pid.to_string();

        self.ip(&["link", "add", host, "type", "veth", "peer", "name", peer])?;
        let wired = self
            .ip(&["link", "set", host, "master", &network.name])
            .and_then(|()| self.ip(&["link", "set", host, "up"]))
            .and_then(|()| self.ip(&["link", "set", peer, "netns", &netns]))
            .and_then(|()| self.in_netns(pid, &["addr", "add", &address, "dev", peer]))
            .and_then(|()| self.in_netns(pid, &["link", "set", peer, "up"]))
            .and_then(|()| self.in_netns(pid, &["link", "set", "lo", "up"]))
            .and_then(|()| self.in_netns(pid, &["route", "add", "default", "via", &gateway]));
        if let Err(e) = wired {
            let _ = self.ip(&["link", "del", host]);
            return Err(e);
        }

        for (i, port) in endpoint.port_mappings.iter().enumerate() {
            if let Err(e) = self.dnat("-A", endpoint, *port) {
                for added in &endpoint.port_mappings[..i] {
                    let _ = self.dnat("-D", endpoint, *added);
                }
                let _ = self.ip(&["link", "del", host]);
                return Err(e);
            }
        }
        tracing::info!(
            network = %network.name,
            container = %endpoint.container,
            address = %endpoint.address,
            "endpoint connected"
        );
        Ok(())
    }

    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        let mut report = CleanupReport::new();
        for port in &endpoint.port_mappings {
            report.attempt("remove port mapping", || self.dnat("-D", endpoint, *port));
        }
        if self.link_exists(&endpoint.host_device) {
            report.attempt("delete veth", || {
                self.ip(&["link", "del", &endpoint.host_device])
            });
        }
        report.into_result()?;
        tracing::info!(
            network = %network.name,
            container = %endpoint.container,
            "endpoint disconnected"
        );
        Ok(())
    }
}
