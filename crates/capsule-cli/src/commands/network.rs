//! `capsule network` — Manage container networks.

use std::net::Ipv4Addr;
use std::process::ExitCode;

use clap::{Args, Subcommand};

use capsule_common::constants::BRIDGE_DRIVER;
use capsule_runtime::Engine;
use capsule_runtime::network::Subnet;

use crate::output::{self, Table};

/// Network subcommands.
#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network.
    Create(CreateArgs),
    /// List networks.
    #[command(alias = "ls")]
    List,
    /// Remove a network with no attached containers.
    #[command(alias = "rm")]
    Remove(RemoveArgs),
}

/// Arguments for `network create`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Driver wiring the network on the host.
    #[arg(long, default_value = BRIDGE_DRIVER)]
    pub driver: String,

    /// Address block, e.g. `192.168.10.0/24`.
    #[arg(long)]
    pub subnet: Subnet,

    /// Gateway address; defaults to the first host of the subnet.
    #[arg(long)]
    pub gateway: Option<Ipv4Addr>,

    /// Network name.
    pub name: String,
}

/// Arguments for `network remove`.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Network name.
    pub name: String,
}

/// Executes a `network` subcommand.
///
/// # Errors
///
/// Returns an error if the network operation fails.
pub fn execute(command: NetworkCommand, engine: &Engine) -> anyhow::Result<ExitCode> {
    match command {
        NetworkCommand::Create(args) => {
            let network =
                engine.create_network(&args.name, &args.driver, args.subnet, args.gateway)?;
            output::println(&network.name)?;
        }
        NetworkCommand::List => {
            let mut table = Table::new(["NAME", "DRIVER", "SUBNET", "GATEWAY", "CONTAINERS"]);
            for network in engine.networks()? {
                let attached: Vec<_> = network.endpoints.iter().map(|e| e.container.as_str()).collect();
                table.row([
                    network.name.clone(),
                    network.driver.clone(),
                    network.subnet.to_string(),
                    network.gateway.to_string(),
                    attached.join(","),
                ]);
            }
            output::print(&table.render())?;
        }
        NetworkCommand::Remove(args) => {
            engine.remove_network(&args.name)?;
            output::println(&args.name)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
