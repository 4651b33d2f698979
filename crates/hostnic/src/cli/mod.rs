//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};

use hostnic_common::{DeviceId, InstanceKind, InstanceRef};
use hostnic_network::{
    FileVolatileStore, HostResourceLedger, NetworkDevice, RunConfig, VolatileStore,
};

use crate::config::{CliConfig, load_device_config};

/// Hostnic - host-side NIC provisioning for containers and VMs
#[derive(Parser)]
#[command(name = "hostnic")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for hostnic data
    #[arg(
        long,
        global = true,
        env = "HOSTNIC_ROOT",
        default_value = "/var/lib/hostnic"
    )]
    pub root: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Provision against an in-memory host instead of the real one
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Device selection shared by the lifecycle commands.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Instance the device belongs to
    #[arg(short, long)]
    pub instance: String,

    /// Instance kind (container, virtual-machine)
    #[arg(short, long, default_value = "container")]
    pub kind: InstanceKind,

    /// Device name within the instance
    #[arg(short, long)]
    pub device: String,

    /// TOML file holding the device config
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Device config override (key=value)
    #[arg(short, long = "set")]
    pub set: Vec<String>,
}

/// Hostnic commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Validate a device config and the host environment
    Validate {
        #[command(flatten)]
        device: DeviceArgs,

        /// Skip host checks
        #[arg(long)]
        config_only: bool,
    },

    /// Provision the host side of a device
    Start {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Tear down the host side of a device
    Stop {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Show shared parent devices
    Ledger,

    /// Show the volatile state recorded for a device
    Volatile {
        /// Device ID (<instance>/<device>)
        device_id: DeviceId,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = CliConfig::default()
            .with_root(self.root.clone())
            .with_dry_run(self.dry_run);

        match self.command {
            Commands::Validate {
                device,
                config_only,
            } => {
                let nic = load(&config, &device)?;

                nic.validate_config()
                    .map_err(|e| eyre!("Invalid device config: {}", e))?;
                if !config_only {
                    nic.validate_environment()
                        .map_err(|e| eyre!("Host check failed: {}", e))?;
                }

                println!("Device {}/{} is valid", device.instance, device.device);
                Ok(())
            }

            Commands::Start { device } => {
                let nic = load(&config, &device)?;

                let run = tokio::task::spawn_blocking(move || nic.start())
                    .await?
                    .map_err(|e| eyre!("Failed to start device: {}", e))?;

                print_run_config(&run);
                Ok(())
            }

            Commands::Stop { device } => {
                let nic = load(&config, &device)?;

                tokio::task::spawn_blocking(move || {
                    let mut run = nic.stop()?;
                    print_run_config(&run);
                    run.run_post_hooks()
                })
                .await?
                .map_err(|e| eyre!("Failed to stop device: {}", e))?;

                Ok(())
            }

            Commands::Ledger => {
                let ledger = HostResourceLedger::open(config.paths.ledger())
                    .map_err(|e| eyre!("Failed to open ledger: {}", e))?;

                let json = serde_json::to_string_pretty(&ledger.snapshot())?;
                println!("{}", json);
                Ok(())
            }

            Commands::Volatile { device_id } => {
                let store = FileVolatileStore::new(config.paths.clone());
                let record = store
                    .get(&device_id)
                    .map_err(|e| eyre!("Failed to read volatile state: {}", e))?;

                let json = serde_json::to_string_pretty(&record)?;
                println!("{}", json);
                Ok(())
            }
        }
    }

    /// Default log directive for this invocation.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        if self.debug {
            "hostnic=debug"
        } else {
            "hostnic=info"
        }
    }
}

fn load(config: &CliConfig, args: &DeviceArgs) -> Result<Box<dyn NetworkDevice>> {
    let device_config = load_device_config(args.config.as_deref(), &args.set)
        .map_err(|e| eyre!("Failed to load device config: {}", e))?;
    let ctx = config.context(&device_config)?;
    let instance = InstanceRef::new(args.instance.clone(), args.kind);

    tracing::debug!(
        instance = %args.instance,
        device = %args.device,
        dry_run = config.dry_run,
        "Loading device"
    );

    let nic = hostnic_network::load(instance, &args.device, device_config, ctx)?;
    Ok(nic)
}

fn print_run_config(run: &RunConfig) {
    for item in &run.network_interface {
        println!("{}={}", item.key, item.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_overrides() {
        let cli = Cli::try_parse_from([
            "hostnic",
            "--dry-run",
            "start",
            "--instance",
            "c1",
            "--device",
            "eth1",
            "--set",
            "parent=eth0",
            "--set",
            "name=eth1",
        ])
        .unwrap();

        assert!(cli.dry_run);
        match cli.command {
            Commands::Start { device } => {
                assert_eq!(device.kind, InstanceKind::Container);
                assert_eq!(device.set, vec!["parent=eth0", "name=eth1"]);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn debug_raises_log_level() {
        let cli = Cli::try_parse_from(["hostnic", "--debug", "ledger"]).unwrap();
        assert_eq!(cli.log_directive(), "hostnic=debug");
    }

    #[test]
    fn rejects_unknown_instance_kind() {
        let parsed = Cli::try_parse_from([
            "hostnic", "stop", "-i", "c1", "-d", "eth1", "--kind", "pod",
        ]);
        assert!(parsed.is_err());
    }
}
