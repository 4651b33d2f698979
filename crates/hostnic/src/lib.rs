//! # hostnic
//!
//! Operator CLI for provisioning host-side MACVLAN and MACVTAP interfaces.
//!
//! ## Commands
//!
//! - `validate`: check a device config and the host
//! - `start`: provision the host side and print the attachment descriptor
//! - `stop`: print the detach descriptor and tear the host side down
//! - `ledger`: list shared parent devices and their reference counts
//! - `volatile`: show what was recorded for a device
//!
//! ## Example
//!
//! ```no_run
//! use hostnic::config::{CliConfig, load_device_config};
//! use hostnic_common::InstanceRef;
//! use hostnic_network::NetworkDevice;
//!
//! let device = load_device_config(None, &["parent=eth0".into(), "name=eth1".into()])?;
//! let ctx = CliConfig::default().with_dry_run(true).context(&device)?;
//! let nic = hostnic_network::load(InstanceRef::container("web"), "eth1", device, ctx)?;
//! let run = nic.start()?;
//! println!("{:?}", run.get("link"));
//! # Ok::<(), hostnic_common::HostnicError>(())
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
