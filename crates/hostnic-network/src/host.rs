//! Host network primitives.
//!
//! Everything the NIC drivers do to the host goes through [`HostNetwork`].
//! [`IpHost`] implements it with iproute2 and sysfs/procfs lookups.

use std::path::PathBuf;
use std::process::Command;

use hostnic_common::{HostnicError, HostnicResult};

/// Low-level link type created on top of a parent device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// MACVLAN link, moved into a container.
    Macvlan,
    /// MACVTAP link, handed to a VM as a tap device.
    Macvtap,
}

impl LinkKind {
    /// The iproute2 link type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Macvlan => "macvlan",
            Self::Macvtap => "macvtap",
        }
    }
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-side network operations used by device drivers.
///
/// All calls block until the underlying operation finishes.
pub trait HostNetwork: Send + Sync {
    /// Whether a network interface currently exists.
    fn interface_exists(&self, name: &str) -> bool;

    /// Find an existing VLAN sub-interface of `parent` carrying `vlan`.
    fn find_vlan_device(&self, parent: &str, vlan: u16) -> Option<String>;

    /// Create a VLAN sub-interface and bring it up.
    fn create_vlan(&self, parent: &str, name: &str, vlan: u16) -> HostnicResult<()>;

    /// Create a bridge-mode MACVLAN or MACVTAP link on `parent`.
    fn create_macvlan(&self, name: &str, parent: &str, kind: LinkKind) -> HostnicResult<()>;

    /// Set the hardware address of an interface.
    fn set_address(&self, name: &str, hwaddr: &str) -> HostnicResult<()>;

    /// Set the MTU of an interface.
    fn set_mtu(&self, name: &str, mtu: u32) -> HostnicResult<()>;

    /// Bring an interface up.
    fn set_up(&self, name: &str) -> HostnicResult<()>;

    /// Delete an interface.
    fn delete_interface(&self, name: &str) -> HostnicResult<()>;
}

/// Resolve the host device a NIC should be linked to.
///
/// Without a VLAN this is the parent itself. With one, an existing VLAN
/// sub-interface is reused, otherwise `<parent>.<vlan>` is used.
pub fn host_device_name(host: &dyn HostNetwork, parent: &str, vlan: Option<u16>) -> String {
    match vlan {
        None => parent.to_string(),
        Some(id) => host
            .find_vlan_device(parent, id)
            .unwrap_or_else(|| format!("{parent}.{id}")),
    }
}

/// Run an external program, returning its stdout.
///
/// # Errors
///
/// Returns [`HostnicError::Command`] carrying stderr if the program exits
/// unsuccessfully, or an I/O error if it cannot be spawned.
pub fn run_command(program: &str, args: &[&str]) -> HostnicResult<String> {
    tracing::trace!(program, ?args, "Running command");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| HostnicError::Internal {
            message: format!("Failed to run {program}: {e}"),
        })?;

    if !output.status.success() {
        return Err(HostnicError::Command {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Find the VLAN device for `parent`/`vlan` in `/proc/net/vlan/config` contents.
#[must_use]
pub fn parse_vlan_config(contents: &str, parent: &str, vlan: u16) -> Option<String> {
    contents.lines().skip(2).find_map(|line| {
        let mut fields = line.split('|').map(str::trim);
        let name = fields.next()?;
        let id = fields.next()?.parse::<u16>().ok()?;
        let dev = fields.next()?;
        (id == vlan && dev == parent).then(|| name.to_string())
    })
}

/// [`HostNetwork`] backed by iproute2.
#[derive(Debug, Clone)]
pub struct IpHost {
    sysfs: PathBuf,
    procfs: PathBuf,
}

impl Default for IpHost {
    fn default() -> Self {
        Self {
            sysfs: PathBuf::from("/sys"),
            procfs: PathBuf::from("/proc"),
        }
    }
}

impl IpHost {
    /// Create a host using the standard `/sys` and `/proc` mounts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use alternative sysfs and procfs roots.
    #[must_use]
    pub fn with_roots(sysfs: impl Into<PathBuf>, procfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            procfs: procfs.into(),
        }
    }

    fn ip(args: &[&str]) -> HostnicResult<()> {
        run_command("ip", args).map(|_| ())
    }

    fn disable_ipv6(&self, name: &str) -> HostnicResult<()> {
        let path = self
            .procfs
            .join("sys/net/ipv6/conf")
            .join(name)
            .join("disable_ipv6");

        // Kernels booted without IPv6 have no such knob.
        if !path.exists() {
            return Ok(());
        }

        std::fs::write(&path, "1")?;
        Ok(())
    }

    /// The sysfs directory for an interface.
    #[must_use]
    pub fn interface_path(&self, name: &str) -> PathBuf {
        self.sysfs.join("class/net").join(name)
    }

    fn vlan_config_path(&self) -> PathBuf {
        self.procfs.join("net/vlan/config")
    }
}

impl HostNetwork for IpHost {
    fn interface_exists(&self, name: &str) -> bool {
        !name.is_empty() && self.interface_path(name).exists()
    }

    fn find_vlan_device(&self, parent: &str, vlan: u16) -> Option<String> {
        let contents = std::fs::read_to_string(self.vlan_config_path()).ok()?;
        parse_vlan_config(&contents, parent, vlan)
    }

    fn create_vlan(&self, parent: &str, name: &str, vlan: u16) -> HostnicResult<()> {
        let id = vlan.to_string();
        Self::ip(&[
            "link", "add", "link", parent, "name", name, "up", "type", "vlan", "id", &id,
        ])?;
        self.disable_ipv6(name)?;

        tracing::info!(parent, name, vlan, "VLAN interface created");
        Ok(())
    }

    fn create_macvlan(&self, name: &str, parent: &str, kind: LinkKind) -> HostnicResult<()> {
        Self::ip(&[
            "link",
            "add",
            "dev",
            name,
            "link",
            parent,
            "type",
            kind.as_str(),
            "mode",
            "bridge",
        ])?;

        tracing::info!(parent, name, %kind, "Interface created");
        Ok(())
    }

    fn set_address(&self, name: &str, hwaddr: &str) -> HostnicResult<()> {
        Self::ip(&["link", "set", "dev", name, "address", hwaddr])
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> HostnicResult<()> {
        Self::ip(&["link", "set", "dev", name, "mtu", &mtu.to_string()])
    }

    fn set_up(&self, name: &str) -> HostnicResult<()> {
        Self::ip(&["link", "set", "dev", name, "up"])
    }

    fn delete_interface(&self, name: &str) -> HostnicResult<()> {
        Self::ip(&["link", "delete", "dev", name])?;
        tracing::debug!(name, "Interface deleted");
        Ok(())
    }
}
