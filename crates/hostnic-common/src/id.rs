//! Instance and device identifiers, and host interface naming.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{HostnicError, HostnicResult};

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const MAX_INTERFACE_NAME: usize = 15;

/// The kind of guest instance a device is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    /// System container sharing the host kernel.
    Container,
    /// Virtual machine with its own kernel.
    VirtualMachine,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::VirtualMachine => write!(f, "virtual-machine"),
        }
    }
}

impl FromStr for InstanceKind {
    type Err = HostnicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "virtual-machine" | "vm" => Ok(Self::VirtualMachine),
            other => Err(HostnicError::UnsupportedInstance {
                kind: other.to_string(),
            }),
        }
    }
}

/// The guest instance that owns a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    /// Instance name.
    pub name: String,
    /// Instance kind.
    pub kind: InstanceKind,
}

impl InstanceRef {
    /// Create a new instance reference.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: InstanceKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Shorthand for a container instance.
    #[must_use]
    pub fn container(name: impl Into<String>) -> Self {
        Self::new(name, InstanceKind::Container)
    }

    /// Shorthand for a virtual machine instance.
    #[must_use]
    pub fn virtual_machine(name: impl Into<String>) -> Self {
        Self::new(name, InstanceKind::VirtualMachine)
    }

    /// Whether the instance is a container.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.kind == InstanceKind::Container
    }
}

/// Identity of one device on one instance, `<instance>/<device>`.
///
/// Both halves must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId {
    instance: String,
    device: String,
}

impl DeviceId {
    /// Maximum length of each half of the ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a device ID, validating both components.
    ///
    /// # Errors
    ///
    /// Returns an error if either component is malformed.
    pub fn new(instance: impl Into<String>, device: impl Into<String>) -> HostnicResult<Self> {
        let instance = instance.into();
        let device = device.into();
        Self::validate(&instance)?;
        Self::validate(&device)?;
        Ok(Self { instance, device })
    }

    /// The owning instance name.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The device name within the instance.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    fn validate(part: &str) -> HostnicResult<()> {
        let valid = !part.is_empty()
            && part.len() <= Self::MAX_LENGTH
            && part != "."
            && part != ".."
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if valid {
            Ok(())
        } else {
            Err(HostnicError::Config {
                message: format!("Invalid device identifier component: {part:?}"),
            })
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.device)
    }
}

impl FromStr for DeviceId {
    type Err = HostnicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (instance, device) = s.split_once('/').ok_or_else(|| HostnicError::Config {
            message: format!("Device identifier must be <instance>/<device>: {s:?}"),
        })?;
        Self::new(instance, device)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = HostnicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

/// Generate a random host interface name with the given prefix.
///
/// The random part is hex from a UUID v4; the result never exceeds
/// [`MAX_INTERFACE_NAME`].
#[must_use]
pub fn random_interface_name(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4();
    let mut name = format!("{prefix}{}", hex::encode(&uuid.as_bytes()[..4]));
    name.truncate(MAX_INTERFACE_NAME);
    name
}

/// Check that `name` is usable as a network interface name.
///
/// # Errors
///
/// Returns the reason the name is unusable.
pub fn validate_interface_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > MAX_INTERFACE_NAME {
        return Err(format!(
            "Interface name cannot exceed {MAX_INTERFACE_NAME} characters"
        ));
    }

    if name == "." || name == ".." {
        return Err("Interface name cannot be '.' or '..'".to_string());
    }

    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '/' | ':'))
    {
        return Err(format!("Interface name cannot contain {c:?}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_kind_parsing() {
        assert_eq!(
            "container".parse::<InstanceKind>().unwrap(),
            InstanceKind::Container
        );
        assert_eq!(
            "vm".parse::<InstanceKind>().unwrap(),
            InstanceKind::VirtualMachine
        );
        assert!("pod".parse::<InstanceKind>().is_err());
        assert_eq!(InstanceKind::VirtualMachine.to_string(), "virtual-machine");
    }

    #[test]
    fn device_id_round_trips_through_display() {
        let id: DeviceId = "web1/eth0".parse().unwrap();
        assert_eq!(id.instance(), "web1");
        assert_eq!(id.device(), "eth0");
        assert_eq!(id.to_string(), "web1/eth0");
    }

    #[test]
    fn invalid_device_ids() {
        assert!("noslash".parse::<DeviceId>().is_err());
        assert!("/eth0".parse::<DeviceId>().is_err());
        assert!("web1/".parse::<DeviceId>().is_err());
        assert!("web1/../etc".parse::<DeviceId>().is_err());
        assert!(DeviceId::new("a".repeat(65), "eth0").is_err());
    }

    #[test]
    fn random_names_are_bounded_and_distinct() {
        let a = random_interface_name("mac");
        let b = random_interface_name("mac");
        assert_ne!(a, b);
        assert!(a.starts_with("mac"));
        assert_eq!(a.len(), 11);

        let long = random_interface_name("verylongprefix");
        assert_eq!(long.len(), MAX_INTERFACE_NAME);
    }

    #[test]
    fn interface_name_rules() {
        assert!(validate_interface_name("eth0").is_ok());
        assert!(validate_interface_name("eth0.100").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("abcdefghijklmnop").is_err());
        assert!(validate_interface_name("eth 0").is_err());
        assert!(validate_interface_name("eth/0").is_err());
        assert!(validate_interface_name("..").is_err());
    }

    proptest::proptest! {
        #[test]
        fn any_well_formed_device_id_parses(
            instance in "[a-z0-9][a-z0-9_-]{0,20}",
            device in "[a-z0-9][a-z0-9_-]{0,20}",
        ) {
            let raw = format!("{instance}/{device}");
            let id: DeviceId = raw.parse().unwrap();
            proptest::prop_assert_eq!(id.to_string(), raw);
        }
    }
}
