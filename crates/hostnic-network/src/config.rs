//! Device configuration and validation.

use std::collections::BTreeMap;

use hostnic_common::{HostnicError, HostnicResult, validate_interface_name};
use serde::{Deserialize, Serialize};

/// Raw device configuration as supplied by the orchestrator.
///
/// Empty values are treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfig(BTreeMap<String, String>);

impl DeviceConfig {
    /// Create an empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value for `key`, or `None` if absent or empty.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// All keys and values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parent interface.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.get("parent")
    }

    /// Guest-visible interface name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.get("name")
    }

    /// Hardware address override.
    #[must_use]
    pub fn hwaddr(&self) -> Option<&str> {
        self.get("hwaddr")
    }

    /// MTU override.
    #[must_use]
    pub fn mtu(&self) -> Option<u32> {
        self.get("mtu").and_then(|v| v.parse().ok())
    }

    /// VLAN tag.
    #[must_use]
    pub fn vlan(&self) -> Option<u16> {
        self.get("vlan").and_then(|v| v.parse().ok())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DeviceConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Check applied to one field's value.
pub type FieldRule = fn(&str) -> Result<(), String>;

/// Rule for a NIC config field.
#[must_use]
pub fn nic_rule(field: &str) -> FieldRule {
    match field {
        "parent" | "name" => validate_interface_name,
        "mtu" => validate_mtu,
        "hwaddr" => validate_mac,
        "vlan" => validate_vlan,
        "boot.priority" => validate_u32,
        _ => |_| Ok(()),
    }
}

/// Validates a config against a device type's field lists.
#[derive(Debug, Clone, Copy)]
pub struct NicValidator {
    /// Value accepted for the `nictype` key.
    pub nictype: &'static str,
    /// Fields that must be set.
    pub required: &'static [&'static str],
    /// Fields that may be set.
    pub optional: &'static [&'static str],
}

impl NicValidator {
    /// Check `config`, reporting the first problem found.
    ///
    /// Required fields are checked first, then every key in key order.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the offending field.
    pub fn validate(&self, config: &DeviceConfig) -> HostnicResult<()> {
        if let Some(field) = self.required.iter().find(|f| config.get(f).is_none()) {
            return Err(HostnicError::MissingField {
                field: (*field).to_string(),
            });
        }

        for (field, value) in config.iter() {
            let result = match field {
                "type" => expect_value(value, "nic"),
                "nictype" => expect_value(value, self.nictype),
                _ if self.knows(field) => {
                    if value.is_empty() {
                        Ok(())
                    } else {
                        nic_rule(field)(value)
                    }
                }
                _ => {
                    return Err(HostnicError::UnknownField {
                        field: field.to_string(),
                    });
                }
            };

            result.map_err(|reason| HostnicError::InvalidField {
                field: field.to_string(),
                value: value.to_string(),
                reason,
            })?;
        }

        Ok(())
    }

    fn knows(&self, field: &str) -> bool {
        self.required
            .iter()
            .chain(self.optional)
            .any(|known| *known == field)
    }
}

fn expect_value(value: &str, expected: &str) -> Result<(), String> {
    if value == expected {
        Ok(())
    } else {
        Err(format!("Expected \"{expected}\""))
    }
}

fn validate_mtu(value: &str) -> Result<(), String> {
    let mtu: u32 = value.parse().map_err(|_| "Invalid MTU".to_string())?;
    if (1280..=16384).contains(&mtu) {
        Ok(())
    } else {
        Err("Network MTU must be between 1280 and 16384".to_string())
    }
}

fn validate_vlan(value: &str) -> Result<(), String> {
    let vlan: u16 = value.parse().map_err(|_| "Invalid VLAN ID".to_string())?;
    if vlan <= 4094 {
        Ok(())
    } else {
        Err("VLAN ID must be between 0 and 4094".to_string())
    }
}

fn validate_u32(value: &str) -> Result<(), String> {
    value
        .parse::<u32>()
        .map(|_| ())
        .map_err(|_| "Must be a non-negative integer".to_string())
}

fn validate_mac(value: &str) -> Result<(), String> {
    let sep = if value.contains('-') { '-' } else { ':' };
    let octets: Vec<&str> = value.split(sep).collect();

    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

    if valid {
        Ok(())
    } else {
        Err("Invalid MAC address".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VALIDATOR: NicValidator = NicValidator {
        nictype: "macvlan",
        required: &["parent"],
        optional: &["name", "mtu", "hwaddr", "vlan", "boot.priority"],
    };

    fn base() -> DeviceConfig {
        DeviceConfig::new()
            .with("type", "nic")
            .with("nictype", "macvlan")
            .with("parent", "eth0")
    }

    #[test]
    fn accepts_full_config() {
        let config = base()
            .with("name", "eth1")
            .with("mtu", "9000")
            .with("hwaddr", "00:16:3e:aa:bb:cc")
            .with("vlan", "100")
            .with("boot.priority", "10");
        VALIDATOR.validate(&config).unwrap();
        assert_eq!(config.mtu(), Some(9000));
        assert_eq!(config.vlan(), Some(100));
    }

    #[test]
    fn missing_parent() {
        let config = DeviceConfig::new().with("parent", "");
        assert!(matches!(
            VALIDATOR.validate(&config),
            Err(HostnicError::MissingField { field }) if field == "parent"
        ));
    }

    #[test]
    fn rejects_bad_values() {
        for (field, value) in [
            ("mtu", "576"),
            ("mtu", "abc"),
            ("vlan", "4095"),
            ("hwaddr", "00:16:3e:aa:bb"),
            ("hwaddr", "zz:16:3e:aa:bb:cc"),
            ("name", "a-very-long-interface"),
            ("boot.priority", "-1"),
            ("nictype", "bridged"),
        ] {
            let err = VALIDATOR.validate(&base().with(field, value)).unwrap_err();
            assert!(
                matches!(&err, HostnicError::InvalidField { field: f, .. } if f == field),
                "{field}={value}: {err}"
            );
        }
    }

    #[test]
    fn empty_optional_values_are_unset() {
        VALIDATOR.validate(&base().with("mtu", "")).unwrap();
        assert_eq!(base().with("mtu", "").mtu(), None);
    }

    #[test]
    fn dash_separated_mac() {
        assert!(validate_mac("00-16-3E-AA-BB-CC").is_ok());
    }

    proptest! {
        #[test]
        fn unknown_fields_are_rejected(field in "[a-z][a-z_.]{0,12}") {
            prop_assume!(!["type", "nictype", "parent", "name", "mtu", "hwaddr", "vlan", "boot.priority"]
                .contains(&field.as_str()));

            let err = VALIDATOR.validate(&base().with(field.clone(), "x")).unwrap_err();
            let rejected = matches!(err, HostnicError::UnknownField { field: f } if f == field);
            prop_assert!(rejected);
        }
    }
}
