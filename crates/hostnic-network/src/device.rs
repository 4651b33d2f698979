//! Device driver contract.
//!
//! Each NIC type implements [`NetworkDevice`]. Start returns a [`RunConfig`]
//! telling the instance how to wire the host interface in; stop returns one
//! naming what to detach, plus post hooks that tear down the host side once
//! the caller has detached the guest side.

use std::fmt;
use std::sync::Arc;

use hostnic_common::{HostnicError, HostnicResult, InstanceRef};

use crate::config::DeviceConfig;
use crate::host::HostNetwork;
use crate::ledger::HostResourceLedger;
use crate::nic_macvlan::MacvlanNic;
use crate::volatile::VolatileStore;

/// Deferred host-side teardown returned by [`NetworkDevice::stop`].
pub type PostHook = Box<dyn FnOnce() -> HostnicResult<()> + Send>;

/// One attachment directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfigItem {
    /// Directive name.
    pub key: String,
    /// Directive value.
    pub value: String,
}

impl RunConfigItem {
    /// Create a directive.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Runtime descriptor consumed by the instance's network attachment code.
#[derive(Default)]
pub struct RunConfig {
    /// Ordered attachment directives.
    pub network_interface: Vec<RunConfigItem>,
    /// Hooks to run after the guest side has been detached.
    pub post_hooks: Vec<PostHook>,
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("network_interface", &self.network_interface)
            .field("post_hooks", &self.post_hooks.len())
            .finish()
    }
}

impl RunConfig {
    /// Value of the first directive named `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.network_interface
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    /// Directive names in order.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.network_interface
            .iter()
            .map(|item| item.key.as_str())
            .collect()
    }

    /// Run every post hook, even if earlier ones fail.
    ///
    /// # Errors
    ///
    /// Returns the single failure, or a teardown error holding all of them.
    pub fn run_post_hooks(&mut self) -> HostnicResult<()> {
        let mut errors: Vec<HostnicError> = self
            .post_hooks
            .drain(..)
            .filter_map(|hook| hook().err())
            .collect();

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(HostnicError::Teardown { errors }),
        }
    }
}

/// Lifecycle state of a device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Config not yet validated.
    Unconfigured,
    /// Config validated, nothing on the host.
    Validated,
    /// Host interface attached.
    Started,
    /// Stop returned; teardown pending.
    Stopped,
    /// Teardown done.
    Idle,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => write!(f, "unconfigured"),
            Self::Validated => write!(f, "validated"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Host-wide collaborators shared by all device drivers.
#[derive(Clone)]
pub struct NetworkContext {
    /// Host network primitives.
    pub host: Arc<dyn HostNetwork>,
    /// Shared parent device ledger.
    pub ledger: Arc<HostResourceLedger>,
    /// Per-device volatile state.
    pub volatile: Arc<dyn VolatileStore>,
}

impl fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkContext")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

/// Contract every NIC type implements.
///
/// Calls block until host operations complete. The caller guarantees a
/// device is never started twice concurrently and that start finishes
/// before stop begins.
pub trait NetworkDevice: Send + Sync {
    /// Check the config. Pure: no host access.
    ///
    /// # Errors
    ///
    /// Returns a config error for the first problem found.
    fn validate_config(&self) -> HostnicResult<()>;

    /// Check host preconditions. Read-only.
    ///
    /// # Errors
    ///
    /// Returns an environment error if a precondition is unmet.
    fn validate_environment(&self) -> HostnicResult<()>;

    /// Provision the host side. All-or-nothing.
    ///
    /// # Errors
    ///
    /// Returns validation errors, or a provisioning error after rolling
    /// back every completed step.
    fn start(&self) -> HostnicResult<RunConfig>;

    /// Describe what to detach. Makes no host changes; teardown happens in
    /// the returned post hooks.
    ///
    /// # Errors
    ///
    /// Returns an error if the volatile record cannot be read.
    fn stop(&self) -> HostnicResult<RunConfig>;

    /// Current lifecycle state.
    fn state(&self) -> DeviceState;
}

/// Build the driver for `config`'s `nictype`.
///
/// # Errors
///
/// Returns a config error for unknown NIC types or malformed identifiers.
pub fn load(
    instance: InstanceRef,
    name: &str,
    config: DeviceConfig,
    ctx: NetworkContext,
) -> HostnicResult<Box<dyn NetworkDevice>> {
    match config.get("nictype") {
        Some("macvlan") => Ok(Box::new(MacvlanNic::new(instance, name, config, ctx)?)),
        Some(other) => Err(HostnicError::InvalidField {
            field: "nictype".to_string(),
            value: other.to_string(),
            reason: "Unsupported NIC type".to_string(),
        }),
        None => Err(HostnicError::MissingField {
            field: "nictype".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_hook(message: &'static str) -> PostHook {
        Box::new(move || {
            Err(HostnicError::Internal {
                message: message.to_string(),
            })
        })
    }

    #[test]
    fn run_config_lookup() {
        let run = RunConfig {
            network_interface: vec![
                RunConfigItem::new("link", "mac1"),
                RunConfigItem::new("flags", "up"),
            ],
            post_hooks: Vec::new(),
        };
        assert_eq!(run.get("link"), Some("mac1"));
        assert_eq!(run.get("hwaddr"), None);
        assert_eq!(run.keys(), vec!["link", "flags"]);
    }

    #[test]
    fn post_hooks_all_run_and_aggregate() {
        let mut run = RunConfig {
            network_interface: Vec::new(),
            post_hooks: vec![failing_hook("a"), Box::new(|| Ok(())), failing_hook("b")],
        };
        let err = run.run_post_hooks().unwrap_err();
        match err {
            HostnicError::Teardown { errors } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(run.post_hooks.is_empty());
    }

    #[test]
    fn unknown_nictype_is_rejected() {
        let ctx = NetworkContext {
            host: Arc::new(crate::fake::FakeHost::new()),
            ledger: Arc::new(HostResourceLedger::in_memory()),
            volatile: Arc::new(crate::volatile::MemoryVolatileStore::new()),
        };
        let config = DeviceConfig::new().with("nictype", "sriov");
        let Err(err) = load(InstanceRef::container("c1"), "eth0", config, ctx) else {
            panic!("sriov should not load");
        };
        assert!(err.is_config());
    }
}
