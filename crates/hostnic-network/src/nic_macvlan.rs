//! MACVLAN/MACVTAP NIC.
//!
//! Containers get a bridge-mode MACVLAN link that is moved into the guest;
//! virtual machines get a MACVTAP link that the hypervisor opens as a tap
//! device. Both hang off a parent interface, optionally through a VLAN
//! sub-interface shared with other NICs via the [`HostResourceLedger`].

use std::fmt;
use std::sync::Arc;

use hostnic_common::{
    DeviceId, HostnicError, HostnicResult, InstanceKind, InstanceRef, random_interface_name,
};
use parking_lot::Mutex;

use crate::config::{DeviceConfig, NicValidator};
use crate::device::{DeviceState, NetworkContext, NetworkDevice, RunConfig, RunConfigItem};
use crate::host::{HostNetwork, LinkKind};
use crate::ledger::{HostResourceLedger, ParentKey};
use crate::transaction::Transaction;
use crate::volatile::{VolatileRecord, VolatileStore};

/// Prefix of generated host-side interface names.
pub const HOST_NAME_PREFIX: &str = "mac";

const SUPPORTED_KINDS: &[InstanceKind] = &[InstanceKind::Container, InstanceKind::VirtualMachine];

const VALIDATOR: NicValidator = NicValidator {
    nictype: "macvlan",
    required: &["parent"],
    optional: &[
        "name",
        "mtu",
        "hwaddr",
        "vlan",
        "maas.subnet.ipv4",
        "maas.subnet.ipv6",
        "boot.priority",
    ],
};

/// MACVLAN/MACVTAP device driver.
pub struct MacvlanNic {
    id: DeviceId,
    instance: InstanceRef,
    config: DeviceConfig,
    ctx: NetworkContext,
    state: Arc<Mutex<DeviceState>>,
}

impl fmt::Debug for MacvlanNic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacvlanNic")
            .field("id", &self.id)
            .field("kind", &self.instance.kind)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl MacvlanNic {
    /// Create the driver for device `name` on `instance`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the instance or device name is malformed.
    pub fn new(
        instance: InstanceRef,
        name: &str,
        config: DeviceConfig,
        ctx: NetworkContext,
    ) -> HostnicResult<Self> {
        Ok(Self {
            id: DeviceId::new(&instance.name, name)?,
            instance,
            config,
            ctx,
            state: Arc::new(Mutex::new(DeviceState::Unconfigured)),
        })
    }

    /// The device identity.
    #[must_use]
    pub const fn id(&self) -> &DeviceId {
        &self.id
    }

    /// The shared parent this NIC depends on.
    #[must_use]
    pub fn parent_key(&self) -> ParentKey {
        ParentKey::new(self.config.parent().unwrap_or_default(), self.config.vlan())
    }

    const fn link_kind(&self) -> LinkKind {
        match self.instance.kind {
            InstanceKind::Container => LinkKind::Macvlan,
            InstanceKind::VirtualMachine => LinkKind::Macvtap,
        }
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    /// Run the host-side teardown now.
    ///
    /// This is what the post hook returned by [`NetworkDevice::stop`] does.
    ///
    /// # Errors
    ///
    /// Returns a teardown error listing every step that failed.
    pub fn post_stop(&self) -> HostnicResult<()> {
        self.teardown().run()
    }

    fn teardown(&self) -> Teardown {
        Teardown {
            id: self.id.clone(),
            key: self.parent_key(),
            host: Arc::clone(&self.ctx.host),
            ledger: Arc::clone(&self.ctx.ledger),
            volatile: Arc::clone(&self.ctx.volatile),
            state: Arc::clone(&self.state),
        }
    }

    fn provision(&self) -> HostnicResult<String> {
        let host = self.ctx.host.as_ref();
        let key = self.parent_key();
        let kind = self.link_kind();

        let mut ledger = self
            .ctx
            .ledger
            .lock()
            .map_err(|e| HostnicError::provisioning("lock the resource ledger", e))?;
        let mut txn = Transaction::new();

        let acquired = ledger.acquire_or_create(&key, host).map_err(|e| {
            if e.is_environment() {
                e
            } else {
                HostnicError::provisioning("create the parent device", e)
            }
        })?;
        let ledger = &mut ledger;
        let parent_key = key.clone();
        txn.on_rollback("release the parent device", move || {
            ledger.release_and_remove(&parent_key, host)
        });

        let host_name = random_interface_name(HOST_NAME_PREFIX);
        let created_name = host_name.clone();
        txn.step(
            &format!("create the {kind} interface"),
            || host.create_macvlan(&host_name, &acquired.device, kind),
            move || host.delete_interface(&created_name),
        )?;

        let mut record = VolatileRecord {
            host_name: Some(host_name.clone()),
            created: !acquired.existed,
            ..VolatileRecord::default()
        };

        if let Some(hwaddr) = self.config.hwaddr() {
            txn.run("set the MAC address", || host.set_address(&host_name, hwaddr))?;
            record.hwaddr = Some(hwaddr.to_string());
        }

        if let Some(mtu) = self.config.mtu() {
            txn.run("set the MTU", || host.set_mtu(&host_name, mtu))?;
            record.mtu = Some(mtu.to_string());
        }

        // Container links are brought up from inside the guest.
        if kind == LinkKind::Macvtap {
            txn.run(&format!("bring up interface {host_name}"), || {
                host.set_up(&host_name)
            })?;
        }

        self.ctx
            .volatile
            .set(&self.id, record.to_map())
            .map_err(|e| HostnicError::provisioning("record volatile state", e))?;

        txn.commit();

        tracing::info!(
            device = %self.id,
            %host_name,
            parent = %acquired.device,
            created_parent = record.created,
            "NIC started"
        );
        Ok(host_name)
    }

    fn run_config(&self, host_name: &str) -> RunConfig {
        let mut items = vec![
            RunConfigItem::new("devName", self.id.device()),
            RunConfigItem::new("name", self.config.name().unwrap_or_default()),
            RunConfigItem::new("type", "phys"),
            RunConfigItem::new("flags", "up"),
            RunConfigItem::new("link", host_name),
        ];

        if self.instance.kind == InstanceKind::VirtualMachine {
            items.push(RunConfigItem::new(
                "hwaddr",
                self.config.hwaddr().unwrap_or_default(),
            ));
        }

        RunConfig {
            network_interface: items,
            post_hooks: Vec::new(),
        }
    }
}

impl NetworkDevice for MacvlanNic {
    fn validate_config(&self) -> HostnicResult<()> {
        if !SUPPORTED_KINDS.contains(&self.instance.kind) {
            return Err(HostnicError::UnsupportedInstance {
                kind: self.instance.kind.to_string(),
            });
        }

        VALIDATOR.validate(&self.config)?;

        let mut state = self.state.lock();
        if *state == DeviceState::Unconfigured {
            *state = DeviceState::Validated;
        }
        Ok(())
    }

    fn validate_environment(&self) -> HostnicResult<()> {
        if self.instance.is_container() && self.config.name().is_none() {
            return Err(HostnicError::Environment {
                message: "Requires name property to start".to_string(),
            });
        }

        let parent = self.config.parent().unwrap_or_default();
        if !self.ctx.host.interface_exists(parent) {
            return Err(HostnicError::Environment {
                message: format!("Parent device '{parent}' doesn't exist"),
            });
        }

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(device = %self.id, kind = %self.instance.kind))]
    fn start(&self) -> HostnicResult<RunConfig> {
        match self.state() {
            DeviceState::Unconfigured => self.validate_config()?,
            DeviceState::Started | DeviceState::Stopped => {
                return Err(HostnicError::Internal {
                    message: format!("Device {} is already attached", self.id),
                });
            }
            DeviceState::Validated | DeviceState::Idle => {}
        }

        self.validate_environment()?;

        let host_name = self.provision()?;
        self.set_state(DeviceState::Started);
        Ok(self.run_config(&host_name))
    }

    #[tracing::instrument(skip(self), fields(device = %self.id))]
    fn stop(&self) -> HostnicResult<RunConfig> {
        let record = VolatileRecord::from_map(&self.ctx.volatile.get(&self.id)?);
        let teardown = self.teardown();

        self.set_state(DeviceState::Stopped);
        tracing::debug!(host_name = ?record.host_name, "NIC stopping");

        Ok(RunConfig {
            network_interface: vec![RunConfigItem::new(
                "link",
                record.host_name.unwrap_or_default(),
            )],
            post_hooks: vec![Box::new(move || teardown.run())],
        })
    }

    fn state(&self) -> DeviceState {
        *self.state.lock()
    }
}

/// Host-side teardown detached from the driver so it can run as a post hook.
struct Teardown {
    id: DeviceId,
    key: ParentKey,
    host: Arc<dyn HostNetwork>,
    ledger: Arc<HostResourceLedger>,
    volatile: Arc<dyn VolatileStore>,
    state: Arc<Mutex<DeviceState>>,
}

impl Teardown {
    fn run(self) -> HostnicResult<()> {
        let clear = ClearOnExit {
            id: &self.id,
            volatile: self.volatile.as_ref(),
        };

        let mut errors = match self.volatile.get(&self.id) {
            Ok(map) => self.remove(&VolatileRecord::from_map(&map)),
            Err(e) => vec![e],
        };

        if let Err(e) = clear.finish() {
            errors.push(e);
        }
        *self.state.lock() = DeviceState::Idle;

        if errors.is_empty() {
            tracing::info!(device = %self.id, "NIC torn down");
            Ok(())
        } else {
            tracing::warn!(device = %self.id, failed = errors.len(), "NIC teardown incomplete");
            Err(HostnicError::Teardown { errors })
        }
    }

    fn remove(&self, record: &VolatileRecord) -> Vec<HostnicError> {
        let mut errors = Vec::new();

        let Some(host_name) = &record.host_name else {
            if record.is_partial() {
                tracing::warn!(device = %self.id, "Partial volatile record, clearing it");
            }
            return errors;
        };

        let mut ledger = match self.ledger.lock() {
            Ok(ledger) => ledger,
            Err(e) => {
                errors.push(e);
                return errors;
            }
        };

        if self.host.interface_exists(host_name) {
            if let Err(e) = self.host.delete_interface(host_name) {
                errors.push(e);
            }
        }

        if let Err(e) = ledger.release_and_remove(&self.key, self.host.as_ref()) {
            errors.push(e);
        }

        errors
    }
}

/// Clears a device's volatile record on every exit path.
struct ClearOnExit<'a> {
    id: &'a DeviceId,
    volatile: &'a dyn VolatileStore,
}

impl ClearOnExit<'_> {
    fn clear(&self) -> HostnicResult<()> {
        self.volatile.set(self.id, VolatileRecord::cleared())
    }

    fn finish(self) -> HostnicResult<()> {
        let result = self.clear();
        std::mem::forget(self);
        result
    }
}

impl Drop for ClearOnExit<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            tracing::warn!(device = %self.id, error = %e, "Failed to clear volatile record");
        }
    }
}
