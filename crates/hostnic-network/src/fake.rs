//! In-memory host for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use hostnic_common::{HostnicError, HostnicResult};
use parking_lot::Mutex;

use crate::host::{HostNetwork, LinkKind};

/// A mutating operation on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    /// VLAN sub-interface creation.
    CreateVlan,
    /// MACVLAN/MACVTAP creation.
    CreateMacvlan,
    /// Hardware address change.
    SetAddress,
    /// MTU change.
    SetMtu,
    /// Link activation.
    SetUp,
    /// Interface deletion.
    DeleteInterface,
}

/// What kind of interface a [`FakeInterface`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeKind {
    /// Pre-existing physical NIC.
    Physical,
    /// VLAN sub-interface with the given tag.
    Vlan(u16),
    /// MACVLAN or MACVTAP link.
    Link(LinkKind),
}

/// State of one fake interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeInterface {
    /// Interface type.
    pub kind: FakeKind,
    /// Lower device, if any.
    pub parent: Option<String>,
    /// Hardware address set through [`HostNetwork::set_address`].
    pub hwaddr: Option<String>,
    /// MTU set through [`HostNetwork::set_mtu`].
    pub mtu: Option<u32>,
    /// Whether the link was brought up.
    pub up: bool,
}

impl FakeInterface {
    fn new(kind: FakeKind, parent: Option<&str>) -> Self {
        Self {
            kind,
            parent: parent.map(ToString::to_string),
            hwaddr: None,
            mtu: None,
            up: false,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    interfaces: BTreeMap<String, FakeInterface>,
    failures: HashSet<HostOp>,
    calls: HashMap<HostOp, usize>,
    log: Vec<(HostOp, String)>,
}

/// [`HostNetwork`] that keeps interfaces in memory.
///
/// Operations can be made to fail with [`FakeHost::fail_on`]; only
/// successful operations are logged and counted.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    /// Create an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host with the given physical NICs.
    #[must_use]
    pub fn with_physical(names: &[&str]) -> Self {
        let host = Self::new();
        for name in names {
            host.add_physical(name);
        }
        host
    }

    /// Add a pre-existing physical NIC.
    pub fn add_physical(&self, name: &str) {
        self.state
            .lock()
            .interfaces
            .insert(name.to_string(), FakeInterface::new(FakeKind::Physical, None));
    }

    /// Add a pre-existing VLAN sub-interface.
    pub fn add_vlan(&self, parent: &str, name: &str, vlan: u16) {
        self.state.lock().interfaces.insert(
            name.to_string(),
            FakeInterface::new(FakeKind::Vlan(vlan), Some(parent)),
        );
    }

    /// Remove an interface behind the driver's back.
    pub fn remove(&self, name: &str) {
        self.state.lock().interfaces.remove(name);
    }

    /// Make every future `op` fail.
    pub fn fail_on(&self, op: HostOp) {
        self.state.lock().failures.insert(op);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Names of all interfaces, sorted.
    #[must_use]
    pub fn interfaces(&self) -> Vec<String> {
        self.state.lock().interfaces.keys().cloned().collect()
    }

    /// Look up one interface.
    #[must_use]
    pub fn interface(&self, name: &str) -> Option<FakeInterface> {
        self.state.lock().interfaces.get(name).cloned()
    }

    /// How many times `op` succeeded.
    #[must_use]
    pub fn calls(&self, op: HostOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Successful operations in the order they ran.
    #[must_use]
    pub fn log(&self) -> Vec<(HostOp, String)> {
        self.state.lock().log.clone()
    }

    fn apply<F>(&self, op: HostOp, name: &str, f: F) -> HostnicResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, FakeInterface>) -> Result<(), String>,
    {
        let mut state = self.state.lock();

        if state.failures.contains(&op) {
            return Err(failure(op, name, "injected failure"));
        }

        f(&mut state.interfaces).map_err(|msg| failure(op, name, &msg))?;

        *state.calls.entry(op).or_default() += 1;
        state.log.push((op, name.to_string()));
        tracing::trace!(?op, name, "Fake host operation");
        Ok(())
    }

    fn modify<F>(&self, op: HostOp, name: &str, f: F) -> HostnicResult<()>
    where
        F: FnOnce(&mut FakeInterface),
    {
        self.apply(op, name, |interfaces| {
            let iface = interfaces
                .get_mut(name)
                .ok_or_else(|| "Cannot find device".to_string())?;
            f(iface);
            Ok(())
        })
    }

    fn create(
        &self,
        op: HostOp,
        name: &str,
        parent: &str,
        kind: FakeKind,
    ) -> HostnicResult<()> {
        self.apply(op, name, |interfaces| {
            if interfaces.contains_key(name) {
                return Err("File exists".to_string());
            }
            if !interfaces.contains_key(parent) {
                return Err(format!("Cannot find device \"{parent}\""));
            }
            interfaces.insert(name.to_string(), FakeInterface::new(kind, Some(parent)));
            Ok(())
        })
    }
}

fn failure(op: HostOp, name: &str, message: &str) -> HostnicError {
    HostnicError::Command {
        program: "fake".to_string(),
        args: vec![format!("{op:?}"), name.to_string()],
        stderr: message.to_string(),
    }
}

impl HostNetwork for FakeHost {
    fn interface_exists(&self, name: &str) -> bool {
        self.state.lock().interfaces.contains_key(name)
    }

    fn find_vlan_device(&self, parent: &str, vlan: u16) -> Option<String> {
        self.state
            .lock()
            .interfaces
            .iter()
            .find(|(_, iface)| {
                iface.kind == FakeKind::Vlan(vlan) && iface.parent.as_deref() == Some(parent)
            })
            .map(|(name, _)| name.clone())
    }

    fn create_vlan(&self, parent: &str, name: &str, vlan: u16) -> HostnicResult<()> {
        self.create(HostOp::CreateVlan, name, parent, FakeKind::Vlan(vlan))?;
        self.state.lock().interfaces.entry(name.to_string()).and_modify(|i| i.up = true);
        Ok(())
    }

    fn create_macvlan(&self, name: &str, parent: &str, kind: LinkKind) -> HostnicResult<()> {
        self.create(HostOp::CreateMacvlan, name, parent, FakeKind::Link(kind))
    }

    fn set_address(&self, name: &str, hwaddr: &str) -> HostnicResult<()> {
        self.modify(HostOp::SetAddress, name, |i| i.hwaddr = Some(hwaddr.to_string()))
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> HostnicResult<()> {
        self.modify(HostOp::SetMtu, name, |i| i.mtu = Some(mtu))
    }

    fn set_up(&self, name: &str) -> HostnicResult<()> {
        self.modify(HostOp::SetUp, name, |i| i.up = true)
    }

    fn delete_interface(&self, name: &str) -> HostnicResult<()> {
        self.apply(HostOp::DeleteInterface, name, |interfaces| {
            interfaces
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| "Cannot find device".to_string())
        })
    }
}
