//! Integration tests for the MACVLAN/MACVTAP NIC lifecycle.

use std::sync::Arc;

use hostnic_common::{DeviceId, HostnicError, HostnicPaths, InstanceRef};
use hostnic_network::fake::FakeKind;
use hostnic_network::{
    DeviceConfig, FakeHost, FileVolatileStore, HostNetwork, HostOp, HostResourceLedger, LinkKind,
    MacvlanNic, MemoryVolatileStore, NetworkContext, NetworkDevice, ParentKey, VolatileStore,
};

struct Harness {
    host: Arc<FakeHost>,
    ledger: Arc<HostResourceLedger>,
    volatile: Arc<MemoryVolatileStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            host: Arc::new(FakeHost::with_physical(&["eth0"])),
            ledger: Arc::new(HostResourceLedger::in_memory()),
            volatile: Arc::new(MemoryVolatileStore::new()),
        }
    }

    fn ctx(&self) -> NetworkContext {
        NetworkContext {
            host: self.host.clone(),
            ledger: self.ledger.clone(),
            volatile: self.volatile.clone(),
        }
    }

    fn nic(&self, instance: InstanceRef, config: DeviceConfig) -> MacvlanNic {
        MacvlanNic::new(instance, "eth1", config, self.ctx()).unwrap()
    }
}

fn base_config() -> DeviceConfig {
    DeviceConfig::new()
        .with("type", "nic")
        .with("nictype", "macvlan")
        .with("parent", "eth0")
        .with("name", "eth1")
}

fn vlan_key() -> ParentKey {
    ParentKey::new("eth0", Some(100))
}

fn stop_and_teardown(nic: &MacvlanNic) -> Result<(), HostnicError> {
    let mut run = nic.stop()?;
    run.run_post_hooks()
}

#[test_log::test]
fn failed_start_leaves_host_untouched() {
    let config = base_config()
        .with("vlan", "100")
        .with("hwaddr", "00:16:3e:12:34:56")
        .with("mtu", "9000");

    for op in [
        HostOp::CreateVlan,
        HostOp::CreateMacvlan,
        HostOp::SetAddress,
        HostOp::SetMtu,
        HostOp::SetUp,
    ] {
        let harness = Harness::new();
        let before = harness.host.interfaces();
        harness.host.fail_on(op);

        let nic = harness.nic(InstanceRef::virtual_machine("vm1"), config.clone());
        let err = nic.start().unwrap_err();

        assert!(err.is_provisioning(), "{op:?}: {err}");
        assert_eq!(harness.host.interfaces(), before, "{op:?} left interfaces");
        assert!(harness.ledger.snapshot().is_empty(), "{op:?} left a ledger entry");
        assert!(harness.volatile.is_empty(), "{op:?} left volatile state");
    }
}

#[test]
fn failed_start_keeps_other_users_reference() {
    let harness = Harness::new();
    let config = base_config().with("vlan", "100");

    let first = harness.nic(InstanceRef::container("c1"), config.clone());
    first.start().unwrap();

    harness.host.fail_on(HostOp::CreateMacvlan);
    let second = harness.nic(InstanceRef::container("c2"), config);
    assert!(second.start().is_err());

    assert_eq!(harness.ledger.refs(&vlan_key()), 1);
    assert!(harness.host.interface_exists("eth0.100"));
}

#[test]
fn failed_volatile_write_rolls_back_start() {
    let harness = Harness::new();
    let before = harness.host.interfaces();
    harness.volatile.set_read_only(true);

    let nic = harness.nic(
        InstanceRef::container("c1"),
        base_config().with("vlan", "100"),
    );
    let err = nic.start().unwrap_err();

    assert!(err.is_provisioning(), "{err}");
    assert!(err.to_string().starts_with("Failed to record volatile state: "), "{err}");
    assert_eq!(harness.host.interfaces(), before);
    assert!(harness.ledger.snapshot().is_empty());
    assert!(harness.volatile.is_empty());

    harness.volatile.set_read_only(false);
    nic.start().unwrap();
    assert_eq!(harness.ledger.refs(&vlan_key()), 1);
}

#[test]
fn error_names_the_failing_step() {
    let harness = Harness::new();
    harness.host.fail_on(HostOp::SetMtu);

    let nic = harness.nic(
        InstanceRef::container("c1"),
        base_config().with("mtu", "1500"),
    );
    let err = nic.start().unwrap_err();
    assert!(err.to_string().starts_with("Failed to set the MTU: "), "{err}");
}

#[test_log::test]
fn concurrent_starts_share_one_parent() {
    const N: usize = 8;
    let harness = Harness::new();

    let nics: Vec<MacvlanNic> = (0..N)
        .map(|i| {
            harness.nic(
                InstanceRef::container(format!("c{i}")),
                base_config().with("vlan", "100"),
            )
        })
        .collect();

    std::thread::scope(|scope| {
        for nic in &nics {
            scope.spawn(move || nic.start().unwrap());
        }
    });

    assert_eq!(harness.host.calls(HostOp::CreateVlan), 1);
    assert_eq!(harness.ledger.refs(&vlan_key()), N as u32);

    let created: usize = nics
        .iter()
        .map(|nic| harness.volatile.get(nic.id()).unwrap())
        .filter(|record| record.get("last_state.created").map(String::as_str) == Some("true"))
        .count();
    assert_eq!(created, 1);

    let (last, rest) = nics.split_last().unwrap();
    std::thread::scope(|scope| {
        for nic in rest {
            scope.spawn(move || stop_and_teardown(nic).unwrap());
        }
    });

    assert!(harness.host.interface_exists("eth0.100"));
    assert_eq!(harness.ledger.refs(&vlan_key()), 1);

    stop_and_teardown(last).unwrap();
    assert!(!harness.host.interface_exists("eth0.100"));
    assert_eq!(harness.host.calls(HostOp::DeleteInterface), N + 1);
    assert!(harness.ledger.snapshot().is_empty());
}

#[test]
fn pre_existing_vlan_parent_is_kept() {
    let harness = Harness::new();
    harness.host.add_vlan("eth0", "eth0.100", 100);

    let nic = harness.nic(
        InstanceRef::container("c1"),
        base_config().with("vlan", "100"),
    );
    nic.start().unwrap();
    stop_and_teardown(&nic).unwrap();

    assert!(harness.host.interface_exists("eth0.100"));
    assert_eq!(harness.host.calls(HostOp::CreateVlan), 0);
}

#[test]
fn teardown_tolerates_missing_interface() {
    let harness = Harness::new();
    let nic = harness.nic(InstanceRef::container("c1"), base_config());
    let link = nic.start().unwrap().get("link").unwrap().to_string();

    harness.host.remove(&link);
    stop_and_teardown(&nic).unwrap();

    assert!(harness.volatile.is_empty());
    assert_eq!(harness.host.calls(HostOp::DeleteInterface), 0);
}

#[test]
fn teardown_errors_are_aggregated_and_state_is_cleared() {
    let harness = Harness::new();
    let nic = harness.nic(
        InstanceRef::container("c1"),
        base_config().with("vlan", "100"),
    );
    nic.start().unwrap();

    harness.host.fail_on(HostOp::DeleteInterface);
    let err = stop_and_teardown(&nic).unwrap_err();

    match err {
        HostnicError::Teardown { errors } => assert_eq!(errors.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(harness.volatile.is_empty());
    assert!(harness.ledger.snapshot().is_empty());
}

#[test]
fn unknown_option_is_rejected_before_host_access() {
    let harness = Harness::new();
    let nic = harness.nic(
        InstanceRef::container("c1"),
        base_config().with("security.mac_filtering", "true"),
    );

    let err = nic.validate_config().unwrap_err();
    assert!(matches!(&err, HostnicError::UnknownField { field } if field == "security.mac_filtering"));
    assert!(nic.start().unwrap_err().is_config());
    assert!(harness.host.log().is_empty());
}

#[test]
fn container_uses_macvlan_and_requires_name() {
    let harness = Harness::new();

    let unnamed = harness.nic(
        InstanceRef::container("c1"),
        base_config().with("name", ""),
    );
    assert!(unnamed.validate_environment().unwrap_err().is_environment());

    let nic = harness.nic(InstanceRef::container("c2"), base_config());
    let link = nic.start().unwrap().get("link").unwrap().to_string();

    let iface = harness.host.interface(&link).unwrap();
    assert_eq!(iface.kind, FakeKind::Link(LinkKind::Macvlan));
    assert!(!iface.up);
    assert_eq!(harness.host.calls(HostOp::SetUp), 0);
}

#[test]
fn vm_uses_macvtap_without_name() {
    let harness = Harness::new();
    let nic = harness.nic(
        InstanceRef::virtual_machine("vm1"),
        base_config().with("name", ""),
    );

    nic.validate_environment().unwrap();
    let run = nic.start().unwrap();
    let link = run.get("link").unwrap();

    let iface = harness.host.interface(link).unwrap();
    assert_eq!(iface.kind, FakeKind::Link(LinkKind::Macvtap));
    assert!(iface.up);
    assert_eq!(run.get("hwaddr"), Some(""));
}

#[test]
fn missing_parent_is_an_environment_error() {
    let harness = Harness::new();
    let nic = harness.nic(
        InstanceRef::container("c1"),
        base_config().with("parent", "eth7"),
    );
    assert!(nic.start().unwrap_err().is_environment());
}

#[test]
fn round_trip_restores_host() {
    let harness = Harness::new();
    let before = harness.host.interfaces();

    let nic = harness.nic(
        InstanceRef::virtual_machine("vm1"),
        base_config()
            .with("vlan", "100")
            .with("mtu", "9000")
            .with("hwaddr", "00:16:3e:12:34:56"),
    );
    nic.start().unwrap();
    let record = harness.volatile.get(nic.id()).unwrap();
    assert_eq!(record.get("last_state.mtu").map(String::as_str), Some("9000"));

    stop_and_teardown(&nic).unwrap();

    assert_eq!(harness.host.interfaces(), before);
    assert!(harness.ledger.snapshot().is_empty());
    assert!(harness.volatile.is_empty());

    // A torn-down device can be started again.
    nic.start().unwrap();
}

#[test]
fn persisted_state_survives_restart() {
    let temp = tempfile::tempdir().unwrap();
    let paths = HostnicPaths::with_root(temp.path());
    let host = Arc::new(FakeHost::with_physical(&["eth0"]));
    let config = base_config().with("vlan", "100");

    let ctx = || NetworkContext {
        host: host.clone(),
        ledger: Arc::new(HostResourceLedger::open(paths.ledger()).unwrap()),
        volatile: Arc::new(FileVolatileStore::new(paths.clone())),
    };

    let started = MacvlanNic::new(InstanceRef::container("c1"), "eth1", config.clone(), ctx())
        .unwrap();
    started.start().unwrap();
    drop(started);

    let restarted =
        MacvlanNic::new(InstanceRef::container("c1"), "eth1", config, ctx()).unwrap();
    stop_and_teardown(&restarted).unwrap();

    let id = DeviceId::new("c1", "eth1").unwrap();
    assert!(!paths.volatile_record(&id).exists());
    assert_eq!(host.interfaces(), vec!["eth0".to_string()]);
}
