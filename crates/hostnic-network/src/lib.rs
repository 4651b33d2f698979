//! # hostnic-network
//!
//! Host-side network device lifecycle for containers and virtual machines.
//!
//! A device driver validates its config, provisions host interfaces inside a
//! rollback-capable [`Transaction`], shares parent devices through the
//! [`HostResourceLedger`] and records what it created in a [`VolatileStore`]
//! so a later stop can undo it.

#![warn(missing_docs)]

pub mod config;
pub mod device;
pub mod fake;
pub mod host;
pub mod ledger;
pub mod nic_macvlan;
pub mod transaction;
pub mod volatile;

pub use config::{DeviceConfig, NicValidator};
pub use device::{
    DeviceState, NetworkContext, NetworkDevice, PostHook, RunConfig, RunConfigItem, load,
};
pub use fake::{FakeHost, HostOp};
pub use host::{HostNetwork, IpHost, LinkKind};
pub use ledger::{HostResourceLedger, LedgerEntry, ParentKey};
pub use nic_macvlan::MacvlanNic;
pub use transaction::Transaction;
pub use volatile::{FileVolatileStore, MemoryVolatileStore, VolatileRecord, VolatileStore};
