//! # hostnic-common
//!
//! Shared utilities and types for hostnic.
//!
//! This crate provides common functionality used across all hostnic crates:
//! - Instance and device identifiers
//! - Random host interface names
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{HostnicError, HostnicResult};
pub use id::{
    DeviceId, InstanceKind, InstanceRef, MAX_INTERFACE_NAME, random_interface_name,
    validate_interface_name,
};
pub use paths::HostnicPaths;
