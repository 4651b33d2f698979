//! CLI configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hostnic_common::{HostnicError, HostnicPaths, HostnicResult};
use hostnic_network::{
    DeviceConfig, FakeHost, FileVolatileStore, HostResourceLedger, IpHost, MemoryVolatileStore,
    NetworkContext,
};

/// Options shared by every command.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Paths for persistent data.
    pub paths: HostnicPaths,
    /// Run against an in-memory host instead of the real one.
    pub dry_run: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            paths: HostnicPaths::new(),
            dry_run: false,
        }
    }
}

impl CliConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = HostnicPaths::with_root(root);
        self
    }

    /// Enable dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Build the driver collaborators for `config`.
    ///
    /// In dry-run mode the host only knows the configured parent, and the
    /// ledger and volatile state live in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted ledger cannot be opened.
    pub fn context(&self, config: &DeviceConfig) -> HostnicResult<NetworkContext> {
        if self.dry_run {
            let host = FakeHost::new();
            if let Some(parent) = config.parent() {
                host.add_physical(parent);
            }
            return Ok(NetworkContext {
                host: Arc::new(host),
                ledger: Arc::new(HostResourceLedger::in_memory()),
                volatile: Arc::new(MemoryVolatileStore::new()),
            });
        }

        self.paths.create_dirs()?;
        Ok(NetworkContext {
            host: Arc::new(IpHost::new()),
            ledger: Arc::new(HostResourceLedger::open(self.paths.ledger())?),
            volatile: Arc::new(FileVolatileStore::new(self.paths.clone())),
        })
    }
}

/// Assemble a device config from an optional TOML file and `key=value` overrides.
///
/// TOML values may be strings, integers or booleans.
///
/// # Errors
///
/// Returns a config error for unreadable files, non-scalar values or
/// malformed overrides.
pub fn load_device_config(file: Option<&Path>, overrides: &[String]) -> HostnicResult<DeviceConfig> {
    let mut config = DeviceConfig::new().with("type", "nic").with("nictype", "macvlan");

    if let Some(path) = file {
        let text = std::fs::read_to_string(path)?;
        let table: toml::Table = toml::from_str(&text).map_err(|e| HostnicError::Config {
            message: format!("Failed to parse {}: {e}", path.display()),
        })?;

        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(HostnicError::InvalidField {
                        field: key,
                        value: other.to_string(),
                        reason: "Expected a string, integer or boolean".to_string(),
                    });
                }
            };
            config.set(key, value);
        }
    }

    for pair in overrides {
        let (key, value) = pair.split_once('=').ok_or_else(|| HostnicError::Config {
            message: format!("Expected key=value, got {pair:?}"),
        })?;
        config.set(key.trim(), value.trim());
    }

    Ok(config)
}
