//! Standard filesystem paths for hostnic.

use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::id::DeviceId;

/// Default root directory for hostnic data.
pub static HOSTNIC_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HOSTNIC_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/hostnic"))
});

/// Default runtime directory for hostnic.
pub static HOSTNIC_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HOSTNIC_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/hostnic"))
});

/// Standard paths used by hostnic.
#[derive(Debug, Clone)]
pub struct HostnicPaths {
    /// Root data directory (default: /var/lib/hostnic).
    pub root: PathBuf,
    /// Runtime directory (default: /run/hostnic).
    pub runtime: PathBuf,
}

impl HostnicPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Directory holding per-device volatile records.
    #[must_use]
    pub fn volatile(&self) -> PathBuf {
        self.root.join("volatile")
    }

    /// Volatile record file for one device.
    #[must_use]
    pub fn volatile_record(&self, id: &DeviceId) -> PathBuf {
        self.volatile()
            .join(id.instance())
            .join(format!("{}.json", id.device()))
    }

    /// Shared parent device ledger.
    ///
    /// Lives under the runtime directory: reference counts describe
    /// interfaces that do not survive a host reboot.
    #[must_use]
    pub fn ledger(&self) -> PathBuf {
        self.runtime.join("ledger.json")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.volatile())?;
        tracing::debug!(root = %self.root.display(), "Created hostnic directories");
        Ok(())
    }
}

impl Default for HostnicPaths {
    fn default() -> Self {
        Self {
            root: HOSTNIC_ROOT.clone(),
            runtime: HOSTNIC_RUNTIME_DIR.clone(),
        }
    }
}
