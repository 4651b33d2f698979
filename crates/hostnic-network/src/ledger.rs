//! Reference-counted ledger of shared parent devices.
//!
//! Several NICs may hang off the same parent, and VLAN parents are created on
//! demand by the first NIC that needs them. The ledger counts dependents per
//! parent and remembers whether hostnic created it, so the parent is removed
//! exactly once, by whoever drops the last reference, and only if hostnic
//! created it in the first place.
//!
//! All access goes through [`LedgerLock`]. Holding it serializes every
//! start and teardown that touches a shared parent host-wide.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use hostnic_common::{HostnicError, HostnicResult};
use parking_lot::{Mutex, MutexGuard};
use rustix::fs::{FlockOperation, flock};
use serde::{Deserialize, Serialize};

use crate::host::{HostNetwork, host_device_name};
use crate::volatile::write_json_atomic;

/// Identity of a shared parent device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParentKey {
    /// The configured parent interface.
    pub parent: String,
    /// VLAN tag layered on the parent, if any.
    pub vlan: Option<u16>,
}

impl ParentKey {
    /// Create a key.
    #[must_use]
    pub fn new(parent: impl Into<String>, vlan: Option<u16>) -> Self {
        Self {
            parent: parent.into(),
            vlan,
        }
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vlan {
            Some(vlan) => write!(f, "{} (vlan {vlan})", self.parent),
            None => write!(f, "{}", self.parent),
        }
    }
}

/// One tracked parent device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Which parent this is.
    pub key: ParentKey,
    /// Host device NICs are linked to.
    pub device: String,
    /// Active dependents.
    pub refs: u32,
    /// Whether hostnic created the device.
    pub created: bool,
}

/// Outcome of [`LedgerLock::acquire_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    /// Host device to link to.
    pub device: String,
    /// The device was already on the host before this call.
    pub existed: bool,
}

/// Outcome of [`LedgerLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// Host device the reference was held on.
    pub device: String,
    /// The caller must now delete the device.
    pub should_delete: bool,
}

/// Host-wide ledger of shared parent devices.
#[derive(Debug)]
pub struct HostResourceLedger {
    entries: Mutex<BTreeMap<ParentKey, LedgerEntry>>,
    path: Option<PathBuf>,
}

impl HostResourceLedger {
    /// Create a ledger that lives only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Open a ledger persisted at `path`, loading existing entries.
    ///
    /// Entries are re-read from disk each time the lock is taken, so
    /// several processes may share one file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> HostnicResult<Self> {
        let path = path.into();
        let entries = load_entries(&path)?;

        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened ledger");

        Ok(Self {
            entries: Mutex::new(entries),
            path: Some(path),
        })
    }

    /// Take the ledger lock.
    ///
    /// For a persisted ledger this also takes an exclusive `flock` on a
    /// sibling `.lock` file and reloads the entries, serializing every
    /// process that opened the same path.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be locked or the ledger
    /// cannot be reloaded.
    pub fn lock(&self) -> HostnicResult<LedgerLock<'_>> {
        let mut entries = self.entries.lock();

        let file = match &self.path {
            Some(path) => {
                let file = FileLock::exclusive(&lock_path(path))?;
                *entries = load_entries(path)?;
                Some(file)
            }
            None => None,
        };

        Ok(LedgerLock {
            entries,
            path: self.path.as_deref(),
            _file: file,
        })
    }

    /// Copy of all entries as of the last time the lock was held.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Reference count for `key` as of the last time the lock was held.
    #[must_use]
    pub fn refs(&self, key: &ParentKey) -> u32 {
        self.entries.lock().get(key).map_or(0, |entry| entry.refs)
    }
}

fn lock_path(path: &Path) -> PathBuf {
    path.with_extension("lock")
}

fn load_entries(path: &Path) -> HostnicResult<BTreeMap<ParentKey, LedgerEntry>> {
    match std::fs::read_to_string(path) {
        Ok(json) => Ok(serde_json::from_str::<Vec<LedgerEntry>>(&json)?
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Exclusive `flock` held until drop.
///
/// The ledger file itself is replaced by rename on every write, so the lock
/// lives on a separate file whose inode never changes.
#[derive(Debug)]
struct FileLock {
    _file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> HostnicResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        flock(&file, FlockOperation::LockExclusive).map_err(std::io::Error::from)?;

        tracing::trace!(path = %path.display(), "Ledger file locked");
        Ok(Self { _file: file })
    }
}

/// Exclusive access to the ledger.
pub struct LedgerLock<'a> {
    entries: MutexGuard<'a, BTreeMap<ParentKey, LedgerEntry>>,
    path: Option<&'a Path>,
    _file: Option<FileLock>,
}

impl fmt::Debug for LedgerLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerLock")
            .field("entries", &*self.entries)
            .finish_non_exhaustive()
    }
}

impl LedgerLock<'_> {
    /// Take a reference on the parent for `key`, creating its VLAN device if
    /// it is not on the host yet.
    ///
    /// # Errors
    ///
    /// Returns an environment error if a plain parent is missing, or the
    /// host error if VLAN creation fails. Nothing is recorded on error.
    pub fn acquire_or_create(
        &mut self,
        key: &ParentKey,
        host: &dyn HostNetwork,
    ) -> HostnicResult<Acquired> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.refs += 1;
            let acquired = Acquired {
                device: entry.device.clone(),
                existed: true,
            };
            tracing::debug!(parent = %key, refs = entry.refs, "Parent reference taken");

            if let Err(e) = self.persist() {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.refs -= 1;
                }
                return Err(e);
            }
            return Ok(acquired);
        }

        let device = host_device_name(host, &key.parent, key.vlan);
        let created = if host.interface_exists(&device) {
            false
        } else if let Some(vlan) = key.vlan {
            host.create_vlan(&key.parent, &device, vlan)?;
            true
        } else {
            return Err(HostnicError::Environment {
                message: format!("Parent device '{}' doesn't exist", key.parent),
            });
        };

        self.entries.insert(
            key.clone(),
            LedgerEntry {
                key: key.clone(),
                device: device.clone(),
                refs: 1,
                created,
            },
        );

        if let Err(e) = self.persist() {
            self.entries.remove(key);
            if created {
                if let Err(cleanup) = host.delete_interface(&device) {
                    tracing::warn!(%device, error = %cleanup, "Failed to remove parent after ledger write failure");
                }
            }
            return Err(e);
        }

        tracing::info!(parent = %key, %device, created, "Parent reference taken");
        Ok(Acquired {
            device,
            existed: !created,
        })
    }

    /// Drop a reference on the parent for `key`.
    ///
    /// # Errors
    ///
    /// Releasing a key that holds no references breaks the ledger's
    /// contract and is reported as an internal error.
    pub fn release(&mut self, key: &ParentKey) -> HostnicResult<Released> {
        let Some(entry) = self.entries.get_mut(key) else {
            tracing::error!(parent = %key, "Released a parent with no references");
            return Err(HostnicError::Internal {
                message: format!("Ledger reference count for parent {key} would go negative"),
            });
        };

        let before = entry.clone();
        entry.refs -= 1;
        let released = Released {
            device: entry.device.clone(),
            should_delete: entry.refs == 0 && entry.created,
        };

        if entry.refs == 0 {
            self.entries.remove(key);
        }

        if let Err(e) = self.persist() {
            self.entries.insert(key.clone(), before);
            return Err(e);
        }

        tracing::debug!(parent = %key, should_delete = released.should_delete, "Parent reference released");
        Ok(released)
    }

    /// Release `key` and delete the parent device if this was the last
    /// reference to a device hostnic created.
    ///
    /// # Errors
    ///
    /// Returns the ledger or host error. The reference is dropped even if
    /// deletion fails.
    pub fn release_and_remove(
        &mut self,
        key: &ParentKey,
        host: &dyn HostNetwork,
    ) -> HostnicResult<()> {
        let released = self.release(key)?;

        if released.should_delete && host.interface_exists(&released.device) {
            host.delete_interface(&released.device)?;
            tracing::info!(parent = %key, device = %released.device, "Parent device removed");
        }

        Ok(())
    }

    /// Entry for `key`, if referenced.
    #[must_use]
    pub fn entry(&self, key: &ParentKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    fn persist(&self) -> HostnicResult<()> {
        match self.path {
            Some(path) => {
                let entries: Vec<&LedgerEntry> = self.entries.values().collect();
                write_json_atomic(path, &entries)
            }
            None => Ok(()),
        }
    }
}
