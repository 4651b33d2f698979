//! Per-device volatile state.
//!
//! A flat string map per device that outlives the process, used to carry
//! start-time decisions over to teardown.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use hostnic_common::{DeviceId, HostnicError, HostnicPaths, HostnicResult};
use parking_lot::Mutex;

/// Raw volatile record.
pub type VolatileMap = BTreeMap<String, String>;

/// Host-side interface name created at start.
pub const HOST_NAME: &str = "host_name";
/// Whether this start created the shared parent device.
pub const LAST_STATE_CREATED: &str = "last_state.created";
/// Hardware address applied at start.
pub const LAST_STATE_HWADDR: &str = "last_state.hwaddr";
/// MTU applied at start.
pub const LAST_STATE_MTU: &str = "last_state.mtu";

/// Durable key/value scratch space, one record per device.
///
/// `set` merges into the existing record; an empty value removes its key
/// and a record left with no keys is removed entirely.
pub trait VolatileStore: Send + Sync {
    /// Read a device's record. Absent records read as empty.
    fn get(&self, id: &DeviceId) -> HostnicResult<VolatileMap>;

    /// Merge `changes` into a device's record atomically.
    fn set(&self, id: &DeviceId, changes: VolatileMap) -> HostnicResult<()>;
}

/// Serialize `value` to `path` through a renamed sibling so readers never
/// observe a torn file.
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> HostnicResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn merge(record: &mut VolatileMap, changes: VolatileMap) {
    for (key, value) in changes {
        if value.is_empty() {
            record.remove(&key);
        } else {
            record.insert(key, value);
        }
    }
}

/// Typed view of the keys a NIC driver records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolatileRecord {
    /// Host-side interface name.
    pub host_name: Option<String>,
    /// Whether the parent device was created by this start.
    pub created: bool,
    /// Applied hardware address.
    pub hwaddr: Option<String>,
    /// Applied MTU.
    pub mtu: Option<String>,
}

impl VolatileRecord {
    /// Parse a raw record.
    #[must_use]
    pub fn from_map(map: &VolatileMap) -> Self {
        let text = |key: &str| map.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            host_name: text(HOST_NAME),
            created: map
                .get(LAST_STATE_CREATED)
                .is_some_and(|v| matches!(v.as_str(), "true" | "1" | "yes" | "on")),
            hwaddr: text(LAST_STATE_HWADDR),
            mtu: text(LAST_STATE_MTU),
        }
    }

    /// Render as a raw record, omitting unset keys.
    #[must_use]
    pub fn to_map(&self) -> VolatileMap {
        let mut map = VolatileMap::new();
        if let Some(name) = &self.host_name {
            map.insert(HOST_NAME.to_string(), name.clone());
        }
        map.insert(LAST_STATE_CREATED.to_string(), self.created.to_string());
        if let Some(hwaddr) = &self.hwaddr {
            map.insert(LAST_STATE_HWADDR.to_string(), hwaddr.clone());
        }
        if let Some(mtu) = &self.mtu {
            map.insert(LAST_STATE_MTU.to_string(), mtu.clone());
        }
        map
    }

    /// Changes that remove every key this record type owns.
    #[must_use]
    pub fn cleared() -> VolatileMap {
        [HOST_NAME, LAST_STATE_CREATED, LAST_STATE_HWADDR, LAST_STATE_MTU]
            .into_iter()
            .map(|key| (key.to_string(), String::new()))
            .collect()
    }

    /// No attachment is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Some keys are present but the host interface name is not.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.is_empty() && self.host_name.is_none()
    }
}

/// [`VolatileStore`] persisting one JSON file per device.
#[derive(Debug, Clone)]
pub struct FileVolatileStore {
    paths: HostnicPaths,
}

impl FileVolatileStore {
    /// Create a store rooted at `paths`.
    #[must_use]
    pub const fn new(paths: HostnicPaths) -> Self {
        Self { paths }
    }
}

impl VolatileStore for FileVolatileStore {
    fn get(&self, id: &DeviceId) -> HostnicResult<VolatileMap> {
        let path = self.paths.volatile_record(id);

        match std::fs::read_to_string(&path) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VolatileMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, id: &DeviceId, changes: VolatileMap) -> HostnicResult<()> {
        let path = self.paths.volatile_record(id);
        let mut record = self.get(id)?;
        merge(&mut record, changes);

        if record.is_empty() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(device = %id, "Cleared volatile record");
            return Ok(());
        }

        write_json_atomic(&path, &record)?;

        tracing::debug!(device = %id, path = %path.display(), "Saved volatile record");
        Ok(())
    }
}

/// [`VolatileStore`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryVolatileStore {
    records: Mutex<HashMap<DeviceId, VolatileMap>>,
    read_only: AtomicBool,
}

impl MemoryVolatileStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of devices with a record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no device has a record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Make every `set` fail until switched back.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}

impl VolatileStore for MemoryVolatileStore {
    fn get(&self, id: &DeviceId) -> HostnicResult<VolatileMap> {
        Ok(self.records.lock().get(id).cloned().unwrap_or_default())
    }

    fn set(&self, id: &DeviceId, changes: VolatileMap) -> HostnicResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(HostnicError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("volatile store is read-only, cannot update {id}"),
            )));
        }

        let mut records = self.records.lock();
        let record = records.entry(id.clone()).or_default();
        merge(record, changes);
        if record.is_empty() {
            records.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn device() -> DeviceId {
        DeviceId::new("web1", "eth0").unwrap()
    }

    fn attached() -> VolatileRecord {
        VolatileRecord {
            host_name: Some("mac1a2b3c4d".to_string()),
            created: true,
            hwaddr: None,
            mtu: Some("9000".to_string()),
        }
    }

    #[test]
    fn record_round_trip() {
        let record = attached();
        let map = record.to_map();
        assert_eq!(map.get(LAST_STATE_CREATED).unwrap(), "true");
        assert!(!map.contains_key(LAST_STATE_HWADDR));
        assert_eq!(VolatileRecord::from_map(&map), record);
    }

    #[test]
    fn partial_record_detection() {
        assert!(VolatileRecord::default().is_empty());
        assert!(!attached().is_partial());

        let mut map = VolatileMap::new();
        map.insert(LAST_STATE_CREATED.to_string(), "true".to_string());
        assert!(VolatileRecord::from_map(&map).is_partial());
    }

    #[test]
    fn file_store_set_and_clear() {
        let temp = tempdir().unwrap();
        let paths = HostnicPaths::with_root(temp.path());
        let store = FileVolatileStore::new(paths.clone());
        let id = device();

        assert!(store.get(&id).unwrap().is_empty());

        store.set(&id, attached().to_map()).unwrap();
        assert!(paths.volatile_record(&id).exists());
        assert_eq!(VolatileRecord::from_map(&store.get(&id).unwrap()), attached());

        store.set(&id, VolatileRecord::cleared()).unwrap();
        assert!(!paths.volatile_record(&id).exists());
        assert!(store.get(&id).unwrap().is_empty());
    }

    #[test]
    fn set_merges_and_empty_values_delete() {
        let store = MemoryVolatileStore::new();
        let id = device();

        store.set(&id, attached().to_map()).unwrap();
        let mut changes = VolatileMap::new();
        changes.insert(LAST_STATE_MTU.to_string(), String::new());
        changes.insert("other".to_string(), "kept".to_string());
        store.set(&id, changes).unwrap();

        let map = store.get(&id).unwrap();
        assert!(!map.contains_key(LAST_STATE_MTU));
        assert_eq!(map.get("other").unwrap(), "kept");
        assert_eq!(map.get(HOST_NAME).unwrap(), "mac1a2b3c4d");

        store.set(&id, VolatileRecord::cleared()).unwrap();
        assert_eq!(store.len(), 1);
    }
}
