//! Persistent key-value store.
//!
//! Every record that must survive deep sleep or power loss lives here, in
//! the [`STORE_NAMESPACE`] namespace. Each operation runs one
//! open → read/write → commit → close sequence against a [`Storage`]
//! backend. Writes are staged in the open handle and only become durable at
//! commit, so a power loss mid-operation leaves the previous value intact.
//!
//! Only [`MemoryStorage`] commits several keys atomically. [`FileStorage`]
//! survives a write error with every key old but renames key by key, and
//! `NvsStorage` commits key by key. Readers of multi-key records check that
//! the keys agree.
//!
//! # Backends
//!
//! - [`MemoryStorage`] - shared in-memory flash image (tests, simulation)
//! - [`FileStorage`] - checksummed files on the host filesystem
//! - `NvsStorage` - ESP32 Non-Volatile Storage (`esp32` feature)
//!
//! # Example
//!
//! ```
//! use sensor_node_fw::store::{MemoryStorage, PersistentStore};
//!
//! let mut store = PersistentStore::new(MemoryStorage::new());
//! assert_eq!(store.get("saved_wifi").unwrap(), None);
//! store.set("saved_wifi", b"\x03Lab").unwrap();
//! assert_eq!(store.get("saved_wifi").unwrap().as_deref(), Some(&b"\x03Lab"[..]));
//! ```

mod memory;
#[cfg(not(target_os = "espidf"))]
mod file;
#[cfg(feature = "esp32")]
mod nvs;

pub use memory::MemoryStorage;
#[cfg(not(target_os = "espidf"))]
pub use file::FileStorage;
#[cfg(feature = "esp32")]
pub use nvs::NvsStorage;

use crate::config::{
    KEY_CREDENTIALS, KEY_DUTY_CONFIG, KEY_PH, KEY_TEMPERATURES, STORE_NAMESPACE,
};
use crate::duty::SensorDutyConfig;
use crate::telemetry::Reading;
use crate::wifi::WirelessCredentials;
use log::{debug, error, info, warn};
use std::fmt;

/// Block-storage collaborator.
///
/// A handle scopes one open namespace. Blobs written through a handle are
/// visible to reads through the same handle immediately, and to everyone
/// else only after [`Storage::commit`].
pub trait Storage {
    type Handle;

    fn open(&mut self, namespace: &str) -> Result<Self::Handle, StorageError>;

    /// Read a blob. `Ok(None)` means the key has never been written.
    fn get_blob(&mut self, handle: &mut Self::Handle, key: &str)
        -> Result<Option<Vec<u8>>, StorageError>;

    fn set_blob(
        &mut self,
        handle: &mut Self::Handle,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError>;

    /// Make every staged write durable.
    fn commit(&mut self, handle: &mut Self::Handle) -> Result<(), StorageError>;

    /// Release the handle. Uncommitted writes are discarded.
    fn close(&mut self, handle: Self::Handle);
}

/// Errors reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Namespace could not be opened.
    Open(String),
    /// Low-level read failure.
    Read(String),
    /// Low-level write failure.
    Write(String),
    /// Commit did not complete.
    Commit(String),
    /// Stored data failed its integrity check.
    Corrupt(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(msg) => write!(f, "open failed: {}", msg),
            Self::Read(msg) => write!(f, "read failed: {}", msg),
            Self::Write(msg) => write!(f, "write failed: {}", msg),
            Self::Commit(msg) => write!(f, "commit failed: {}", msg),
            Self::Corrupt(msg) => write!(f, "corrupt entry: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Errors returned by [`PersistentStore`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend failed.
    Storage { key: String, source: StorageError },
    /// A stored record could not be decoded.
    Decode { key: String, reason: String },
}

impl StoreError {
    fn storage(key: &str, source: StorageError) -> Self {
        Self::Storage {
            key: key.to_string(),
            source,
        }
    }

    fn decode(key: &str, reason: impl fmt::Display) -> Self {
        Self::Decode {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage { key, source } => write!(f, "store error on '{}': {}", key, source),
            Self::Decode { key, reason } => write!(f, "cannot decode '{}': {}", key, reason),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source),
            Self::Decode { .. } => None,
        }
    }
}

/// An open namespace; closes on drop.
struct Session<'a, S: Storage> {
    storage: &'a mut S,
    handle: Option<S::Handle>,
}

impl<'a, S: Storage> Session<'a, S> {
    fn open(storage: &'a mut S, namespace: &str) -> Result<Self, StorageError> {
        let handle = storage.open(namespace)?;
        Ok(Self {
            storage,
            handle: Some(handle),
        })
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.handle.as_mut() {
            Some(handle) => self.storage.get_blob(handle, key),
            None => Err(StorageError::Read("session already closed".into())),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        match self.handle.as_mut() {
            Some(handle) => self.storage.set_blob(handle, key, value),
            None => Err(StorageError::Write("session already closed".into())),
        }
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        match self.handle.as_mut() {
            Some(handle) => self.storage.commit(handle),
            None => Err(StorageError::Commit("session already closed".into())),
        }
    }
}

impl<S: Storage> Drop for Session<'_, S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.storage.close(handle);
        }
    }
}

/// Persistent store for credentials, duty config and buffered readings.
pub struct PersistentStore<S: Storage> {
    storage: S,
    namespace: &'static str,
}

impl<S: Storage> PersistentStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            namespace: STORE_NAMESPACE,
        }
    }

    /// Read a key. `Ok(None)` means "not yet configured".
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut session = Session::open(&mut self.storage, self.namespace)
            .map_err(|e| StoreError::storage(key, e))?;
        session.get(key).map_err(|e| StoreError::storage(key, e))
    }

    /// Write and commit a key.
    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.set_many(&[(key, value)])
    }

    /// Write several keys and commit them together.
    ///
    /// Atomic only on [`MemoryStorage`]; the other backends commit key by key.
    pub fn set_many(&mut self, entries: &[(&str, &[u8])]) -> Result<(), StoreError> {
        let first_key = entries.first().map(|(k, _)| *k).unwrap_or_default();
        let mut session = Session::open(&mut self.storage, self.namespace)
            .map_err(|e| StoreError::storage(first_key, e))?;
        for (key, value) in entries {
            session
                .set(key, value)
                .map_err(|e| StoreError::storage(key, e))?;
        }
        session
            .commit()
            .map_err(|e| StoreError::storage(first_key, e))?;
        debug!("Committed {} key(s) starting at '{}'", entries.len(), first_key);
        Ok(())
    }

    /// Persist provisioned credentials.
    pub fn save_credentials(&mut self, credentials: &WirelessCredentials) -> Result<(), StoreError> {
        self.set(KEY_CREDENTIALS, &credentials.to_bytes())?;
        info!(
            "Credentials for {} saved",
            credentials.network_name_lossy()
        );
        Ok(())
    }

    /// Read persisted credentials, surfacing faults.
    pub fn try_load_credentials(&mut self) -> Result<Option<WirelessCredentials>, StoreError> {
        match self.get(KEY_CREDENTIALS)? {
            Some(bytes) => WirelessCredentials::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StoreError::decode(KEY_CREDENTIALS, e)),
            None => Ok(None),
        }
    }

    /// Read persisted credentials. Faults read as "not configured".
    pub fn load_credentials(&mut self) -> Option<WirelessCredentials> {
        match self.try_load_credentials() {
            Ok(Some(creds)) => Some(creds),
            Ok(None) => {
                info!("No saved credentials");
                None
            }
            Err(e) => {
                error!("Treating credentials as absent: {}", e);
                None
            }
        }
    }

    pub fn save_duty_config(&mut self, config: &SensorDutyConfig) -> Result<(), StoreError> {
        self.set(KEY_DUTY_CONFIG, &config.to_bytes())
    }

    /// Read the duty config, or `None` when absent or unreadable.
    pub fn load_duty_config(&mut self) -> Option<SensorDutyConfig> {
        let bytes = match self.get(KEY_DUTY_CONFIG) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No saved duty config");
                return None;
            }
            Err(e) => {
                warn!("Treating duty config as absent: {}", e);
                return None;
            }
        };
        match SensorDutyConfig::from_bytes(&bytes) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Stored duty config is unusable: {}", e);
                None
            }
        }
    }

    /// Persist buffered readings as paired temperature and pH arrays.
    pub fn save_readings(&mut self, readings: &[Reading]) -> Result<(), StoreError> {
        let temps: Vec<u8> = readings
            .iter()
            .flat_map(|r| r.temperature.to_le_bytes())
            .collect();
        let ph: Vec<u8> = readings.iter().flat_map(|r| r.ph.to_le_bytes()).collect();
        self.set_many(&[(KEY_TEMPERATURES, temps.as_slice()), (KEY_PH, ph.as_slice())])
    }

    /// Read buffered readings. Missing or mismatched arrays read as empty,
    /// which covers a save interrupted between its two keys.
    pub fn load_readings(&mut self) -> Vec<Reading> {
        let (temps, ph) = match (self.get(KEY_TEMPERATURES), self.get(KEY_PH)) {
            (Ok(Some(temps)), Ok(Some(ph))) => (temps, ph),
            (Ok(_), Ok(_)) => return Vec::new(),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Treating buffered readings as absent: {}", e);
                return Vec::new();
            }
        };
        if temps.len() % 4 != 0 || temps.len() != ph.len() {
            warn!(
                "Buffered reading arrays disagree ({} vs {} bytes), discarding",
                temps.len(),
                ph.len()
            );
            return Vec::new();
        }
        temps
            .chunks_exact(4)
            .zip(ph.chunks_exact(4))
            .map(|(t, p)| Reading {
                temperature: i32::from_le_bytes([t[0], t[1], t[2], t[3]]),
                ph: f32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (PersistentStore<MemoryStorage>, MemoryStorage) {
        let flash = MemoryStorage::new();
        (PersistentStore::new(flash.clone()), flash)
    }

    #[test]
    fn test_absent_key_is_not_an_error() {
        let (mut store, _) = store();
        assert_eq!(store.get("saved_wifi"), Ok(None));
    }

    #[test]
    fn test_set_then_get() {
        let (mut store, _) = store();
        store.set("k", b"value").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"value".to_vec()));
        store.set("k", b"other").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"other".to_vec()));
    }

    #[test]
    fn test_open_fault_is_reported() {
        let (mut store, flash) = store();
        flash.fail_next_open();
        assert!(matches!(
            store.get("k"),
            Err(StoreError::Storage {
                source: StorageError::Open(_),
                ..
            })
        ));
        // Next open works again.
        assert_eq!(store.get("k"), Ok(None));
    }

    #[test]
    fn test_commit_fault_keeps_previous_value() {
        let (mut store, flash) = store();
        store.set("k", b"old").unwrap();
        flash.fail_next_commit();
        assert!(store.set("k", b"new").is_err());
        assert_eq!(store.get("k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn test_failed_set_many_leaves_memory_unchanged() {
        let (mut store, flash) = store();
        flash.fail_next_commit();
        assert!(store
            .set_many(&[("a", b"1".as_slice()), ("b", b"2".as_slice())])
            .is_err());
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn test_sessions_are_closed() {
        let (mut store, flash) = store();
        store.set("k", b"v").unwrap();
        store.get("k").unwrap();
        flash.fail_next_commit();
        let _ = store.set("k", b"x");
        assert_eq!(flash.open_handles(), 0);
    }

    #[test]
    fn test_credentials_roundtrip() {
        let (mut store, _) = store();
        assert!(store.load_credentials().is_none());
        let creds = WirelessCredentials::new("Lab", "pass1234").unwrap();
        store.save_credentials(&creds).unwrap();
        assert_eq!(store.load_credentials(), Some(creds));
    }

    #[test]
    fn test_corrupt_credentials_read_as_absent() {
        let (mut store, _) = store();
        store.set(KEY_CREDENTIALS, &[40, 1, 2]).unwrap();
        assert!(matches!(
            store.try_load_credentials(),
            Err(StoreError::Decode { .. })
        ));
        assert!(store.load_credentials().is_none());
    }

    #[test]
    fn test_credentials_survive_power_loss() {
        let (mut store, flash) = store();
        let creds = WirelessCredentials::new("Lab", "pass1234").unwrap();
        store.save_credentials(&creds).unwrap();
        flash.power_loss();
        let mut rebooted = PersistentStore::new(flash);
        assert_eq!(rebooted.load_credentials(), Some(creds));
    }

    #[test]
    fn test_duty_config_roundtrip() {
        let (mut store, _) = store();
        assert!(store.load_duty_config().is_none());
        let mut duty = SensorDutyConfig::new(4, 2);
        duty.record_reading();
        store.save_duty_config(&duty).unwrap();
        assert_eq!(store.load_duty_config(), Some(duty));
    }

    #[test]
    fn test_readings_roundtrip() {
        let (mut store, _) = store();
        assert!(store.load_readings().is_empty());
        let readings = vec![
            Reading {
                temperature: 30,
                ph: 7.0,
            },
            Reading {
                temperature: -4,
                ph: 6.5,
            },
        ];
        store.save_readings(&readings).unwrap();
        assert_eq!(store.load_readings(), readings);
        assert_eq!(store.get(KEY_TEMPERATURES).unwrap().unwrap().len(), 8);
    }

    #[test]
    fn test_mismatched_reading_arrays_discarded() {
        let (mut store, _) = store();
        store.set(KEY_TEMPERATURES, &[0u8; 8]).unwrap();
        store.set(KEY_PH, &[0u8; 4]).unwrap();
        assert!(store.load_readings().is_empty());
    }

    #[test]
    fn test_readings_saved_half_way_are_discarded() {
        let (mut store, _) = store();
        let reading = Reading {
            temperature: 30,
            ph: 7.0,
        };
        store.save_readings(&[reading, reading]).unwrap();

        // A key-by-key commit that lost power after the temperatures landed.
        let temps: Vec<u8> = [reading; 3]
            .iter()
            .flat_map(|r| r.temperature.to_le_bytes())
            .collect();
        store.set(KEY_TEMPERATURES, &temps).unwrap();

        assert!(store.load_readings().is_empty());
        store.save_readings(&[reading]).unwrap();
        assert_eq!(store.load_readings(), vec![reading]);
    }
}
