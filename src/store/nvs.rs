//! NVS storage backend for ESP32.
//!
//! Writes are staged in the handle and flushed at [`Storage::commit`].
//! `EspNvs` commits on every `set_raw`, so the flush is key by key: a power
//! loss part way through leaves some keys new and others old. Multi-key
//! records must tolerate that on read, as
//! [`PersistentStore::load_readings`](super::PersistentStore::load_readings) does.

use super::{Storage, StorageError};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use std::collections::HashMap;

/// Handle to an open NVS namespace.
pub struct NvsHandle {
    nvs: EspNvs<NvsDefault>,
    staged: HashMap<String, Vec<u8>>,
}

/// Default NVS partition.
#[derive(Clone)]
pub struct NvsStorage {
    partition: EspDefaultNvsPartition,
}

impl NvsStorage {
    /// Take the default partition. Initializes flash, erasing it if its
    /// layout is from an incompatible IDF version.
    pub fn take() -> Result<Self, StorageError> {
        let partition = EspDefaultNvsPartition::take()
            .map_err(|e| StorageError::Open(format!("nvs partition: {}", e)))?;
        Ok(Self { partition })
    }

    pub fn partition(&self) -> EspDefaultNvsPartition {
        self.partition.clone()
    }
}

impl Storage for NvsStorage {
    type Handle = NvsHandle;

    fn open(&mut self, namespace: &str) -> Result<NvsHandle, StorageError> {
        let nvs = EspNvs::new(self.partition.clone(), namespace, true)
            .map_err(|e| StorageError::Open(format!("{}: {}", namespace, e)))?;
        Ok(NvsHandle {
            nvs,
            staged: HashMap::new(),
        })
    }

    fn get_blob(
        &mut self,
        handle: &mut NvsHandle,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = handle.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        let len = match handle
            .nvs
            .blob_len(key)
            .map_err(|e| StorageError::Read(format!("{}: {}", key, e)))?
        {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut buf = vec![0u8; len];
        let value = handle
            .nvs
            .get_raw(key, &mut buf)
            .map_err(|e| StorageError::Read(format!("{}: {}", key, e)))?;
        Ok(value.map(<[u8]>::to_vec))
    }

    fn set_blob(
        &mut self,
        handle: &mut NvsHandle,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        handle.staged.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Not atomic across keys; see the module docs.
    fn commit(&mut self, handle: &mut NvsHandle) -> Result<(), StorageError> {
        for (key, value) in handle.staged.drain() {
            handle
                .nvs
                .set_raw(&key, &value)
                .map_err(|e| StorageError::Commit(format!("{}: {}", key, e)))?;
        }
        Ok(())
    }

    fn close(&mut self, handle: NvsHandle) {
        if !handle.staged.is_empty() {
            log::debug!("Discarding {} uncommitted NVS write(s)", handle.staged.len());
        }
    }
}
