//! In-memory storage backend.
//!
//! Clones share one flash image, so a store rebuilt from a clone after a
//! simulated reboot sees exactly what was committed before it. Writes are
//! staged per handle; [`MemoryStorage::power_loss`] drops everything that was
//! never committed.

use super::{Storage, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Namespace = HashMap<String, Vec<u8>>;

#[derive(Default)]
struct Flash {
    committed: HashMap<String, Namespace>,
    next_handle: u32,
    open_handles: usize,
    fail_next_open: bool,
    fail_next_commit: bool,
}

/// Handle to an open namespace with its staged writes.
#[derive(Debug)]
pub struct MemoryHandle {
    id: u32,
    namespace: String,
    staged: Namespace,
}

/// Shared in-memory flash image.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    flash: Arc<Mutex<Flash>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn flash(&self) -> MutexGuard<'_, Flash> {
        // A panicking test must not poison the image for the next assertion.
        self.flash.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `open` fail.
    pub fn fail_next_open(&self) {
        self.flash().fail_next_open = true;
    }

    /// Make the next `commit` fail without writing anything.
    pub fn fail_next_commit(&self) {
        self.flash().fail_next_commit = true;
    }

    /// Simulate a power cut: every handle is gone, staged writes are lost.
    pub fn power_loss(&self) {
        self.flash().open_handles = 0;
    }

    /// Number of handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.flash().open_handles
    }

    /// Committed value of a key, bypassing the handle protocol.
    pub fn committed(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.flash()
            .committed
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
    }
}

impl Storage for MemoryStorage {
    type Handle = MemoryHandle;

    fn open(&mut self, namespace: &str) -> Result<MemoryHandle, StorageError> {
        let mut flash = self.flash();
        if std::mem::take(&mut flash.fail_next_open) {
            return Err(StorageError::Open(format!(
                "namespace '{}' unavailable",
                namespace
            )));
        }
        flash.next_handle += 1;
        flash.open_handles += 1;
        Ok(MemoryHandle {
            id: flash.next_handle,
            namespace: namespace.to_string(),
            staged: HashMap::new(),
        })
    }

    fn get_blob(
        &mut self,
        handle: &mut MemoryHandle,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = handle.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.committed(&handle.namespace, key))
    }

    fn set_blob(
        &mut self,
        handle: &mut MemoryHandle,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        handle.staged.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&mut self, handle: &mut MemoryHandle) -> Result<(), StorageError> {
        let mut flash = self.flash();
        if std::mem::take(&mut flash.fail_next_commit) {
            handle.staged.clear();
            return Err(StorageError::Commit(format!("handle {}", handle.id)));
        }
        let namespace = flash
            .committed
            .entry(handle.namespace.clone())
            .or_default();
        namespace.extend(handle.staged.drain());
        Ok(())
    }

    fn close(&mut self, handle: MemoryHandle) {
        let mut flash = self.flash();
        flash.open_handles = flash.open_handles.saturating_sub(1);
        if !handle.staged.is_empty() {
            log::debug!(
                "Handle {} closed with {} uncommitted write(s)",
                handle.id,
                handle.staged.len()
            );
        }
    }
}
