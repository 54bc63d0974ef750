//! File-backed storage for host builds.
//!
//! Each key lives in `<root>/<namespace>/<key>.blob` as a SHA-256 digest
//! followed by the value. Commit writes a temporary file and renames it over
//! the old one, so a crash leaves either the old or the new value.
//! Defaults to `~/.sensor-node/store`.

use super::{Storage, StorageError};
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const DIGEST_LEN: usize = 32;

/// Handle to an open namespace directory.
#[derive(Debug)]
pub struct FileHandle {
    dir: PathBuf,
    staged: HashMap<String, Vec<u8>>,
}

/// Checksummed blob files under a root directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage rooted at `~/.sensor-node/store`.
    pub fn default_location() -> io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self::new(
            PathBuf::from(home).join(".sensor-node").join("store"),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn blob_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.blob", key))
}

fn encode(value: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DIGEST_LEN + value.len());
    bytes.extend_from_slice(&Sha256::digest(value));
    bytes.extend_from_slice(value);
    bytes
}

fn decode(key: &str, bytes: Vec<u8>) -> Result<Vec<u8>, StorageError> {
    if bytes.len() < DIGEST_LEN {
        return Err(StorageError::Corrupt(format!(
            "{}: {} bytes, shorter than checksum",
            key,
            bytes.len()
        )));
    }
    let (digest, value) = bytes.split_at(DIGEST_LEN);
    if Sha256::digest(value).as_slice() != digest {
        return Err(StorageError::Corrupt(format!("{}: checksum mismatch", key)));
    }
    Ok(value.to_vec())
}

impl Storage for FileStorage {
    type Handle = FileHandle;

    fn open(&mut self, namespace: &str) -> Result<FileHandle, StorageError> {
        let dir = self.root.join(namespace);
        fs::create_dir_all(&dir)
            .map_err(|e| StorageError::Open(format!("{}: {}", dir.display(), e)))?;
        Ok(FileHandle {
            dir,
            staged: HashMap::new(),
        })
    }

    fn get_blob(
        &mut self,
        handle: &mut FileHandle,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = handle.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        match fs::read(blob_path(&handle.dir, key)) {
            Ok(bytes) => decode(key, bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read(format!("{}: {}", key, e))),
        }
    }

    fn set_blob(
        &mut self,
        handle: &mut FileHandle,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        handle.staged.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&mut self, handle: &mut FileHandle) -> Result<(), StorageError> {
        // Stage every temp file before renaming any, so a write error leaves
        // all keys at their old values.
        let mut pending = Vec::with_capacity(handle.staged.len());
        for (key, value) in handle.staged.drain() {
            let target = blob_path(&handle.dir, &key);
            let tmp = target.with_extension("tmp");
            fs::write(&tmp, encode(&value))
                .map_err(|e| StorageError::Write(format!("{}: {}", key, e)))?;
            pending.push((tmp, target));
        }
        for (tmp, target) in pending {
            fs::rename(&tmp, &target)
                .map_err(|e| StorageError::Commit(format!("{}: {}", target.display(), e)))?;
            debug!("Committed {:?}", target);
        }
        Ok(())
    }

    fn close(&mut self, handle: FileHandle) {
        if !handle.staged.is_empty() {
            debug!(
                "Discarding {} uncommitted write(s) in {:?}",
                handle.staged.len(),
                handle.dir
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to ensure unique test directories even in parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_root() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir().join(format!("sensor-node-test-{}-{}", pid, id))
    }

    #[test]
    fn test_commit_then_reopen() {
        let root = unique_root();
        let mut storage = FileStorage::new(&root);

        let mut handle = storage.open("ns").unwrap();
        assert_eq!(storage.get_blob(&mut handle, "k").unwrap(), None);
        storage.set_blob(&mut handle, "k", b"value").unwrap();
        storage.commit(&mut handle).unwrap();
        storage.close(handle);

        let mut reopened = FileStorage::new(&root);
        let mut handle = reopened.open("ns").unwrap();
        assert_eq!(
            reopened.get_blob(&mut handle, "k").unwrap(),
            Some(b"value".to_vec())
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_uncommitted_write_is_discarded() {
        let root = unique_root();
        let mut storage = FileStorage::new(&root);

        let mut handle = storage.open("ns").unwrap();
        storage.set_blob(&mut handle, "k", b"value").unwrap();
        storage.close(handle);

        let mut handle = storage.open("ns").unwrap();
        assert_eq!(storage.get_blob(&mut handle, "k").unwrap(), None);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let root = unique_root();
        let mut storage = FileStorage::new(&root);

        let mut handle = storage.open("ns").unwrap();
        storage.set_blob(&mut handle, "k", b"value").unwrap();
        storage.commit(&mut handle).unwrap();

        let path = blob_path(&root.join("ns"), "k");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            storage.get_blob(&mut handle, "k"),
            Err(StorageError::Corrupt(_))
        ));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let root = unique_root();
        let mut storage = FileStorage::new(&root);
        let mut handle = storage.open("ns").unwrap();
        fs::write(blob_path(&root.join("ns"), "k"), b"short").unwrap();

        assert!(matches!(
            storage.get_blob(&mut handle, "k"),
            Err(StorageError::Corrupt(_))
        ));

        let _ = fs::remove_dir_all(&root);
    }
}
