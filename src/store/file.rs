use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error};

use super::memory::{MemoryStore, Snapshot};
use super::{Collection, Entry, Store};
use crate::error::StoreError;
use crate::key::TaskId;

const MAGIC: &[u8; 4] = b"TSMK";
const HEADER: usize = MAGIC.len() + blake3::OUT_LEN;

/// Store persisted to a single snapshot file.
///
/// The file holds a CBOR encoded snapshot prefixed with its blake3 hash. Each
/// mutation rewrites the whole file through a temporary sibling and a rename,
/// and rolls the in-memory state back if that write fails. While held, the
/// write and the rollback cover everything up to the next flush.
#[derive(Debug)]
pub struct FileStore {
    path: Utf8PathBuf,
    inner: MemoryStore,
    /// State as last persisted, present while held.
    held: Option<MemoryStore>,
}

impl FileStore {
    /// Open the snapshot at `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_owned();

        let inner = match fs::read(&path) {
            Ok(bytes) => MemoryStore::from_snapshot(decode(&path, &bytes)?)?,
            Err(e) if e.kind() == ErrorKind::NotFound => MemoryStore::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(%path, entries = inner.len(), "opened store");
        Ok(Self {
            path,
            inner,
            held: None,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn commit<F>(&mut self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut MemoryStore) -> Result<(), StoreError>,
    {
        if self.held.is_some() {
            return change(&mut self.inner);
        }

        let backup = self.inner.clone();
        change(&mut self.inner)?;

        if let Err(e) = self.persist() {
            self.inner = backup;
            return Err(e);
        }

        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let bytes = encode(&self.inner.snapshot())?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp = self.path.with_extension("tmp");
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(snapshot, &mut payload).map_err(|e| StoreError::Encode(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(blake3::hash(&payload).as_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn decode(path: &Utf8Path, bytes: &[u8]) -> Result<Snapshot, StoreError> {
    let corrupted = || StoreError::Corrupted(path.to_string());

    if bytes.len() < HEADER || &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupted());
    }

    let (hash, payload) = bytes[MAGIC.len()..].split_at(blake3::OUT_LEN);
    if blake3::hash(payload).as_bytes() != hash {
        return Err(corrupted());
    }

    ciborium::from_reader(payload).map_err(|e| StoreError::Decode(e.to_string()))
}

impl Store for FileStore {
    fn entry(&self, id: &TaskId) -> Result<Option<Entry>, StoreError> {
        self.inner.entry(id)
    }

    fn contains(&self, id: &TaskId) -> Result<bool, StoreError> {
        self.inner.contains(id)
    }

    fn insert(&mut self, entry: Entry, deps: &[TaskId]) -> Result<(), StoreError> {
        self.commit(|inner| inner.insert(entry, deps))
    }

    fn remove(&mut self, ids: &BTreeSet<TaskId>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.commit(|inner| inner.remove(ids))
    }

    fn dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError> {
        self.inner.dependencies(id)
    }

    fn consumers(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError> {
        self.inner.consumers(id)
    }

    fn recursive_consumers(&self, id: &TaskId) -> Result<BTreeSet<TaskId>, StoreError> {
        self.inner.recursive_consumers(id)
    }

    fn entries(&self, builder: &str) -> Result<Vec<Entry>, StoreError> {
        self.inner.entries(builder)
    }

    fn collections(&self) -> Result<Vec<Collection>, StoreError> {
        self.inner.collections()
    }

    fn rekey(&mut self, builder: &str, moves: Vec<(TaskId, Entry)>) -> Result<(), StoreError> {
        self.commit(|inner| inner.rekey(builder, moves))
    }

    fn hold(&mut self) {
        if self.held.is_none() {
            self.held = Some(self.inner.clone());
        }
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let Some(backup) = self.held.take() else {
            return Ok(());
        };

        if let Err(e) = self.persist() {
            self.inner = backup;
            return Err(e);
        }

        debug!(path = %self.path, entries = self.inner.len(), "flushed store");
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(path = %self.path, "couldn't flush store: {e}");
        }
    }
}
