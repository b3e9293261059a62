//! Persistence of entries and dependency edges.
//!
//! The engine only talks to a [`Store`] through the trait below. Every
//! mutation is applied as a whole or not at all. A compute batch holds the
//! store for its whole run, so a persistent store writes once per batch.

mod file;
mod memory;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use self::file::FileStore;
pub use self::memory::MemoryStore;
use crate::builder::Value;
use crate::error::StoreError;
use crate::key::{Config, Key, TaskId};

/// Persisted result of a builder for a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub builder: Arc<str>,
    pub key: Key,
    pub config: Config,
    pub value: Value,
    pub comp_time: Duration,
    pub state: EntryState,
}

impl Entry {
    pub fn id(&self) -> TaskId {
        TaskId::new(self.builder.clone(), self.key.clone())
    }

    /// Deserialize the stored value.
    pub fn value_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }
}

/// Only finished entries are ever stored, absence is `None` at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Finished,
}

/// Number of entries stored for a builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collection {
    pub builder: Arc<str>,
    pub entries: usize,
}

pub trait Store: Send {
    fn entry(&self, id: &TaskId) -> Result<Option<Entry>, StoreError>;

    fn contains(&self, id: &TaskId) -> Result<bool, StoreError>;

    /// Store a finished entry together with the producers it depends on.
    ///
    /// Every producer must already be stored.
    fn insert(&mut self, entry: Entry, deps: &[TaskId]) -> Result<(), StoreError>;

    /// Drop entries and every edge touching them, unknown ids are skipped.
    fn remove(&mut self, ids: &BTreeSet<TaskId>) -> Result<(), StoreError>;

    /// Direct producers of `id`.
    fn dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError>;

    /// Direct consumers of `id`.
    fn consumers(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError>;

    /// `id` together with every entry transitively depending on it.
    fn recursive_consumers(&self, id: &TaskId) -> Result<BTreeSet<TaskId>, StoreError>;

    fn entries(&self, builder: &str) -> Result<Vec<Entry>, StoreError>;

    fn collections(&self) -> Result<Vec<Collection>, StoreError>;

    /// Move entries of `builder` to new keys, keeping their edges.
    fn rekey(&mut self, builder: &str, moves: Vec<(TaskId, Entry)>) -> Result<(), StoreError>;

    /// Defer persistence until [`flush`](Self::flush). Mutations still apply
    /// right away and are visible to reads.
    fn hold(&mut self) {}

    /// Persist everything changed since [`hold`](Self::hold), as one write.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
