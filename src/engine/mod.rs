//! The task graph engine.
//!
//! A [`Runtime`] owns the builder registry, the store and the executor. All
//! graph bookkeeping happens on the thread that calls into the runtime, only
//! compute phases are handed over to the executor.

mod context;
mod plan;
mod report;
mod run;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::{Deref, DerefMut};
use std::slice;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, info};

pub use self::context::{Dep, TaskContext};
pub use self::report::{
    CollectionSummary, EntrySummary, ExecutorSummary, Report, ReportKind, TaskExecution,
};
use self::report::Batch;
use crate::builder::{Builder, BuilderRef, Registry, TaskRef};
use crate::error::{RegistrationError, TsumikiError};
use crate::executor::{Executor, ExecutorOptions};
use crate::key::{self, Config, TaskId};
use crate::store::{Entry, EntryState, FileStore, MemoryStore, Store};

type Result<T, E = TsumikiError> = std::result::Result<T, E>;

/// Incremental computation runtime.
pub struct Runtime {
    registry: Registry,
    store: Box<dyn Store>,
    executor: Executor,
    /// Summaries of executors replaced through `configure_executor`.
    retired: Vec<ExecutorSummary>,
    reports: Vec<Report>,
}

impl Runtime {
    pub fn setup() -> RuntimeSetup {
        RuntimeSetup::new()
    }

    /// Runtime backed by a [`MemoryStore`] with the default executor.
    pub fn in_memory() -> Self {
        Self::setup().finish()
    }

    /// Runtime backed by a [`FileStore`] at `path`.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self> {
        Ok(Self::setup().store(FileStore::open(path)?).finish())
    }

    // ******************************
    // *        Registration        *
    // ******************************

    pub fn register_builder(&mut self, builder: Builder) -> Result<BuilderRef> {
        let handle = self.registry.register(builder)?;
        debug!(builder = handle.name(), "registered");
        Ok(handle)
    }

    pub fn builder(&self, name: &str) -> Option<BuilderRef> {
        self.registry.builder_ref(name)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ******************************
    // *          Compute           *
    // ******************************

    pub fn compute(&mut self, task: &TaskRef) -> Result<Entry> {
        let mut entries = self.compute_many(slice::from_ref(task))?;
        entries.pop().ok_or_else(|| TsumikiError::NotFound(task.id().clone()))
    }

    /// Compute every task in one batch, results come back in input order.
    ///
    /// Stored entries are returned as they are. Every other task is declared,
    /// its dependencies resolved first, and computed once even when several
    /// consumers share it. Successful entries of a failing batch stay stored.
    pub fn compute_many(&mut self, tasks: &[TaskRef]) -> Result<Vec<Entry>> {
        self.ensure_running()?;

        let mut batch = Batch::new(self.reports.len(), ReportKind::Compute);
        let result = self.compute_batch(tasks, &mut batch);
        self.reports.push(batch.finish(result.as_ref().err()));
        result
    }

    fn compute_batch(&mut self, tasks: &[TaskRef], batch: &mut Batch) -> Result<Vec<Entry>> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        let mut cached = 0;

        for task in tasks {
            if !seen.insert(task.id()) {
                continue;
            }
            if self.store.contains(task.id())? {
                cached += 1;
            } else {
                missing.push(task.clone());
            }
        }

        batch.cached(cached);
        if cached > 0 {
            debug!(cached, "served from store");
        }

        if !missing.is_empty() {
            let plan = plan::plan(&self.registry, &*self.store, missing)?;
            run::execute(&mut *self.store, &mut self.executor, plan, batch)?;
        }

        tasks.iter().map(|task| self.read_entry(task)).collect()
    }

    /// Store a value for a task, the only way to fill a fixed builder.
    pub fn insert<T>(&mut self, task: &TaskRef, value: T) -> Result<Entry>
    where
        T: Serialize,
    {
        if self.store.contains(task.id())? {
            return Err(TsumikiError::EntryExists(task.id().clone()));
        }

        let value = serde_json::to_value(value).map_err(|e| TsumikiError::Task {
            task: task.id().clone(),
            source: e.into(),
        })?;

        let entry = Entry {
            builder: task.id().builder.clone(),
            key: task.key().clone(),
            config: task.config().clone(),
            value,
            comp_time: Default::default(),
            state: EntryState::Finished,
        };

        self.store.insert(entry.clone(), &[])?;
        debug!(task = %task.id(), "inserted");
        Ok(entry)
    }

    // ******************************
    // *          Queries           *
    // ******************************

    pub fn read_entry(&self, task: &TaskRef) -> Result<Entry> {
        self.try_read_entry(task)?
            .ok_or_else(|| TsumikiError::NotFound(task.id().clone()))
    }

    pub fn try_read_entry(&self, task: &TaskRef) -> Result<Option<Entry>> {
        Ok(self.store.entry(task.id())?)
    }

    /// Read many entries at once, missing ones are `None` unless dropped.
    pub fn read_entries(&self, tasks: &[TaskRef], drop_missing: bool) -> Result<Vec<Option<Entry>>> {
        let mut entries = Vec::with_capacity(tasks.len());
        for task in tasks {
            let entry = self.try_read_entry(task)?;
            if entry.is_some() || !drop_missing {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn get_entry_state(&self, task: &TaskRef) -> Result<Option<EntryState>> {
        Ok(self.try_read_entry(task)?.map(|entry| entry.state))
    }

    /// The task itself and every entry transitively consuming it.
    pub fn get_recursive_consumers(&self, id: &TaskId) -> Result<BTreeSet<TaskId>> {
        Ok(self.store.recursive_consumers(id)?)
    }

    pub fn get_reports(&self) -> &[Report] {
        &self.reports
    }

    // ******************************
    // *        Invalidation        *
    // ******************************

    /// Remove an entry together with everything computed from it.
    ///
    /// With `remove_inputs`, the direct dependencies of the task are removed
    /// as well, as long as nothing else still consumes them. Returns the ids
    /// of every removed entry.
    pub fn remove(&mut self, task: &TaskRef, remove_inputs: bool) -> Result<BTreeSet<TaskId>> {
        let mut removed = self.store.recursive_consumers(task.id())?;
        if removed.is_empty() {
            return Ok(removed);
        }

        let inputs = if remove_inputs {
            self.store.dependencies(task.id())?
        } else {
            Vec::new()
        };

        self.store.remove(&removed)?;

        for input in inputs {
            if removed.contains(&input) || !self.store.consumers(&input)?.is_empty() {
                continue;
            }
            let orphaned = self.store.recursive_consumers(&input)?;
            self.store.remove(&orphaned)?;
            removed.extend(orphaned);
        }

        info!(task = %task.id(), removed = removed.len(), "removed");
        Ok(removed)
    }

    /// Remove several entries and their consumers in one store write.
    pub fn remove_many(&mut self, tasks: &[TaskRef]) -> Result<BTreeSet<TaskId>> {
        let mut removed = BTreeSet::new();
        for task in tasks {
            removed.extend(self.store.recursive_consumers(task.id())?);
        }

        self.store.remove(&removed)?;
        info!(removed = removed.len(), "removed");
        Ok(removed)
    }

    /// Remove every entry of a builder and everything computed from them.
    pub fn clear(&mut self, builder: &BuilderRef) -> Result<BTreeSet<TaskId>> {
        let mut removed = BTreeSet::new();
        for entry in self.store.entries(builder.name())? {
            removed.extend(self.store.recursive_consumers(&entry.id())?);
        }

        self.store.remove(&removed)?;
        info!(builder = builder.name(), removed = removed.len(), "cleared");
        Ok(removed)
    }

    // ******************************
    // *          Upgrade           *
    // ******************************

    /// Swap the function of a registered builder, re-keying its entries.
    ///
    /// Every stored config of the builder goes through `migrate` and is keyed
    /// again. Values are kept as they are. When two entries end up on the same
    /// key nothing is changed and a collision is reported.
    pub fn upgrade_builder<F>(&mut self, builder: Builder, migrate: F) -> Result<BuilderRef>
    where
        F: Fn(Config) -> Config,
    {
        builder.validate()?;
        if !self.registry.contains(builder.name()) {
            return Err(RegistrationError::Unknown(builder.name().to_string()).into());
        }

        let batch = Batch::new(self.reports.len(), ReportKind::Upgrade);
        let result = self.upgrade(builder, migrate);
        self.reports.push(batch.finish(result.as_ref().err()));
        result
    }

    fn upgrade<F>(&mut self, builder: Builder, migrate: F) -> Result<BuilderRef>
    where
        F: Fn(Config) -> Config,
    {
        let name = builder.name().to_string();
        let mut targets = BTreeSet::new();
        let mut moves = Vec::new();

        for entry in self.store.entries(&name)? {
            let config = migrate(entry.config.clone());
            let key = key::canonicalize(&config)?;

            if !targets.insert(key.clone()) {
                return Err(TsumikiError::Collision {
                    builder: name,
                    key: key.to_string(),
                });
            }

            moves.push((
                entry.id(),
                Entry {
                    key,
                    config,
                    ..entry
                },
            ));
        }

        let moved = moves.len();
        self.store.rekey(&name, moves)?;
        let handle = self.registry.replace(builder)?;

        info!(builder = name, moved, "upgraded");
        Ok(handle)
    }

    // ******************************
    // *          Executor          *
    // ******************************

    /// Replace the executor, the previous one is stopped.
    pub fn configure_executor(&mut self, options: ExecutorOptions) -> Result<()> {
        self.ensure_running()?;

        let mut old = std::mem::replace(&mut self.executor, Executor::new(options));
        old.stop();
        self.retired.push(summarize(self.retired.len(), &old));
        Ok(())
    }

    pub fn executor_options(&self) -> &ExecutorOptions {
        self.executor.options()
    }

    /// Stop the executor. Stored entries stay readable, computing fails.
    pub fn stop(&mut self) {
        self.executor.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.executor.is_stopped()
    }

    /// Borrow the runtime for a scope that stops it once dropped.
    pub fn scope(&mut self) -> Result<RuntimeScope<'_>> {
        self.ensure_running()?;
        Ok(RuntimeScope { runtime: self })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(TsumikiError::Stopped);
        }
        Ok(())
    }

    // ******************************
    // *         Summaries          *
    // ******************************

    /// Every builder that is registered or has stored entries.
    pub fn collection_summaries(&self) -> Result<Vec<CollectionSummary>> {
        let mut summaries: BTreeMap<_, _> = self
            .registry
            .names()
            .map(|name| {
                let summary = CollectionSummary {
                    builder: name.into(),
                    entries: 0,
                    registered: true,
                    fixed: self.registry.get(name).is_some_and(|b| b.is_fixed()),
                };
                (summary.builder.clone(), summary)
            })
            .collect();

        for collection in self.store.collections()? {
            summaries
                .entry(collection.builder.clone())
                .or_insert_with(|| CollectionSummary {
                    builder: collection.builder.clone(),
                    entries: 0,
                    registered: false,
                    fixed: false,
                })
                .entries = collection.entries;
        }

        Ok(summaries.into_values().collect())
    }

    pub fn entry_summaries(&self, builder: &str) -> Result<Vec<EntrySummary>> {
        let mut summaries = Vec::new();
        for entry in self.store.entries(builder)? {
            let id = entry.id();
            summaries.push(EntrySummary {
                dependencies: self.store.dependencies(&id)?.len(),
                consumers: self.store.consumers(&id)?.len(),
                key: entry.key,
                config: entry.config,
                comp_time: entry.comp_time,
            });
        }
        Ok(summaries)
    }

    /// Retired executors first, the current one last.
    pub fn executor_summaries(&self) -> Vec<ExecutorSummary> {
        let mut summaries = self.retired.clone();
        summaries.push(summarize(self.retired.len(), &self.executor));
        summaries
    }
}

fn summarize(id: usize, executor: &Executor) -> ExecutorSummary {
    let options = executor.options();
    ExecutorSummary {
        id,
        workers: options.workers,
        heartbeat_ms: options.heartbeat_interval.as_millis(),
        status: executor.status(),
        stats: executor.stats(),
    }
}

/// Builder for a [`Runtime`].
pub struct RuntimeSetup {
    store: Option<Box<dyn Store>>,
    options: ExecutorOptions,
    registry: Registry,
}

impl RuntimeSetup {
    fn new() -> Self {
        Self {
            store: None,
            options: ExecutorOptions::default(),
            registry: Registry::new(),
        }
    }

    pub fn store(mut self, store: impl Store + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn executor(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Start from builders registered up front.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn finish(self) -> Runtime {
        Runtime {
            registry: self.registry,
            store: self.store.unwrap_or_else(|| Box::new(MemoryStore::new())),
            executor: Executor::new(self.options),
            retired: Vec::new(),
            reports: Vec::new(),
        }
    }
}

/// A runtime borrowed for a scope, stopped when dropped.
pub struct RuntimeScope<'a> {
    runtime: &'a mut Runtime,
}

impl Deref for RuntimeScope<'_> {
    type Target = Runtime;

    fn deref(&self) -> &Self::Target {
        self.runtime
    }
}

impl DerefMut for RuntimeScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.runtime
    }
}

impl Drop for RuntimeScope<'_> {
    fn drop(&mut self) {
        self.runtime.stop();
    }
}
