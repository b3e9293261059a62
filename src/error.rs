use std::sync::Arc;

pub use anyhow::Error as UserError;
use thiserror::Error;

use crate::key::TaskId;

#[derive(Debug, Error)]
pub enum TsumikiError {
    #[error("Invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("Task {task}: {source}")]
    Protocol {
        task: TaskId,
        #[source]
        source: ProtocolError,
    },

    #[error("Task {0} belongs to a fixed builder and has no inserted value")]
    FixedBuilder(TaskId),

    #[error("Upgrade of builder '{builder}' rejected: key collision on {key}")]
    Collision { builder: String, key: String },

    /// Error raised by builder code, the message of `source` is kept as is.
    #[error("Task {task}:\n{source}")]
    Task {
        task: TaskId,
        #[source]
        source: UserError,
    },

    #[error("Worker {worker} running task {task} missed its heartbeat ({silent_ms}ms silent)")]
    WorkerFailure {
        task: TaskId,
        worker: usize,
        silent_ms: u128,
    },

    #[error("Couldn't start executor: {0}")]
    Executor(String),

    #[error("Cycle detected in task graph at {0}")]
    Cycle(TaskId),

    #[error("Entry not found: {0}")]
    NotFound(TaskId),

    #[error("Entry already exists: {0}")]
    EntryExists(TaskId),

    #[error("Store error:\n{0}")]
    Store(#[from] StoreError),

    #[error("Runtime was stopped")]
    Stopped,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid item in config: {0}")]
    Unsupported(String),

    #[error("Invalid key in config: {0}")]
    Key(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Builder '{0}' is already registered")]
    Duplicate(String),

    #[error("'{0}' is not a valid name for Builder")]
    InvalidName(String),

    #[error("Builder '{0}' is not registered")]
    Unknown(String),
}

/// Violations of the declare/compute protocol of staged builders.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Returned by `suspend` during the declare pass, ends that pass.
    #[error("declare phase suspended")]
    Suspended,

    #[error("dependency on {0} referenced in the computation phase")]
    ComputePhaseDependency(TaskId),

    #[error("builder suspended (yielded) more than once")]
    DoubleSuspend,

    #[error("staged builder returned without suspending")]
    MissingSuspend,

    #[error("dependency values are not available in the declare phase")]
    DeclarePhaseRead,

    #[error("inconsistent dependencies: declared {declared:?}, observed {observed:?}")]
    InconsistentDependencies {
        declared: Vec<TaskId>,
        observed: Vec<TaskId>,
    },
}

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] Arc<std::io::Error>),

    #[error("Couldn't encode store snapshot: {0}")]
    Encode(String),

    #[error("Couldn't decode store snapshot: {0}")]
    Decode(String),

    #[error("Store snapshot at '{0}' is corrupted")]
    Corrupted(String),

    #[error("Entry {0} references missing producer {1}")]
    MissingProducer(TaskId, TaskId),

    #[error("Entry {0} is not stored")]
    Missing(TaskId),

    #[error("Entry {0} would be overwritten")]
    Conflict(TaskId),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(Arc::new(e))
    }
}

pub type Result<T, E = TsumikiError> = std::result::Result<T, E>;
