#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod builder;
mod engine;
mod error;
mod executor;
pub mod key;
#[cfg(feature = "logging")]
pub mod logging;
pub mod store;

pub use crate::builder::{BuildResult, Builder, BuilderRef, Registry, TaskRef};
pub use crate::engine::{
    CollectionSummary, Dep, EntrySummary, ExecutorSummary, Report, ReportKind, Runtime,
    RuntimeScope, RuntimeSetup, TaskContext, TaskExecution,
};
pub use crate::error::*;
pub use crate::executor::{ExecutorOptions, ExecutorStats, ExecutorStatus};
pub use crate::key::{Config, Key, TaskId};
pub use crate::store::{Entry, EntryState, FileStore, MemoryStore, Store};
