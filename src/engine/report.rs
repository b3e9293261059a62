use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::TsumikiError;
use crate::executor::{ExecutorStats, ExecutorStatus};
use crate::key::{Config, Key, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Compute,
    Upgrade,
}

/// Timing of a single computed task, relative to the start of its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskExecution {
    pub task: TaskId,
    pub start: Duration,
    pub duration: Duration,
}

/// Execution log of one batch, kept whether the batch succeeded or not.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub id: usize,
    pub kind: ReportKind,
    /// Unix time in milliseconds.
    pub started: u128,
    pub duration: Duration,
    pub tasks: Vec<TaskExecution>,
    /// Requested tasks answered from the store.
    pub cached: usize,
    pub error: Option<String>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Sum of the compute time of every task, as opposed to wall time.
    pub fn busy(&self) -> Duration {
        self.tasks.iter().map(|t| t.duration).sum()
    }
}

pub(crate) struct Batch {
    id: usize,
    kind: ReportKind,
    started: SystemTime,
    start: Instant,
    tasks: Vec<TaskExecution>,
    cached: usize,
}

impl Batch {
    pub(crate) fn new(id: usize, kind: ReportKind) -> Self {
        Self {
            id,
            kind,
            started: SystemTime::now(),
            start: Instant::now(),
            tasks: Vec::new(),
            cached: 0,
        }
    }

    pub(crate) fn cached(&mut self, n: usize) {
        self.cached += n;
    }

    pub(crate) fn record(&mut self, task: TaskId, start: Instant, duration: Duration) {
        self.tasks.push(TaskExecution {
            task,
            start: start.saturating_duration_since(self.start),
            duration,
        });
    }

    pub(crate) fn finish(self, error: Option<&TsumikiError>) -> Report {
        let started = self
            .started
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());

        Report {
            id: self.id,
            kind: self.kind,
            started,
            duration: self.start.elapsed(),
            tasks: self.tasks,
            cached: self.cached,
            error: error.map(ToString::to_string),
        }
    }
}

/// Overview of one builder, stored or registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    pub builder: Arc<str>,
    pub entries: usize,
    pub registered: bool,
    pub fixed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySummary {
    pub key: Key,
    pub config: Config,
    pub comp_time: Duration,
    pub dependencies: usize,
    pub consumers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorSummary {
    pub id: usize,
    pub workers: usize,
    pub heartbeat_ms: u128,
    pub status: ExecutorStatus,
    #[serde(flatten)]
    pub stats: ExecutorStats,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::key::canonicalize;

    #[test]
    fn test_batch_report() {
        let task = TaskId::new("col", canonicalize(&json!(1)).unwrap());
        let mut batch = Batch::new(3, ReportKind::Compute);
        batch.cached(2);
        batch.record(task.clone(), Instant::now(), Duration::from_millis(4));
        batch.record(task, Instant::now(), Duration::from_millis(6));

        let report = batch.finish(Some(&TsumikiError::Stopped));
        assert_eq!(report.id, 3);
        assert_eq!(report.cached, 2);
        assert_eq!(report.busy(), Duration::from_millis(10));
        assert_eq!(report.error.as_deref(), Some("Runtime was stopped"));
        assert!(!report.is_ok());

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["kind"], json!("compute"));
        assert_eq!(value["tasks"][0]["task"]["builder"], json!("col"));
    }

    #[test]
    fn test_executor_summary_is_flat() {
        let summary = ExecutorSummary {
            id: 0,
            workers: 2,
            heartbeat_ms: 5000,
            status: ExecutorStatus::Running,
            stats: ExecutorStats {
                jobs: 4,
                completed: 3,
                failed: 1,
            },
        };

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["status"], json!("running"));
        assert_eq!(value["failed"], json!(1));
    }
}
