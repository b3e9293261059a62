//! Worker pool running the compute phase of ready tasks.
//!
//! The runtime thread submits jobs and then waits on the completion channel.
//! While waiting it also acts as the monitor: it wakes at least once per
//! heartbeat interval and fails any job whose pulse went silent for longer
//! than that.

mod heartbeat;

use std::any::Any;
use std::collections::BTreeMap;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error, info};

use self::heartbeat::{Heart, Pulse};
use crate::builder::Value;
use crate::error::TsumikiError;
use crate::key::TaskId;

/// Executor configuration.
///
/// Deserializable from a config file, `heartbeat_ms` is given in
/// milliseconds. Missing fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Size of the pool, `0` runs every job inline on the calling thread.
    pub workers: usize,
    /// Longest silence tolerated from an in-flight job.
    #[serde(rename = "heartbeat_ms", deserialize_with = "millis")]
    pub heartbeat_interval: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, NonZero::get),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl ExecutorOptions {
    /// Synchronous execution, no threads are spawned.
    pub fn inline() -> Self {
        Self::default().workers(0)
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

fn millis<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(de).map(Duration::from_millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorStatus {
    Running,
    Stopped,
    /// A worker went silent, the pool keeps serving the remaining workers.
    Lost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs: usize,
    pub completed: usize,
    pub failed: usize,
}

pub(crate) type JobFn = Box<dyn FnOnce() -> Result<Value, TsumikiError> + Send>;

/// Outcome of a single job.
#[derive(Debug)]
pub(crate) struct Completion {
    pub task: TaskId,
    pub result: Result<Value, TsumikiError>,
    pub start: Instant,
    pub duration: Duration,
}

struct Workers {
    pool: ThreadPool,
    heart: Heart,
}

pub(crate) struct Executor {
    options: ExecutorOptions,
    workers: Option<Workers>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    /// Jobs submitted but not yet collected, inline jobs have no pulse.
    in_flight: BTreeMap<TaskId, Option<Pulse>>,
    stats: ExecutorStats,
    status: ExecutorStatus,
}

impl Executor {
    pub(crate) fn new(options: ExecutorOptions) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            options,
            workers: None,
            sender,
            receiver,
            in_flight: BTreeMap::new(),
            stats: ExecutorStats::default(),
            status: ExecutorStatus::Running,
        }
    }

    pub(crate) fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub(crate) fn stats(&self) -> ExecutorStats {
        self.stats
    }

    pub(crate) fn status(&self) -> ExecutorStatus {
        self.status
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.status == ExecutorStatus::Stopped
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Threads are only spawned for the first job that needs them.
    fn start(&mut self) -> Result<&Workers, TsumikiError> {
        if self.workers.is_none() {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.options.workers)
                .thread_name(|i| format!("tsumiki-worker-{i}"))
                .panic_handler(|panic| error!("{}", panic_message(&*panic)))
                .build()
                .map_err(|e| TsumikiError::Executor(e.to_string()))?;

            let heart = Heart::start(self.options.heartbeat_interval)
                .map_err(|e| TsumikiError::Executor(e.to_string()))?;

            info!(workers = self.options.workers, "started executor");
            self.workers = Some(Workers { pool, heart });
        }

        self.workers
            .as_ref()
            .ok_or_else(|| TsumikiError::Executor("worker pool is gone".into()))
    }

    pub(crate) fn submit(&mut self, task: TaskId, job: JobFn) -> Result<(), TsumikiError> {
        if self.is_stopped() {
            return Err(TsumikiError::Stopped);
        }

        self.stats.jobs += 1;
        let sender = self.sender.clone();

        if self.options.workers == 0 {
            let start = Instant::now();
            let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(result) => result,
                Err(panic) => {
                    error!("{}", panic_message(&*panic));
                    Err(TsumikiError::WorkerFailure {
                        task: task.clone(),
                        worker: 0,
                        silent_ms: 0,
                    })
                }
            };

            // the receiver lives in `self`, sending cannot fail
            let _ = sender.send(Completion {
                task: task.clone(),
                result,
                start,
                duration: start.elapsed(),
            });
            self.in_flight.insert(task, None);
            return Ok(());
        }

        let workers = self.start()?;
        let pulse = workers.heart.track();
        let guard = pulse.guard();
        let id = task.clone();

        workers.pool.spawn(move || {
            guard.attach(rayon::current_thread_index().unwrap_or(0));
            let start = Instant::now();
            let result = job();
            let duration = start.elapsed();
            guard.finish();
            let _ = sender.send(Completion {
                task: id,
                result,
                start,
                duration,
            });
        });

        debug!(%task, "dispatched");
        self.in_flight.insert(task, Some(pulse));
        Ok(())
    }

    /// Wait for the next finished job, `None` once nothing is in flight.
    ///
    /// Results already waiting in the channel are handed out before any pulse
    /// is judged.
    pub(crate) fn next(&mut self) -> Result<Option<Completion>, TsumikiError> {
        while !self.in_flight.is_empty() {
            match self.receiver.try_recv() {
                Ok(done) => match self.collect(done) {
                    Some(done) => return Ok(Some(done)),
                    None => continue,
                },
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return Err(TsumikiError::Stopped),
            }

            self.check()?;

            match self.receiver.recv_timeout(self.options.heartbeat_interval) {
                Ok(done) => {
                    if let Some(done) = self.collect(done) {
                        return Ok(Some(done));
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(TsumikiError::Stopped),
            }
        }

        Ok(None)
    }

    /// Account for a completion, dropping ones that were already failed.
    fn collect(&mut self, done: Completion) -> Option<Completion> {
        if self.in_flight.remove(&done.task).is_none() {
            debug!(task = %done.task, "dropped late completion");
            return None;
        }

        match done.result {
            Ok(_) => self.stats.completed += 1,
            Err(_) => self.stats.failed += 1,
        }
        Some(done)
    }

    /// Fail the first unfinished job whose pulse is older than the interval.
    fn check(&mut self) -> Result<(), TsumikiError> {
        let now = Instant::now();
        let interval = self.options.heartbeat_interval;

        let stale = self.in_flight.iter().find_map(|(task, pulse)| {
            let pulse = pulse.as_ref().filter(|pulse| !pulse.is_finished())?;
            let silence = pulse.silence(now);
            (silence > interval).then(|| (task.clone(), pulse.worker(), silence))
        });

        let Some((task, worker, silence)) = stale else {
            return Ok(());
        };

        self.in_flight.remove(&task);
        self.stats.failed += 1;
        self.status = ExecutorStatus::Lost;
        error!(%task, worker, ?silence, "worker missed its heartbeat");

        Err(TsumikiError::WorkerFailure {
            task,
            worker,
            silent_ms: silence.as_millis(),
        })
    }

    /// Terminate the workers, already collected results are unaffected.
    pub(crate) fn stop(&mut self) {
        if self.is_stopped() {
            return;
        }

        self.status = ExecutorStatus::Stopped;
        self.in_flight.clear();

        if let Some(mut workers) = self.workers.take() {
            workers.heart.stop();
            info!("stopped executor");
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}
