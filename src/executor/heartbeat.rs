//! Liveness tracking of in-flight jobs.
//!
//! Every dispatched job gets a [`Pulse`]. While the job is alive a dedicated
//! heart thread keeps stamping it. A job that dies mid-flight drops its
//! [`PulseGuard`] during unwinding, stops being stamped, and its pulse ages
//! until the monitor notices. A job that returns marks its pulse finished
//! first, so it never counts as silent however late it is collected.
//!
//! The stamping happens on the heart thread, not inside the job. Only a job
//! that unwinds goes silent: a job stuck in a loop or blocked forever keeps
//! its pulse fresh and is never reported.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PulseState {
    epoch: Instant,
    /// Milliseconds since `epoch` of the last stamp.
    stamp: AtomicU64,
    alive: AtomicBool,
    finished: AtomicBool,
    worker: AtomicUsize,
}

impl PulseState {
    fn since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Pulse(Arc<PulseState>);

impl Pulse {
    fn new(epoch: Instant) -> Self {
        let state = PulseState {
            epoch,
            stamp: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            worker: AtomicUsize::new(0),
        };
        state.stamp.store(state.since_epoch(Instant::now()), Ordering::Relaxed);
        Self(Arc::new(state))
    }

    fn stamp(&self) {
        let now = self.0.since_epoch(Instant::now());
        self.0.stamp.store(now, Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        self.0.alive.load(Ordering::Acquire)
    }

    /// Set once the job returned, whether or not its result was collected.
    pub(crate) fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::Acquire)
    }

    /// Time since the last stamp.
    pub(crate) fn silence(&self, now: Instant) -> Duration {
        let last = self.0.stamp.load(Ordering::Relaxed);
        Duration::from_millis(self.0.since_epoch(now).saturating_sub(last))
    }

    pub(crate) fn worker(&self) -> usize {
        self.0.worker.load(Ordering::Relaxed)
    }

    /// The half of the pulse that travels with the job.
    pub(crate) fn guard(&self) -> PulseGuard {
        PulseGuard(self.0.clone())
    }
}

/// Keeps a pulse alive until dropped.
#[derive(Debug)]
pub(crate) struct PulseGuard(Arc<PulseState>);

impl PulseGuard {
    pub(crate) fn attach(&self, worker: usize) {
        self.0.worker.store(worker, Ordering::Relaxed);
    }

    /// The job returned normally. Not called when it unwinds.
    pub(crate) fn finish(self) {
        self.0.finished.store(true, Ordering::Release);
    }
}

impl Drop for PulseGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::Release);
    }
}

/// Background thread stamping live pulses every quarter of the interval.
#[derive(Debug)]
pub(crate) struct Heart {
    epoch: Instant,
    pulses: Arc<Mutex<Vec<Pulse>>>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heart {
    pub(crate) fn start(interval: Duration) -> std::io::Result<Self> {
        let pulses = Arc::new(Mutex::new(Vec::<Pulse>::new()));
        let (stop, stopped) = mpsc::channel::<()>();
        let period = (interval / 4).max(Duration::from_millis(1));

        let handle = thread::Builder::new()
            .name("tsumiki-heart".into())
            .spawn({
                let pulses = pulses.clone();
                move || {
                    while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(period) {
                        let mut pulses = pulses.lock().unwrap_or_else(PoisonError::into_inner);
                        pulses.retain(Pulse::is_alive);
                        pulses.iter().for_each(Pulse::stamp);
                    }
                }
            })?;

        Ok(Self {
            epoch: Instant::now(),
            pulses,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Start tracking a new job.
    pub(crate) fn track(&self) -> Pulse {
        let pulse = Pulse::new(self.epoch);
        self.pulses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pulse.clone());
        pulse
    }

    pub(crate) fn stop(&mut self) {
        // closing the channel ends the loop
        self.stop.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("heart thread panicked");
        }
    }
}

impl Drop for Heart {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_pulse_is_stamped() {
        let mut heart = Heart::start(Duration::from_millis(40)).unwrap();
        let pulse = heart.track();
        let _guard = pulse.guard();

        thread::sleep(Duration::from_millis(200));
        assert!(pulse.silence(Instant::now()) < Duration::from_millis(100));
        heart.stop();
    }

    #[test]
    fn test_dead_pulse_goes_silent() {
        let heart = Heart::start(Duration::from_millis(40)).unwrap();
        let pulse = heart.track();
        let guard = pulse.guard();
        guard.attach(3);
        drop(guard);

        thread::sleep(Duration::from_millis(200));
        assert!(pulse.silence(Instant::now()) >= Duration::from_millis(150));
        assert_eq!(pulse.worker(), 3);
        assert!(!pulse.is_finished());
    }

    #[test]
    fn test_finished_pulse() {
        let heart = Heart::start(Duration::from_millis(40)).unwrap();
        let pulse = heart.track();
        pulse.guard().finish();

        thread::sleep(Duration::from_millis(100));
        assert!(pulse.is_finished());
        assert!(!pulse.is_alive());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut heart = Heart::start(Duration::from_millis(10)).unwrap();
        heart.stop();
        heart.stop();
    }
}
