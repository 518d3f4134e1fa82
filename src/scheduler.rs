//! Time and scheduling seams for the supervision loops.
//!
//! The log tailer and the compliance timer never sleep on their own; they
//! register jobs with a [`Scheduler`]. Production code uses
//! [`ThreadScheduler`], tests drive [`ManualScheduler`] with virtual time so
//! every detection is deterministic. Stall and abandonment checks read the
//! current time through a [`Clock`] for the same reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Smallest interval a job may be scheduled at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Source of "now" for every time-based comparison.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Work executed on every tick of a scheduled job.
pub type Job = Box<dyn FnMut() + Send + 'static>;

/// Handle to a registered job. Cancelling is idempotent.
pub trait JobHandle: Send {
    fn cancel(&mut self);
    fn is_cancelled(&self) -> bool;
}

/// Runs jobs repeatedly at a fixed interval, the first run immediately.
pub trait Scheduler: Send + Sync {
    fn every(&self, name: &str, interval: Duration, job: Job) -> Result<Box<dyn JobHandle>>;
}

/// One background thread per job; sleeps are interruptible so cancel
/// returns promptly even for long intervals.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

struct ThreadJob {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl JobHandle for ThreadJob {
    fn cancel(&mut self) {
        // Dropping the sender wakes the sleeping thread with Disconnected.
        self.stop_tx.take();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.stop_tx.is_none()
    }
}

impl Drop for ThreadJob {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Scheduler for ThreadScheduler {
    fn every(&self, name: &str, interval: Duration, mut job: Job) -> Result<Box<dyn JobHandle>> {
        let interval = interval.max(MIN_INTERVAL);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_name = format!("sentinel-{name}");
        let label = name.to_string();

        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                loop {
                    job();
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(job = %label, "scheduled job stopped");
            })
            .with_context(|| format!("failed to spawn scheduler thread for {name}"))?;

        Ok(Box::new(ThreadJob {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

/// Virtual-time scheduler. Nothing runs until [`ManualScheduler::advance`]
/// is called; jobs registered since the last advance are due immediately.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualInner>>,
}

#[derive(Default)]
struct ManualInner {
    elapsed: Duration,
    jobs: Vec<ManualJob>,
}

struct ManualJob {
    name: String,
    interval: Duration,
    next_due: Duration,
    job: Job,
    cancelled: Arc<AtomicBool>,
}

struct ManualHandle {
    cancelled: Arc<AtomicBool>,
}

impl JobHandle for ManualHandle {
    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward, running every job that falls due on the
    /// way in due-time order.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let target = inner.elapsed + by;

        loop {
            let next = inner
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| !j.cancelled.load(Ordering::SeqCst) && j.next_due <= target)
                .min_by_key(|(_, j)| j.next_due)
                .map(|(i, _)| i);
            let Some(index) = next else {
                break;
            };

            let due = inner.jobs[index].next_due;
            if due > inner.elapsed {
                inner.elapsed = due;
            }
            let job = &mut inner.jobs[index];
            (job.job)();
            job.next_due += job.interval;
        }

        inner.elapsed = target;
        inner.jobs.retain(|j| !j.cancelled.load(Ordering::SeqCst));
    }

    /// Names of jobs that are still registered and not cancelled.
    pub fn active_jobs(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .jobs
            .iter()
            .filter(|j| !j.cancelled.load(Ordering::SeqCst))
            .map(|j| j.name.clone())
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn every(&self, name: &str, interval: Duration, job: Job) -> Result<Box<dyn JobHandle>> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let next_due = inner.elapsed;
        inner.jobs.push(ManualJob {
            name: name.to_string(),
            interval: interval.max(MIN_INTERVAL),
            next_due,
            job,
            cancelled: Arc::clone(&cancelled),
        });
        Ok(Box::new(ManualHandle { cancelled }))
    }
}
