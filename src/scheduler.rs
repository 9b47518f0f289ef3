use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;
use thiserror::Error;
use tracing::{debug, trace};

use crate::policy::{AgingPolicy, Discard, QueueBound};
use crate::queue::TaskQueue;
use crate::stats::{Metrics, MetricsSnapshot};
use crate::task::Task;

/// Rejection returned synchronously from [`Scheduler::schedule`].
///
/// The scheduler never retries on the caller's behalf; a producer that
/// sees a rejection decides for itself whether to re-submit.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("priority {priority} out of range (scheduler has {levels} levels)")]
    PriorityOutOfRange { priority: usize, levels: usize },

    #[error("scheduler is stopped")]
    Stopped,

    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Invalid configuration handed to [`SchedulerBuilder::build`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("priority level count must be at least 1")]
    NoPriorities,

    #[error("bounded queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("aging step must be at least 1")]
    ZeroStep,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// State shared between the scheduler handle, its workers and its timers.
struct Shared {
    /// One ready queue per priority level; index `len - 1` is highest.
    queues: Box<[TaskQueue]>,
    running: AtomicBool,
    /// Count of enqueue notifications not yet consumed by a dispatch.
    /// A counter rather than a flag: two enqueues followed by one consumed
    /// notification must still wake somebody for the second task.
    signal: Mutex<u64>,
    ready: Condvar,
    aging: Option<AgingPolicy>,
    metrics: Metrics,
}

impl Shared {
    #[inline]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Push with retry while running, then raise the enqueued signal.
    /// A failed `try_push` here means lock contention, not a full queue,
    /// so spinning is short-lived. Returns false when the scheduler
    /// stopped before the push landed.
    fn submit(&self, mut task: Task, priority: usize) -> bool {
        let id = task.task_id();
        loop {
            if !self.is_running() {
                return false;
            }
            match self.queues[priority].try_push(task) {
                Ok(()) => break,
                Err(back) => {
                    task = back;
                    thread::yield_now();
                }
            }
        }
        self.metrics.record_scheduled();
        trace!(priority, id, "task enqueued");

        let mut pending = self.signal.lock();
        *pending += 1;
        self.ready.notify_one();
        true
    }

    fn worker_loop(&self) {
        loop {
            {
                let mut pending = self.signal.lock();
                self.ready
                    .wait_while(&mut pending, |p| *p == 0 && self.is_running());
            }
            // Shutdown abandons still-queued work; only the task a worker
            // already holds runs to completion.
            if !self.is_running() {
                break;
            }

            if let Some(aging) = self.aging {
                self.aging_sweep(aging);
            }
            self.dispatch_one();
        }
    }

    /// One pass over the non-top levels, promoting at most one starved
    /// task per level. The promoted task keeps its arrival stamp and goes
    /// to the head of the higher queue, so it is typically the next task
    /// dispatched from that level.
    fn aging_sweep(&self, aging: AgingPolicy) {
        let levels = self.queues.len();
        for level in 0..levels - 1 {
            let Some(mut task) = self.queues[level].try_pop_if_starved(aging.after) else {
                continue;
            };
            let target = (level + aging.step).min(levels - 1);
            trace!(from = level, to = target, id = task.task_id(), "promoting starved task");
            self.metrics.record_promoted();

            loop {
                match self.queues[target].try_push_promoted(task) {
                    Ok(()) => break,
                    Err(back) => {
                        if !self.is_running() {
                            // Queued work is dropped at shutdown anyway.
                            break;
                        }
                        task = back;
                        thread::yield_now();
                    }
                }
            }
        }
    }

    /// Scan from the highest priority down and run the first task found.
    /// The signal counter tracks notifications, not queue depth, so a
    /// worker can wake to an already-drained backlog; it keeps rescanning
    /// until a task appears or shutdown is requested.
    fn dispatch_one(&self) {
        loop {
            for level in (0..self.queues.len()).rev() {
                let Some(mut task) = self.queues[level].try_pop() else {
                    continue;
                };
                self.consume_signal();
                trace!(priority = level, id = task.task_id(), "dispatching task");
                let ok = task.invoke();
                self.metrics.record_dispatch(task.stats(), ok);
                return;
            }
            if !self.is_running() {
                return;
            }
            thread::yield_now();
        }
    }

    fn consume_signal(&self) {
        let mut pending = self.signal.lock();
        *pending = pending.saturating_sub(1);
    }
}

/// Fluent constructor for [`Scheduler`].
///
/// ```
/// # fn main() -> Result<(), taskmill::BuildError> {
/// use std::time::Duration;
/// use taskmill::{Discard, Scheduler};
///
/// let scheduler = Scheduler::builder()
///     .workers(4)
///     .priorities(3)
///     .bounded(128, Discard::Oldest)
///     .aging(Duration::from_millis(250), 1)
///     .build()?;
/// scheduler.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Copy, Debug)]
pub struct SchedulerBuilder {
    workers: usize,
    priorities: usize,
    bound: Option<QueueBound>,
    aging: Option<AgingPolicy>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            workers: 1,
            priorities: 1,
            bound: None,
            aging: None,
        }
    }

    /// Size of the worker pool. Defaults to 1.
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Number of priority levels. Priority `count - 1` is highest.
    /// Defaults to 1, which degenerates to a plain FIFO pool.
    pub fn priorities(mut self, count: usize) -> Self {
        self.priorities = count;
        self
    }

    /// Cap every queue at `capacity` tasks, evicting per `discard` on
    /// overflow. Unbounded by default.
    pub fn bounded(mut self, capacity: usize, discard: Discard) -> Self {
        self.bound = Some(QueueBound { capacity, discard });
        self
    }

    /// Promote a task `step` levels once it has waited longer than
    /// `after`. Disabled by default.
    pub fn aging(mut self, after: Duration, step: usize) -> Self {
        self.aging = Some(AgingPolicy { after, step });
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        if self.workers == 0 {
            return Err(BuildError::NoWorkers);
        }
        if self.priorities == 0 {
            return Err(BuildError::NoPriorities);
        }
        if let Some(bound) = &self.bound {
            if bound.capacity == 0 {
                return Err(BuildError::ZeroCapacity);
            }
        }
        if let Some(aging) = &self.aging {
            if aging.step == 0 {
                return Err(BuildError::ZeroStep);
            }
        }

        let queues: Vec<TaskQueue> = (0..self.priorities)
            .map(|_| TaskQueue::new(self.bound))
            .collect();
        let shared = Arc::new(Shared {
            queues: queues.into_boxed_slice(),
            running: AtomicBool::new(true),
            signal: Mutex::new(0),
            ready: Condvar::new(),
            aging: self.aging,
            metrics: Metrics::new(),
        });

        let mut workers = Vec::with_capacity(self.workers);
        for n in 0..self.workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("taskmill-worker-{n}"))
                .spawn(move || worker_shared.worker_loop());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Unwind the part of the pool that did start.
                    shared.running.store(false, Ordering::Release);
                    shared.ready.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(BuildError::Spawn(e));
                }
            }
        }
        debug!(
            workers = self.workers,
            priorities = self.priorities,
            "scheduler started"
        );

        Ok(Scheduler {
            shared,
            workers: Mutex::new(workers),
            timers: Mutex::new(Vec::new()),
            timer_stop: Arc::new((Mutex::new(false), Condvar::new())),
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority task scheduler: a fixed pool of worker threads dispatching
/// from one ready queue per priority level.
///
/// Workers always prefer the highest non-empty priority; within a level,
/// tasks run in arrival order. See the crate docs for the full dispatch
/// and aging model.
///
/// Dropping the scheduler is equivalent to calling [`stop`](Self::stop).
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Lets `stop` interrupt periodic timers mid-sleep instead of waiting
    /// out their period.
    timer_stop: Arc<(Mutex<bool>, Condvar)>,
}

assert_impl_all!(Scheduler: Send, Sync);

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Submit a task at `priority` (`levels - 1` is highest).
    ///
    /// Returns as soon as the task is queued and one worker has been
    /// woken. Lock contention inside the push is retried internally; the
    /// only synchronous rejections are an out-of-range priority and a
    /// stopped scheduler. A bounded queue never rejects: overflow is
    /// resolved by the discard policy without notifying the producer.
    pub fn schedule(&self, task: Task, priority: usize) -> Result<(), ScheduleError> {
        self.check_priority(priority)?;
        if !self.shared.submit(task, priority) {
            self.shared.metrics.record_rejected();
            return Err(ScheduleError::Stopped);
        }
        Ok(())
    }

    /// Re-submit a clone of `task` at `priority` every `period`, starting
    /// immediately, until the scheduler stops.
    ///
    /// Each submission is an independent task with its own stats.
    pub fn schedule_every(
        &self,
        task: Task,
        priority: usize,
        period: Duration,
    ) -> Result<(), ScheduleError> {
        self.check_priority(priority)?;
        if !self.shared.is_running() {
            self.shared.metrics.record_rejected();
            return Err(ScheduleError::Stopped);
        }

        let shared = Arc::clone(&self.shared);
        let stop_pair = Arc::clone(&self.timer_stop);
        let n = self.timers.lock().len();
        let handle = thread::Builder::new()
            .name(format!("taskmill-timer-{n}"))
            .spawn(move || loop {
                if !shared.submit(task.clone(), priority) {
                    break;
                }
                let (lock, cvar) = &*stop_pair;
                let mut stopped = lock.lock();
                if !*stopped {
                    let _ = cvar.wait_for(&mut stopped, period);
                }
                if *stopped {
                    break;
                }
            })?;
        self.timers.lock().push(handle);
        Ok(())
    }

    /// Stop accepting work and wind the pool down.
    ///
    /// In-flight tasks run to completion and `stop` returns only after
    /// every worker has exited. Tasks still queued are dropped without
    /// firing any callback. Idempotent; later calls return immediately.
    ///
    /// Must not be called from inside a task body, since a worker cannot
    /// join itself.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);

        {
            let (lock, cvar) = &*self.timer_stop;
            let mut stopped = lock.lock();
            *stopped = true;
            cvar.notify_all();
        }
        let timers: Vec<_> = self.timers.lock().drain(..).collect();
        for handle in timers {
            let _ = handle.join();
        }

        for queue in self.shared.queues.iter() {
            queue.done();
        }
        self.shared.ready.notify_all();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let joined = !workers.is_empty();
        for handle in workers {
            let _ = handle.join();
        }
        if joined {
            debug!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Number of priority levels.
    pub fn priorities(&self) -> usize {
        self.shared.queues.len()
    }

    /// Tasks currently sitting in ready queues.
    pub fn pending(&self) -> usize {
        self.shared.queues.iter().map(|q| q.len()).sum()
    }

    /// Counters and latency histograms accumulated since construction.
    pub fn metrics(&self) -> MetricsSnapshot {
        let discarded = self.shared.queues.iter().map(|q| q.discarded()).sum();
        self.shared.metrics.snapshot(discarded, self.pending())
    }

    fn check_priority(&self, priority: usize) -> Result<(), ScheduleError> {
        let levels = self.shared.queues.len();
        if priority >= levels {
            self.shared.metrics.record_rejected();
            return Err(ScheduleError::PriorityOutOfRange { priority, levels });
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
