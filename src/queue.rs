use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::policy::{Discard, QueueBound};
use crate::task::Task;

/// Ready queue for one priority level.
///
/// A FIFO behind a mutex. Nothing here blocks: every operation is
/// try-lock based and waiting belongs to the scheduler, so a producer or
/// worker that loses the race just retries.
pub(crate) struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    bound: Option<QueueBound>,
    done: AtomicBool,
    discarded: AtomicU64,
}

impl TaskQueue {
    pub fn new(bound: Option<QueueBound>) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            bound,
            done: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        }
    }

    /// Stamp the task's arrival under the queue lock and append it to the
    /// tail.
    ///
    /// For a bounded queue the eviction runs right after the append, which
    /// means a push never fails for capacity: under [`Discard::Newest`]
    /// the task just admitted is the one dropped.
    ///
    /// Returns the task back when the lock is contended or the queue has
    /// been marked done, so the caller can retry or give up.
    pub fn try_push(&self, mut task: Task) -> Result<(), Task> {
        if self.done.load(Ordering::Acquire) {
            return Err(task);
        }
        let Some(mut tasks) = self.tasks.try_lock() else {
            return Err(task);
        };
        task.stamp_arrival();
        tasks.push_back(task);
        self.enforce_bound(&mut tasks);
        Ok(())
    }

    /// Insert a task promoted by aging at the head, ahead of everything
    /// that queued here normally. The task keeps the arrival stamp from
    /// its original queue, so its recorded wait spans both levels.
    pub fn try_push_promoted(&self, task: Task) -> Result<(), Task> {
        if self.done.load(Ordering::Acquire) {
            return Err(task);
        }
        let Some(mut tasks) = self.tasks.try_lock() else {
            return Err(task);
        };
        tasks.push_front(task);
        self.enforce_bound(&mut tasks);
        Ok(())
    }

    fn enforce_bound(&self, tasks: &mut VecDeque<Task>) {
        let Some(bound) = self.bound else { return };
        while tasks.len() > bound.capacity {
            let evicted = match bound.discard {
                Discard::Oldest => tasks.pop_front(),
                Discard::Newest => tasks.pop_back(),
            };
            if let Some(evicted) = evicted {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = evicted.task_id(),
                    policy = ?bound.discard,
                    "queue over capacity, task discarded"
                );
            }
        }
    }

    /// Pop the head. `None` on lock contention or an empty queue.
    pub fn try_pop(&self) -> Option<Task> {
        let mut tasks = self.tasks.try_lock()?;
        tasks.pop_front()
    }

    /// Pop the head only if it has waited longer than `threshold`.
    pub fn try_pop_if_starved(&self, threshold: Duration) -> Option<Task> {
        let mut tasks = self.tasks.try_lock()?;
        let arrival = tasks.front()?.arrival()?;
        if arrival.elapsed() > threshold {
            tasks.pop_front()
        } else {
            None
        }
    }

    /// Refuse further pushes. Idempotent; queued tasks stay until popped
    /// or dropped with the queue.
    pub fn done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Tasks evicted by the bound since construction.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}
