use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::stats::TaskStats;

type ExecuteFn = dyn Fn() + Send + Sync;
type CompleteFn = dyn Fn(&TaskStats) + Send + Sync;
type ErrorFn = dyn Fn(&TaskStats, &str) + Send + Sync;

/// A schedulable unit of work: the job body plus optional completion and
/// error hooks, with the task's temporal stats embedded.
///
/// Callbacks are shared behind [`Arc`], so a configured task is cheap to
/// clone and one template can be submitted many times; each submission
/// carries its own stats.
///
/// Lifecycle: built by a producer, owned by a ready queue after a
/// successful push, moved into a worker on pop, invoked, then dropped
/// once its callbacks return.
#[derive(Clone, Default)]
pub struct Task {
    id: Option<u64>,
    execute: Option<Arc<ExecuteFn>>,
    complete: Option<Arc<CompleteFn>>,
    error: Option<Arc<ErrorFn>>,
    stats: TaskStats,
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    /// Numeric label used in log events. Never interpreted by the scheduler.
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The work itself. A task with no body is legal and completes
    /// immediately when dispatched.
    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.execute = Some(Arc::new(f));
        self
    }

    /// Invoked exactly once per dispatched task, after `on_error` when the
    /// body failed.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskStats) + Send + Sync + 'static,
    {
        self.complete = Some(Arc::new(f));
        self
    }

    /// Invoked when the body panics, with the panic message, before
    /// `on_complete`.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskStats, &str) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    #[inline]
    pub(crate) fn task_id(&self) -> Option<u64> {
        self.id
    }

    /// Called by the owning queue, under the queue lock, right before the
    /// task becomes visible to workers. Set-once.
    #[inline]
    pub(crate) fn stamp_arrival(&mut self) {
        self.stats.stamp_arrival();
    }

    #[inline]
    pub(crate) fn arrival(&self) -> Option<Instant> {
        self.stats.arrival()
    }

    /// Run the body and fire the hooks. Returns false when the body
    /// panicked. Hook panics are trapped and logged so a misbehaving
    /// callback can never take a worker down.
    pub(crate) fn invoke(&mut self) -> bool {
        self.stats.stamp_start();
        let outcome = match &self.execute {
            Some(f) => {
                let body = f.as_ref();
                panic::catch_unwind(AssertUnwindSafe(body)).map_err(panic_message)
            }
            None => Ok(()),
        };
        self.stats.stamp_end();

        if let Err(message) = &outcome {
            if let Some(f) = &self.error {
                let hook = f.as_ref();
                if panic::catch_unwind(AssertUnwindSafe(|| hook(&self.stats, message))).is_err() {
                    warn!(id = self.id, "error callback panicked");
                }
            }
        }
        if let Some(f) = &self.complete {
            let hook = f.as_ref();
            if panic::catch_unwind(AssertUnwindSafe(|| hook(&self.stats))).is_err() {
                warn!(id = self.id, "completion callback panicked");
            }
        }
        outcome.is_ok()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("on_execute", &self.execute.is_some())
            .field("on_complete", &self.complete.is_some())
            .field("on_error", &self.error.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn invoke_runs_body_and_completion_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let completions = Arc::new(AtomicU32::new(0));

        let runs2 = runs.clone();
        let completions2 = completions.clone();
        let mut task = Task::new()
            .on_execute(move || {
                runs2.fetch_add(1, Ordering::SeqCst);
            })
            .on_complete(move |stats| {
                assert!(stats.start().is_some());
                assert!(stats.end().is_some());
                completions2.fetch_add(1, Ordering::SeqCst);
            });

        assert!(task.invoke());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_task_completes() {
        let mut task = Task::new();
        assert!(task.invoke());
        assert!(task.stats().start().is_some());
        assert!(task.stats().end().is_some());
    }

    #[test]
    fn panic_reaches_error_hook_before_completion() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_err = order.clone();
        let order_done = order.clone();
        let mut task = Task::new()
            .on_execute(|| panic!("boom"))
            .on_error(move |stats, message| {
                assert_eq!(message, "boom");
                assert!(stats.end().is_some());
                order_err.lock().unwrap().push("error");
            })
            .on_complete(move |_| {
                order_done.lock().unwrap().push("complete");
            });

        assert!(!task.invoke());
        assert_eq!(*order.lock().unwrap(), vec!["error", "complete"]);
    }

    #[test]
    fn panicking_hooks_do_not_stop_completion() {
        let completions = Arc::new(AtomicU32::new(0));

        let completions2 = completions.clone();
        let mut task = Task::new()
            .on_execute(|| panic!("body"))
            .on_error(|_, _| panic!("hook"))
            .on_complete(move |_| {
                completions2.fetch_add(1, Ordering::SeqCst);
            });

        assert!(!task.invoke());
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn formatted_panic_message_is_forwarded() {
        let seen = Arc::new(Mutex::new(String::new()));

        let seen2 = seen.clone();
        let mut task = Task::new()
            .on_execute(|| panic!("bad input: {}", 42))
            .on_error(move |_, message| {
                *seen2.lock().unwrap() = message.to_string();
            });

        assert!(!task.invoke());
        assert_eq!(*seen.lock().unwrap(), "bad input: 42");
    }

    #[test]
    fn clones_share_callbacks_but_not_stats() {
        let runs = Arc::new(AtomicU32::new(0));

        let runs2 = runs.clone();
        let template = Task::new().id(7).on_execute(move || {
            runs2.fetch_add(1, Ordering::SeqCst);
        });

        let mut first = template.clone();
        let mut second = template.clone();
        assert!(first.invoke());
        assert!(second.invoke());

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(template.stats().start().is_none());
        assert!(first.stats().start().is_some());
    }
}
