use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Temporal record of one scheduled task: when it entered a ready queue,
/// when a worker picked it up, and when it finished running.
///
/// All three timestamps come from a steady clock, so for any dispatched
/// task `arrival <= start <= end`. The arrival stamp is written exactly
/// once; a task promoted by aging keeps its original arrival.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskStats {
    arrival: Option<Instant>,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl TaskStats {
    /// When the task became visible to workers. Set under the queue lock.
    pub fn arrival(&self) -> Option<Instant> {
        self.arrival
    }

    /// When a worker dequeued the task and began executing it.
    pub fn start(&self) -> Option<Instant> {
        self.start
    }

    /// When the task body finished, on both the success and failure paths.
    pub fn end(&self) -> Option<Instant> {
        self.end
    }

    /// Time spent queued: `start - arrival`. Zero until both are stamped.
    ///
    /// Returns a [`Duration`], so the caller picks the unit
    /// (`as_millis`, `as_micros`, ...).
    pub fn waiting_time(&self) -> Duration {
        match (self.arrival, self.start) {
            (Some(arrival), Some(start)) => start.saturating_duration_since(arrival),
            _ => Duration::ZERO,
        }
    }

    /// Time spent running: `end - start`. Zero until both are stamped.
    pub fn burst_time(&self) -> Duration {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Total time in the system: `end - arrival`. Zero until both are stamped.
    pub fn turnaround_time(&self) -> Duration {
        match (self.arrival, self.end) {
            (Some(arrival), Some(end)) => end.saturating_duration_since(arrival),
            _ => Duration::ZERO,
        }
    }

    #[inline]
    pub(crate) fn stamp_arrival(&mut self) {
        // Set-once: a promotion re-push must not refresh the stamp.
        if self.arrival.is_none() {
            self.arrival = Some(Instant::now());
        }
    }

    #[inline]
    pub(crate) fn stamp_start(&mut self) {
        self.start = Some(Instant::now());
    }

    #[inline]
    pub(crate) fn stamp_end(&mut self) {
        self.end = Some(Instant::now());
    }
}

/// Fixed log2 histogram for durations in nanoseconds.
/// Buckets: [0..1ns], [1..2ns], [2..4ns], ..., up to 2^63 ns.
#[derive(Clone, Copy, Debug)]
pub struct Log2Histogram {
    pub buckets: [u64; 64],
    pub count: u64,
    pub sum_ns: u128,
    pub max_ns: u64,
}

impl Log2Histogram {
    pub const fn new() -> Self {
        Self {
            buckets: [0; 64],
            count: 0,
            sum_ns: 0,
            max_ns: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, d: Duration) {
        let ns = d.as_nanos().min(u128::from(u64::MAX)) as u64;
        let idx = if ns == 0 {
            0
        } else {
            63 - ns.leading_zeros() as usize
        };
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_ns += ns as u128;
        if ns > self.max_ns {
            self.max_ns = ns;
        }
    }

    /// Arithmetic mean of recorded durations.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.sum_ns / self.count as u128) as u64)
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_ns)
    }
}

impl Default for Log2Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the scheduler's counters, taken with
/// [`Scheduler::metrics`](crate::Scheduler::metrics).
#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    /// Tasks accepted by `schedule`/`schedule_every`.
    pub scheduled: u64,
    /// Tasks popped and invoked by a worker.
    pub dispatched: u64,
    /// Dispatched tasks whose body panicked.
    pub failed: u64,
    /// Tasks moved to a higher priority by the aging sweep.
    pub promoted: u64,
    /// Tasks evicted from bounded queues, summed across priorities.
    pub discarded: u64,
    /// Submissions rejected synchronously (bad priority or stopped).
    pub rejected: u64,
    /// Tasks sitting in ready queues right now.
    pub pending: usize,
    pub waiting_ns: Log2Histogram,
    pub burst_ns: Log2Histogram,
}

/// Scheduler-wide counters. Counts are atomics so producers and workers
/// touch them without coordination; the latency histograms sit behind one
/// mutex, locked once per dispatched task.
pub(crate) struct Metrics {
    scheduled: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
    promoted: AtomicU64,
    rejected: AtomicU64,
    latencies: Mutex<Latencies>,
}

#[derive(Default)]
struct Latencies {
    waiting: Log2Histogram,
    burst: Log2Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            scheduled: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            promoted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            latencies: Mutex::new(Latencies::default()),
        }
    }

    #[inline]
    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_promoted(&self) {
        self.promoted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, stats: &TaskStats, ok: bool) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut latencies = self.latencies.lock();
        latencies.waiting.record(stats.waiting_time());
        latencies.burst.record(stats.burst_time());
    }

    pub fn snapshot(&self, discarded: u64, pending: usize) -> MetricsSnapshot {
        let latencies = self.latencies.lock();
        MetricsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded,
            pending,
            waiting_ns: latencies.waiting,
            burst_ns: latencies.burst,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn derived_durations_zero_until_stamped() {
        let stats = TaskStats::default();
        assert_eq!(stats.waiting_time(), Duration::ZERO);
        assert_eq!(stats.burst_time(), Duration::ZERO);
        assert_eq!(stats.turnaround_time(), Duration::ZERO);
    }

    #[test]
    fn stamps_are_monotonic() {
        let mut stats = TaskStats::default();
        stats.stamp_arrival();
        thread::sleep(Duration::from_millis(5));
        stats.stamp_start();
        thread::sleep(Duration::from_millis(5));
        stats.stamp_end();

        assert!(stats.arrival().unwrap() <= stats.start().unwrap());
        assert!(stats.start().unwrap() <= stats.end().unwrap());
        assert_eq!(
            stats.turnaround_time(),
            stats.waiting_time() + stats.burst_time()
        );
    }

    #[test]
    fn arrival_is_set_once() {
        let mut stats = TaskStats::default();
        stats.stamp_arrival();
        let first = stats.arrival().unwrap();
        thread::sleep(Duration::from_millis(5));
        stats.stamp_arrival();
        assert_eq!(stats.arrival().unwrap(), first);
    }

    #[test]
    fn histogram_buckets_by_log2() {
        let mut hist = Log2Histogram::new();
        hist.record(Duration::from_nanos(0));
        hist.record(Duration::from_nanos(1));
        hist.record(Duration::from_nanos(2));
        hist.record(Duration::from_nanos(3));
        hist.record(Duration::from_nanos(1024));

        assert_eq!(hist.buckets[0], 2); // 0ns and 1ns
        assert_eq!(hist.buckets[1], 2); // 2ns and 3ns
        assert_eq!(hist.buckets[10], 1); // 1024ns
        assert_eq!(hist.count, 5);
        assert_eq!(hist.max(), Duration::from_nanos(1024));
        assert_eq!(hist.mean(), Duration::from_nanos(206));
    }
}
