use std::time::Duration;

/// Which task gives way when a bounded queue overflows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discard {
    /// Evict from the head: the longest-queued task is dropped.
    Oldest,
    /// Evict from the tail: the youngest task is dropped. A push to a full
    /// queue still succeeds; the task it admitted is the one evicted.
    Newest,
}

/// Capacity limit applied to every priority queue.
#[derive(Clone, Copy, Debug)]
pub struct QueueBound {
    pub capacity: usize,
    pub discard: Discard,
}

/// Starvation mitigation. A queued task whose wait exceeds `after` is
/// moved up `step` priority levels, saturating at the highest level.
/// Promotion keeps the task's original arrival stamp, so once it reaches
/// a level it is older than everything that queued there normally.
#[derive(Clone, Copy, Debug)]
pub struct AgingPolicy {
    pub after: Duration,
    pub step: usize,
}
