#![doc = include_str!("../README.md")]

mod policy;
mod queue;
mod scheduler;
mod stats;
mod task;

pub use policy::{AgingPolicy, Discard, QueueBound};
pub use scheduler::{BuildError, ScheduleError, Scheduler, SchedulerBuilder};
pub use stats::{Log2Histogram, MetricsSnapshot, TaskStats};
pub use task::Task;
