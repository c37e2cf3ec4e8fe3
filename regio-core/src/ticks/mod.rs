//! Tick-ordered task storage and tick timing.
//!
//! Everything here is keyed by a tick counter (a region's own tick, or the global tick), never by
//! wall clock. That keeps delays stable when regions merge, split or fall behind.

mod delayed_queue;
mod scheduled_task;
mod tick_times;

pub use delayed_queue::DelayedQueue;
pub use scheduled_task::{Scheduled, TaskPriority};
pub use tick_times::{TickReport, TickTimes};
