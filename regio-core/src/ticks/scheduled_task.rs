//! Scheduled entry types.

use std::cmp::Ordering;

use serde::Deserialize;

/// Priority level for scheduled work.
///
/// When several entries become due on the same tick they run in priority order (higher priority
/// first), then in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum TaskPriority {
    /// Extremely high priority (-3)
    ExtremelyHigh = -3,
    /// Very high priority (-2)
    VeryHigh = -2,
    /// High priority (-1)
    High = -1,
    /// Normal priority (0) - default
    #[default]
    Normal = 0,
    /// Low priority (1)
    Low = 1,
    /// Very low priority (2)
    VeryLow = 2,
    /// Extremely low priority (3)
    ExtremelyLow = 3,
}

impl TaskPriority {
    /// Returns the numeric value of this priority.
    /// Lower values = higher priority.
    #[inline]
    #[must_use]
    pub const fn value(self) -> i8 {
        self as i8
    }
}

impl PartialOrd for TaskPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority (lower numeric value) is Greater for BinaryHeap.
        other.value().cmp(&self.value())
    }
}

/// A payload waiting for a tick.
#[derive(Debug)]
pub struct Scheduled<T> {
    /// The scheduled payload.
    pub payload: T,
    /// The tick on which this becomes due.
    pub trigger_tick: u64,
    /// Priority among entries due on the same tick.
    pub priority: TaskPriority,
    /// Submission order among entries with the same `trigger_tick` and priority.
    /// Lower values run first.
    pub sub_tick_order: u64,
}

impl<T> Scheduled<T> {
    /// Creates an entry with normal priority.
    pub const fn new(payload: T, trigger_tick: u64, sub_tick_order: u64) -> Self {
        Self {
            payload,
            trigger_tick,
            priority: TaskPriority::Normal,
            sub_tick_order,
        }
    }

    /// Creates an entry with the given priority.
    pub const fn with_priority(
        payload: T,
        trigger_tick: u64,
        priority: TaskPriority,
        sub_tick_order: u64,
    ) -> Self {
        Self {
            payload,
            trigger_tick,
            priority,
            sub_tick_order,
        }
    }
}

// Payloads are usually boxed closures, so ordering only ever looks at the timing fields.
impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.trigger_tick == other.trigger_tick
            && self.priority == other.priority
            && self.sub_tick_order == other.sub_tick_order
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    /// `BinaryHeap` is a max-heap, so the comparison is reversed to pop the earliest entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .trigger_tick
            .cmp(&self.trigger_tick)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.sub_tick_order.cmp(&self.sub_tick_order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_ordering() {
        // Earlier trigger_tick should come first
        let a = Scheduled::new((), 100, 0);
        let b = Scheduled::new((), 200, 0);
        assert!(a > b);

        // Same trigger_tick, higher priority should come first
        let c = Scheduled::with_priority((), 100, TaskPriority::High, 7);
        let d = Scheduled::with_priority((), 100, TaskPriority::Normal, 0);
        assert!(c > d);

        // Same trigger_tick and priority, lower sub_tick_order should come first
        let e = Scheduled::new((), 100, 5);
        let f = Scheduled::new((), 100, 10);
        assert!(e > f);
    }
}
